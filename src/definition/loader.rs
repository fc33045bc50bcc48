//! Definition document loader and load-time validator.
//!
//! Parsing happens in two passes. Serde turns the document into raw structs;
//! the validator then converts them into the model, checking every cross
//! reference on the way. Anything that could fail at run time because of the
//! configuration is rejected here instead.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::model::*;
use super::reference::DocRef;
use crate::dispatch;
use crate::error::ConfigError;
use crate::{params, rules};
use crate::tags::{TagCatalog, TagDefinition, TagKind, TagValue};

/// The only definition document version this build understands.
pub const DEFINITION_VERSION: u32 = 1;

/// Default lower bound on multi_condition list length.
pub const DEFAULT_MIN_ITEMS: usize = 2;

const STEP_KINDS: [&str; 5] = ["action", "validation", "time_delay", "repeat", "action_group"];

// =============================================================================
// Raw document
// =============================================================================

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDefinitions {
    version: u32,
    #[serde(default)]
    tags: Vec<TagDefinition>,
    #[serde(default)]
    state_rules: HashMap<String, RawRule>,
    #[serde(default)]
    time_delays: HashMap<String, f64>,
    #[serde(default)]
    action_groups: HashMap<String, RawGroup>,
    #[serde(default)]
    sequences: HashMap<String, RawSequence>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawRule {
    Comparison {
        tag: String,
        operator: Operator,
        value: RawOperand,
        #[serde(default)]
        defaults: HashMap<String, TagValue>,
    },
    MultiCondition {
        #[serde(rename = "minItems", default)]
        min_items: Option<usize>,
        conditions: Vec<RawCondition>,
        #[serde(default)]
        defaults: HashMap<String, TagValue>,
    },
}

#[derive(Deserialize)]
struct RawCondition {
    tag: String,
    operator: Operator,
    value: RawOperand,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawOperand {
    Param { param: String },
    Literal(TagValue),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGroup {
    #[serde(default)]
    description: String,
    #[serde(default)]
    requires: Vec<Map<String, Value>>,
    steps: Vec<Value>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSequence {
    #[serde(default)]
    description: String,
    action_groups: Vec<String>,
    #[serde(default)]
    documents: HashMap<String, DocumentId>,
}

// =============================================================================
// Entry points
// =============================================================================

/// Loads a definition document from disk. `.yaml`/`.yml` files are parsed as
/// YAML, anything else as JSON.
pub fn load_definitions(path: impl AsRef<Path>) -> Result<Definitions, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let defs = if yaml {
        Definitions::from_yaml_str(&text)?
    } else {
        Definitions::from_json_str(&text)?
    };
    info!(
        path = %path.display(),
        groups = defs.groups.len(),
        sequences = defs.sequences.len(),
        rules = defs.rules.len(),
        "definitions loaded"
    );
    Ok(defs)
}

impl Definitions {
    /// Parses and validates a JSON definition document.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_value(value)
    }

    /// Parses and validates a YAML definition document.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let value: Value =
            serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_value(value)
    }

    /// Validates an already-parsed document.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let raw: RawDefinitions =
            serde_json::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
        build(raw)
    }
}

// =============================================================================
// Validation
// =============================================================================

fn build(raw: RawDefinitions) -> Result<Definitions, ConfigError> {
    if raw.version != DEFINITION_VERSION {
        return Err(ConfigError::UnsupportedVersion {
            found: raw.version,
            expected: DEFINITION_VERSION,
        });
    }

    let mut tags = TagCatalog::standard();
    for def in raw.tags {
        tags.insert(def);
    }

    let mut delays = HashMap::with_capacity(raw.time_delays.len());
    for (name, secs) in raw.time_delays {
        let duration = positive_duration(secs).ok_or(ConfigError::InvalidDelay {
            name: name.clone(),
            value: secs,
        })?;
        delays.insert(name, duration);
    }

    let mut rules = HashMap::with_capacity(raw.state_rules.len());
    for (name, rule) in raw.state_rules {
        let rule = build_rule(&name, rule, &tags)?;
        rules.insert(name, rule);
    }

    let ctx = GroupContext {
        rules: &rules,
        delays: &delays,
        tags: &tags,
    };
    let mut groups = HashMap::with_capacity(raw.action_groups.len());
    for (name, group) in raw.action_groups {
        let group = ctx.build_group(&name, group)?;
        groups.insert(name, group);
    }

    check_group_refs(&groups)?;
    if let Some(cycle) = find_cycle(&groups) {
        return Err(ConfigError::GroupCycle(cycle));
    }

    let mut defs = Definitions {
        version: raw.version,
        tags: Arc::new(tags),
        rules: Arc::new(rules),
        delays,
        groups,
        sequences: HashMap::new(),
    };

    let mut sequences = HashMap::with_capacity(raw.sequences.len());
    for (id, seq) in raw.sequences {
        let seq = SequenceDef {
            id: id.clone(),
            description: seq.description,
            action_groups: seq.action_groups,
            documents: seq.documents,
        };
        check_sequence(&defs, &seq)?;
        sequences.insert(id, seq);
    }
    defs.sequences = sequences;
    Ok(defs)
}

fn positive_duration(secs: f64) -> Option<Duration> {
    if secs.is_finite() && secs > 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}

fn build_rule(name: &str, raw: RawRule, tags: &TagCatalog) -> Result<StateRule, ConfigError> {
    let (kind, defaults) = match raw {
        RawRule::Comparison {
            tag,
            operator,
            value,
            defaults,
        } => (
            RuleKind::Comparison(build_condition(RawCondition {
                tag,
                operator,
                value,
            })),
            defaults,
        ),
        RawRule::MultiCondition {
            min_items,
            conditions,
            defaults,
        } => {
            let min_items = min_items.unwrap_or(DEFAULT_MIN_ITEMS);
            if conditions.len() < min_items {
                return Err(ConfigError::TooFewConditions {
                    rule: name.to_string(),
                    found: conditions.len(),
                    min_items,
                });
            }
            let conditions = conditions.into_iter().map(build_condition).collect();
            (
                RuleKind::MultiCondition {
                    min_items,
                    conditions,
                },
                defaults,
            )
        }
    };

    let rule = StateRule {
        name: name.to_string(),
        kind,
        defaults,
    };
    let context = format!("state rule '{name}'");
    for condition in rule.conditions() {
        let def = tags
            .get(&condition.tag)
            .ok_or_else(|| ConfigError::UnknownTag {
                context: context.clone(),
                tag: condition.tag.clone(),
            })?;
        if !def.access.readable() {
            return Err(ConfigError::TagMismatch {
                context,
                tag: condition.tag.clone(),
                reason: "tag is write-only".to_string(),
            });
        }
        let operand = match &condition.value {
            Operand::Literal(v) => Some(*v),
            Operand::Param(p) => rule.defaults.get(p).copied(),
        };
        if let Some(value) = operand {
            check_operand(&context, condition, def.kind, value)?;
        }
    }
    Ok(rule)
}

/// Rejects an operand that can never be compared against the condition's tag.
fn check_operand(
    context: &str,
    condition: &Condition,
    kind: TagKind,
    value: TagValue,
) -> Result<(), ConfigError> {
    if rules::compare(condition.operator, TagValue::zero(kind), value).is_some() {
        return Ok(());
    }
    Err(ConfigError::TagMismatch {
        context: context.to_string(),
        tag: condition.tag.clone(),
        reason: format!(
            "cannot apply '{}' to a {kind} tag and {value}",
            condition.operator
        ),
    })
}

fn build_condition(raw: RawCondition) -> Condition {
    Condition {
        tag: raw.tag,
        operator: raw.operator,
        value: match raw.value {
            RawOperand::Param { param } => Operand::Param(param),
            RawOperand::Literal(v) => Operand::Literal(v),
        },
    }
}

struct GroupContext<'a> {
    rules: &'a HashMap<String, StateRule>,
    delays: &'a HashMap<String, Duration>,
    tags: &'a TagCatalog,
}

impl GroupContext<'_> {
    fn build_group(&self, name: &str, raw: RawGroup) -> Result<ActionGroup, ConfigError> {
        let mut requires = Vec::new();
        for item in raw.requires {
            for (req, kind) in item {
                requires.push(Requirement {
                    name: req,
                    kind: kind.as_str().unwrap_or_default().to_string(),
                });
            }
        }
        let steps = self.build_steps(name, "", &raw.steps)?;
        debug!(group = name, steps = steps.len(), "action group validated");
        Ok(ActionGroup {
            name: name.to_string(),
            description: raw.description,
            requires,
            steps,
        })
    }

    fn build_steps(
        &self,
        group: &str,
        prefix: &str,
        raw: &[Value],
    ) -> Result<Vec<Step>, ConfigError> {
        raw.iter()
            .enumerate()
            .map(|(i, value)| self.build_step(group, &format!("{prefix}{i}"), value))
            .collect()
    }

    fn build_step(&self, group: &str, path: &str, value: &Value) -> Result<Step, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidStep {
            group: group.to_string(),
            path: path.to_string(),
            reason,
        };

        let obj = value
            .as_object()
            .ok_or_else(|| invalid(format!("expected an object, got {value}")))?;
        let kinds: Vec<&str> = STEP_KINDS
            .iter()
            .copied()
            .filter(|k| obj.contains_key(*k))
            .collect();
        let kind = match kinds.as_slice() {
            [kind] => *kind,
            [] => {
                return Err(invalid(format!(
                    "expected one of {}",
                    STEP_KINDS.join(", ")
                )))
            }
            _ => return Err(invalid(format!("ambiguous step kinds {}", kinds.join(", ")))),
        };

        let allowed: &[&str] = match kind {
            "action" => &["action", "from", "parameters"],
            "validation" => &["validation", "parameters"],
            _ => &[kind],
        };
        if let Some(extra) = obj.keys().find(|k| !allowed.contains(&k.as_str())) {
            return Err(invalid(format!("unexpected key '{extra}' on {kind} step")));
        }

        let name = |key: &str| -> Result<String, ConfigError> {
            obj.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| invalid(format!("'{key}' must be a string")))
        };

        match kind {
            "action" => {
                let action = name("action")?;
                let spec = dispatch::lookup(&action).ok_or_else(|| ConfigError::UnknownAction {
                    group: group.to_string(),
                    action: action.clone(),
                })?;
                spec.check_tags(self.tags)?;

                let from = match obj.get("from") {
                    None => None,
                    Some(Value::String(s)) => Some(DocRef::parse(s)?),
                    Some(other) => return Err(invalid(format!("'from' must be a string, got {other}"))),
                };
                let parameters = match obj.get("parameters") {
                    None => Vec::new(),
                    Some(Value::Object(map)) => map
                        .iter()
                        .map(|(k, v)| Ok((k.clone(), arg_source(v)?)))
                        .collect::<Result<Vec<_>, ConfigError>>()?,
                    Some(other) => {
                        return Err(invalid(format!("'parameters' must be an object, got {other}")))
                    }
                };
                Ok(Step::Action(ActionStep {
                    name: action,
                    from,
                    parameters,
                }))
            }
            "validation" => {
                let rule_name = name("validation")?;
                let rule = self
                    .rules
                    .get(&rule_name)
                    .ok_or_else(|| ConfigError::UnknownRule {
                        group: group.to_string(),
                        rule: rule_name.clone(),
                    })?;
                self.build_validation(group, rule, obj.get("parameters"), &invalid)
            }
            "time_delay" => {
                let delay = name("time_delay")?;
                let duration = *self
                    .delays
                    .get(&delay)
                    .ok_or_else(|| ConfigError::UnknownDelay {
                        group: group.to_string(),
                        delay: delay.clone(),
                    })?;
                Ok(Step::TimeDelay(TimeDelayStep {
                    name: delay,
                    duration,
                }))
            }
            "repeat" => {
                let body = obj
                    .get("repeat")
                    .and_then(Value::as_object)
                    .ok_or_else(|| invalid("'repeat' must be an object".to_string()))?;
                if let Some(extra) = body.keys().find(|k| *k != "count" && *k != "steps") {
                    return Err(invalid(format!("unexpected key '{extra}' in repeat")));
                }
                let count = match body.get("count") {
                    Some(Value::String(s)) => CountExpr::Reference(DocRef::parse(s)?),
                    Some(other) => {
                        let literal = params::whole_number(other)
                            .filter(|c| *c >= 1)
                            .and_then(|c| u32::try_from(c).ok());
                        match literal {
                            Some(c) => CountExpr::Literal(c),
                            None => {
                                return Err(ConfigError::InvalidRepeatCount {
                                    group: group.to_string(),
                                    count: other.to_string(),
                                })
                            }
                        }
                    }
                    None => return Err(invalid("repeat needs a 'count'".to_string())),
                };
                let steps = body
                    .get("steps")
                    .and_then(Value::as_array)
                    .ok_or_else(|| invalid("repeat needs a 'steps' list".to_string()))?;
                let steps = self.build_steps(group, &format!("{path}.repeat."), steps)?;
                Ok(Step::Repeat(RepeatStep { count, steps }))
            }
            _ => Ok(Step::ActionGroupRef(name("action_group")?)),
        }
    }

    fn build_validation(
        &self,
        group: &str,
        rule: &StateRule,
        parameters: Option<&Value>,
        invalid: &dyn Fn(String) -> ConfigError,
    ) -> Result<Step, ConfigError> {
        let missing_timeout = || ConfigError::MissingTimeout {
            group: group.to_string(),
            rule: rule.name.clone(),
        };
        let parameters = match parameters {
            None => return Err(missing_timeout()),
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(invalid(format!("'parameters' must be an object, got {other}")))
            }
        };

        let timeout = parameters.get("timeout").ok_or_else(missing_timeout)?;
        let timeout = timeout
            .as_f64()
            .and_then(positive_duration)
            .ok_or_else(|| ConfigError::InvalidTimeout {
                group: group.to_string(),
                rule: rule.name.clone(),
                value: timeout.to_string(),
            })?;

        let mut params = HashMap::new();
        for (key, value) in parameters.iter().filter(|(k, _)| *k != "timeout") {
            let v = TagValue::from_json(value).ok_or_else(|| {
                invalid(format!("parameter '{key}' must be a boolean or number, got {value}"))
            })?;
            params.insert(key.clone(), v);
        }

        for param in rule.params() {
            if !params.contains_key(param) && !rule.defaults.contains_key(param) {
                return Err(ConfigError::MissingRuleParam {
                    group: group.to_string(),
                    rule: rule.name.clone(),
                    param: param.to_string(),
                });
            }
        }

        let context = format!("validation '{}' in group '{group}'", rule.name);
        for condition in rule.conditions() {
            let Operand::Param(p) = &condition.value else {
                continue;
            };
            let value = params.get(p).or_else(|| rule.defaults.get(p)).copied();
            if let (Some(value), Some(def)) = (value, self.tags.get(&condition.tag)) {
                check_operand(&context, condition, def.kind, value)?;
            }
        }

        Ok(Step::Validation(ValidationStep {
            rule: rule.name.clone(),
            timeout,
            params,
        }))
    }
}

/// A string value shaped like `{doc}...` is a reference; anything else is a
/// literal argument.
fn arg_source(value: &Value) -> Result<ArgSource, ConfigError> {
    match value {
        Value::String(s) if s.trim_start().starts_with('{') => {
            Ok(ArgSource::Reference(DocRef::parse(s)?))
        }
        other => Ok(ArgSource::Literal(other.clone())),
    }
}

// =============================================================================
// Cross-reference checks
// =============================================================================

fn group_refs<'a>(steps: &'a [Step], out: &mut Vec<&'a str>) {
    for step in steps {
        match step {
            Step::ActionGroupRef(g) => out.push(g),
            Step::Repeat(r) => group_refs(&r.steps, out),
            _ => {}
        }
    }
}

fn check_group_refs(groups: &HashMap<String, ActionGroup>) -> Result<(), ConfigError> {
    for (name, group) in groups {
        let mut refs = Vec::new();
        group_refs(&group.steps, &mut refs);
        if let Some(missing) = refs.into_iter().find(|r| !groups.contains_key(*r)) {
            return Err(ConfigError::UnknownGroup {
                referenced_by: name.clone(),
                group: missing.to_string(),
            });
        }
    }
    Ok(())
}

/// Depth-first search for an ActionGroupRef cycle. Returns the cycle path with
/// its first group repeated at the end.
fn find_cycle(groups: &HashMap<String, ActionGroup>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        name: &'a str,
        groups: &'a HashMap<String, ActionGroup>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(name) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|n| *n == name)?;
                let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(name.to_string());
                return Some(cycle);
            }
            None => {}
        }

        marks.insert(name, Mark::Visiting);
        stack.push(name);
        if let Some(group) = groups.get(name) {
            let mut refs = Vec::new();
            group_refs(&group.steps, &mut refs);
            for child in refs {
                if let Some(cycle) = visit(child, groups, marks, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        marks.insert(name, Mark::Done);
        None
    }

    let mut names: Vec<&str> = groups.keys().map(String::as_str).collect();
    names.sort_unstable();
    let mut marks = HashMap::new();
    let mut stack = Vec::new();
    names
        .into_iter()
        .find_map(|name| visit(name, groups, &mut marks, &mut stack))
}

fn doc_refs<'a>(steps: &'a [Step], out: &mut Vec<&'a DocRef>) {
    for step in steps {
        match step {
            Step::Action(a) => {
                out.extend(a.from.iter());
                out.extend(a.parameters.iter().filter_map(|(_, src)| match src {
                    ArgSource::Reference(r) => Some(r),
                    ArgSource::Literal(_) => None,
                }));
            }
            Step::Repeat(r) => {
                if let CountExpr::Reference(doc) = &r.count {
                    out.push(doc);
                }
                doc_refs(&r.steps, out);
            }
            _ => {}
        }
    }
}

fn check_sequence(defs: &Definitions, seq: &SequenceDef) -> Result<(), ConfigError> {
    if seq.action_groups.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "sequence '{}' has no action groups",
            seq.id
        )));
    }
    for name in &seq.action_groups {
        if defs.group(name).is_none() {
            return Err(ConfigError::UnknownGroup {
                referenced_by: seq.id.clone(),
                group: name.clone(),
            });
        }
    }

    for name in defs.reachable_groups(&seq.action_groups) {
        let Some(group) = defs.group(name) else {
            continue;
        };
        let unsatisfied = |requirement: &str| ConfigError::UnsatisfiedRequirement {
            sequence: seq.id.clone(),
            group: name.to_string(),
            requirement: requirement.to_string(),
        };
        for req in &group.requires {
            if !seq.documents.contains_key(&req.name) {
                return Err(unsatisfied(&req.name));
            }
        }
        let mut refs = Vec::new();
        doc_refs(&group.steps, &mut refs);
        if let Some(r) = refs
            .into_iter()
            .find(|r| !seq.documents.contains_key(&r.document))
        {
            return Err(unsatisfied(&r.document));
        }
    }
    Ok(())
}
