//! Validated definition model.
//!
//! Everything here is produced by the loader and is immutable afterwards.
//! `Step` is a closed set: a document that does not parse into one of the
//! five kinds is rejected at load time.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::reference::DocRef;
use crate::tags::{TagCatalog, TagValue};

/// One named document an action group needs before it can run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requirement {
    /// Document name steps refer to as `{name}`.
    pub name: String,
    /// Declared type string, e.g. `"string"`. Informational only.
    pub kind: String,
}

/// Named, reusable list of steps.
#[derive(Clone, Debug)]
pub struct ActionGroup {
    /// Group name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Documents the group needs.
    pub requires: Vec<Requirement>,
    /// Steps, run in order.
    pub steps: Vec<Step>,
}

/// One node of an action group.
#[derive(Clone, Debug)]
pub enum Step {
    /// Writes tags through a dotted action.
    Action(ActionStep),
    /// Waits until a state rule holds.
    Validation(ValidationStep),
    /// Waits a named delay.
    TimeDelay(TimeDelayStep),
    /// Runs nested steps a number of times.
    Repeat(RepeatStep),
    /// Inlines another action group.
    ActionGroupRef(String),
}

/// Atomic hardware action. `from` supplies a base argument object that the
/// `parameters` entries override field by field.
#[derive(Clone, Debug)]
pub struct ActionStep {
    /// Dotted action name, e.g. `valves.vent_valve`.
    pub name: String,
    /// Base argument object.
    pub from: Option<DocRef>,
    /// Overrides laid over the base, in document order.
    pub parameters: Vec<(String, ArgSource)>,
}

/// Value of one `parameters` entry.
#[derive(Clone, Debug, PartialEq)]
pub enum ArgSource {
    /// Used as written.
    Literal(Value),
    /// A string entry of the form `{doc}.path`, resolved at bind time.
    Reference(DocRef),
}

/// Poll a state rule until it holds or `timeout` elapses.
#[derive(Clone, Debug)]
pub struct ValidationStep {
    /// State rule name.
    pub rule: String,
    /// Time allowed for the rule to hold.
    pub timeout: Duration,
    /// Rule thresholds (everything except `timeout`).
    pub params: HashMap<String, TagValue>,
}

/// Wait for a named, configured duration.
#[derive(Clone, Debug)]
pub struct TimeDelayStep {
    /// Delay name.
    pub name: String,
    /// How long to wait.
    pub duration: Duration,
}

/// Run `steps` `count` times, strictly in sequence.
#[derive(Clone, Debug)]
pub struct RepeatStep {
    /// How many times to run `steps`.
    pub count: CountExpr,
    /// Body of the repeat.
    pub steps: Vec<Step>,
}

/// Repeat count: a literal, or a document reference resolved when the
/// sequence is bound, before any step runs.
#[derive(Clone, Debug, PartialEq)]
pub enum CountExpr {
    /// Fixed count.
    Literal(u32),
    /// Document value, a positive integer.
    Reference(DocRef),
}

impl fmt::Display for CountExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CountExpr::Literal(n) => write!(f, "{n}"),
            CountExpr::Reference(r) => write!(f, "{r}"),
        }
    }
}

// =============================================================================
// State rules
// =============================================================================

/// Comparison operator for rule conditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// `actual == expected`
    Equal,
    /// `actual != expected`
    NotEqual,
    /// `actual < expected`
    LessThan,
    /// `actual <= expected`
    LessThanEqual,
    /// `actual > expected`
    GreaterThan,
    /// `actual >= expected`
    GreaterThanEqual,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::Equal => "equal",
            Operator::NotEqual => "not_equal",
            Operator::LessThan => "less_than",
            Operator::LessThanEqual => "less_than_equal",
            Operator::GreaterThan => "greater_than",
            Operator::GreaterThanEqual => "greater_than_equal",
        };
        f.write_str(s)
    }
}

/// Right-hand side of a condition.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    /// Fixed value from the definition.
    Literal(TagValue),
    /// Filled from the validation step's parameters or the rule's defaults.
    Param(String),
}

/// `tag <operator> value`.
#[derive(Clone, Debug, PartialEq)]
pub struct Condition {
    /// Tag read for the left-hand side.
    pub tag: String,
    /// How the two sides compare.
    pub operator: Operator,
    /// Right-hand side.
    pub value: Operand,
}

/// Shape of a state rule.
#[derive(Clone, Debug, PartialEq)]
pub enum RuleKind {
    /// A single condition.
    Comparison(Condition),
    /// Logical AND over every condition.
    MultiCondition {
        /// Lower bound on `conditions.len()`, checked at load.
        min_items: usize,
        /// Conditions, all of which must hold.
        conditions: Vec<Condition>,
    },
}

/// Named boolean predicate over tag values.
#[derive(Clone, Debug, PartialEq)]
pub struct StateRule {
    /// Rule name.
    pub name: String,
    /// Comparison or multi-condition.
    pub kind: RuleKind,
    /// Parameter values used when a validation step omits them.
    pub defaults: HashMap<String, TagValue>,
}

impl StateRule {
    /// Every condition of the rule, in declaration order.
    pub fn conditions(&self) -> &[Condition] {
        match &self.kind {
            RuleKind::Comparison(c) => std::slice::from_ref(c),
            RuleKind::MultiCondition { conditions, .. } => conditions,
        }
    }

    /// Parameter names the rule's conditions refer to.
    pub fn params(&self) -> impl Iterator<Item = &str> {
        self.conditions().iter().filter_map(|c| match &c.value {
            Operand::Param(p) => Some(p.as_str()),
            Operand::Literal(_) => None,
        })
    }
}

// =============================================================================
// Sequences
// =============================================================================

/// Where a sequence's named document comes from in the Document Store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentId {
    /// Document type, e.g. `parameters`.
    #[serde(rename = "type")]
    pub doc_type: String,
    /// Document id within its type.
    pub id: String,
}

/// Top-level unit started and stopped by the runner.
#[derive(Clone, Debug)]
pub struct SequenceDef {
    /// Sequence id.
    pub id: String,
    /// Free-form description.
    pub description: String,
    /// Top-level groups, run in order.
    pub action_groups: Vec<String>,
    /// Documents bound before the run, keyed by requirement name.
    pub documents: HashMap<String, DocumentId>,
}

/// Every definition the engine runs from.
#[derive(Clone, Debug)]
pub struct Definitions {
    /// Definition document version.
    pub version: u32,
    /// Standard tags plus any the document declares.
    pub tags: Arc<TagCatalog>,
    /// State rules by name.
    pub rules: Arc<HashMap<String, StateRule>>,
    /// Named time delays.
    pub delays: HashMap<String, Duration>,
    /// Action groups by name.
    pub groups: HashMap<String, ActionGroup>,
    /// Sequences by id.
    pub sequences: HashMap<String, SequenceDef>,
}

impl Definitions {
    /// Looks up an action group.
    pub fn group(&self, name: &str) -> Option<&ActionGroup> {
        self.groups.get(name)
    }

    /// Looks up a sequence.
    pub fn sequence(&self, id: &str) -> Option<&SequenceDef> {
        self.sequences.get(id)
    }

    /// Group names reachable from `roots` through action group references,
    /// each listed once, in first-visit order.
    pub fn reachable_groups<'a>(&'a self, roots: &'a [String]) -> Vec<&'a str> {
        fn visit<'a>(defs: &'a Definitions, name: &'a str, out: &mut Vec<&'a str>) {
            if out.contains(&name) {
                return;
            }
            out.push(name);
            if let Some(group) = defs.group(name) {
                walk(defs, &group.steps, out);
            }
        }
        fn walk<'a>(defs: &'a Definitions, steps: &'a [Step], out: &mut Vec<&'a str>) {
            for step in steps {
                match step {
                    Step::ActionGroupRef(g) => visit(defs, g, out),
                    Step::Repeat(r) => walk(defs, &r.steps, out),
                    _ => {}
                }
            }
        }

        let mut out = Vec::new();
        for root in roots {
            visit(self, root, &mut out);
        }
        out
    }
}
