//! Parameter Resolver and bind step.
//!
//! Binding turns a [`SequenceDef`] into a [`BoundSequence`] before the first
//! step runs:
//!
//! 1. every document the sequence declares is fetched from the Document Store
//! 2. every group the sequence reaches has its `requires` checked against them
//! 3. every action's arguments are resolved (`from` base, then `parameters`
//!    overrides field by field) and checked against the action's contract
//! 4. repeat counts that reference documents are resolved to positive integers
//!
//! Any failure is a [`BindError`] and the sequence never starts. Documents are
//! not re-read while the run executes.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::debug;

use crate::definition::{
    ActionStep, ArgSource, CountExpr, Definitions, DocRef, SequenceDef, Step, TimeDelayStep,
    ValidationStep,
};
use crate::dispatch::{self, ActionArgs, ActionSpec};
use crate::documents::DocumentStore;
use crate::error::BindError;

/// Documents fetched for one run, keyed by requirement name.
#[derive(Debug, Clone, Default)]
pub struct BoundDocuments(HashMap<String, Value>);

impl BoundDocuments {
    /// Wraps already-fetched documents.
    pub fn new(docs: HashMap<String, Value>) -> Self {
        Self(docs)
    }

    /// Document bound under `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Resolves a reference against the bound documents.
    pub fn resolve(&self, reference: &DocRef) -> Result<&Value, BindError> {
        let doc = self
            .0
            .get(&reference.document)
            .ok_or_else(|| BindError::MissingDocument {
                requirement: reference.document.clone(),
            })?;
        reference.lookup(doc)
    }
}

/// Fetches every document `seq` declares.
pub async fn fetch_documents(
    seq: &SequenceDef,
    store: &dyn DocumentStore,
) -> Result<BoundDocuments, BindError> {
    let mut docs = HashMap::with_capacity(seq.documents.len());
    for (name, id) in &seq.documents {
        let doc = store.get(&id.doc_type, &id.id).await?;
        debug!(sequence = %seq.id, requirement = %name, doc_type = %id.doc_type, doc_id = %id.id, "document bound");
        docs.insert(name.clone(), doc);
    }
    Ok(BoundDocuments(docs))
}

/// Builds an action's argument object: the `from` base (which must be an
/// object) with every `parameters` entry laid over it.
pub fn resolve_args(step: &ActionStep, docs: &BoundDocuments) -> Result<Map<String, Value>, BindError> {
    let mut args = match &step.from {
        None => Map::new(),
        Some(reference) => match docs.resolve(reference)? {
            Value::Object(base) => base.clone(),
            other => {
                return Err(BindError::UnresolvedPath {
                    reference: reference.to_string(),
                    reason: format!("expected an object, got {other}"),
                })
            }
        },
    };
    for (key, source) in &step.parameters {
        let value = match source {
            ArgSource::Literal(v) => v.clone(),
            ArgSource::Reference(r) => docs.resolve(r)?.clone(),
        };
        args.insert(key.clone(), value);
    }
    Ok(args)
}

/// Resolves a repeat count to a positive integer.
pub fn resolve_count(expr: &CountExpr, docs: &BoundDocuments) -> Result<u32, BindError> {
    let reference = match expr {
        CountExpr::Literal(n) if *n >= 1 => return Ok(*n),
        CountExpr::Literal(n) => {
            return Err(BindError::InvalidCount {
                count: n.to_string(),
                reason: "must be at least 1".to_string(),
            })
        }
        CountExpr::Reference(r) => r,
    };
    let invalid = |reason: String| BindError::InvalidCount {
        count: reference.to_string(),
        reason,
    };
    let value = docs.resolve(reference)?;
    match whole_number(value) {
        Some(n) if n >= 1 => u32::try_from(n).map_err(|_| invalid(format!("{n} is too large"))),
        Some(n) => Err(invalid(format!("resolved to {n}, must be at least 1"))),
        None => Err(invalid(format!("resolved to {value}, expected an integer"))),
    }
}

/// Integer view of a JSON number. Whole-number floats such as `3.0` count.
pub fn whole_number(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|v| v.is_finite() && v.fract() == 0.0)
            .map(|v| v as i64)
    })
}

// =============================================================================
// Bound tree
// =============================================================================

/// A step with everything resolved that can be resolved before the run.
#[derive(Debug, Clone)]
pub enum BoundStep {
    /// Action with checked arguments.
    Action {
        /// Catalog entry.
        spec: &'static ActionSpec,
        /// Arguments that passed the contract.
        args: ActionArgs,
    },
    /// Validation, unchanged from the definition.
    Validation(ValidationStep),
    /// Delay, unchanged from the definition.
    TimeDelay(TimeDelayStep),
    /// Repeat with its count resolved.
    Repeat {
        /// Positive iteration count.
        count: u32,
        /// Body of the repeat.
        steps: Vec<BoundStep>,
    },
    /// An inlined action group reference.
    Group {
        /// Group name.
        name: String,
        /// The group's bound steps.
        steps: Vec<BoundStep>,
    },
}

impl BoundStep {
    /// Short label for logs and events.
    pub fn label(&self) -> String {
        match self {
            BoundStep::Action { spec, .. } => format!("action {}", spec.name),
            BoundStep::Validation(v) => format!("validation {}", v.rule),
            BoundStep::TimeDelay(d) => format!("time_delay {}", d.name),
            BoundStep::Repeat { count, .. } => format!("repeat x{count}"),
            BoundStep::Group { name, .. } => format!("action_group {name}"),
        }
    }
}

/// One top-level group of a bound sequence.
#[derive(Debug, Clone)]
pub struct BoundGroup {
    /// Group name.
    pub name: String,
    /// Bound steps.
    pub steps: Vec<BoundStep>,
}

/// A sequence ready to execute.
#[derive(Debug, Clone)]
pub struct BoundSequence {
    /// Sequence id.
    pub sequence_id: String,
    /// Top-level groups, in run order.
    pub groups: Vec<BoundGroup>,
    /// Documents fetched at bind time.
    pub documents: BoundDocuments,
}

/// Binds `sequence_id` against the Document Store.
pub async fn bind_sequence(
    defs: &Definitions,
    sequence_id: &str,
    store: &dyn DocumentStore,
) -> Result<BoundSequence, BindError> {
    let seq = defs.sequence(sequence_id).ok_or_else(|| {
        BindError::Undefined(format!("unknown sequence '{sequence_id}'"))
    })?;
    let documents = fetch_documents(seq, store).await?;

    for name in defs.reachable_groups(&seq.action_groups) {
        if let Some(group) = defs.group(name) {
            if let Some(req) = group
                .requires
                .iter()
                .find(|r| documents.get(&r.name).is_none())
            {
                return Err(BindError::MissingDocument {
                    requirement: req.name.clone(),
                });
            }
        }
    }

    let binder = Binder {
        defs,
        docs: &documents,
    };
    let groups = seq
        .action_groups
        .iter()
        .map(|name| {
            Ok(BoundGroup {
                name: name.clone(),
                steps: binder.group(name)?,
            })
        })
        .collect::<Result<Vec<_>, BindError>>()?;

    Ok(BoundSequence {
        sequence_id: seq.id.clone(),
        groups,
        documents,
    })
}

struct Binder<'a> {
    defs: &'a Definitions,
    docs: &'a BoundDocuments,
}

impl Binder<'_> {
    fn group(&self, name: &str) -> Result<Vec<BoundStep>, BindError> {
        let group = self.defs.group(name).ok_or_else(|| {
            BindError::Undefined(format!("unknown action group '{name}'"))
        })?;
        self.steps(&group.steps)
    }

    fn steps(&self, steps: &[Step]) -> Result<Vec<BoundStep>, BindError> {
        steps.iter().map(|s| self.step(s)).collect()
    }

    fn step(&self, step: &Step) -> Result<BoundStep, BindError> {
        Ok(match step {
            Step::Action(action) => {
                let spec = dispatch::lookup(&action.name).ok_or_else(|| {
                    BindError::Undefined(format!(
                        "unknown action '{}'",
                        action.name
                    ))
                })?;
                let raw = resolve_args(action, self.docs)?;
                BoundStep::Action {
                    spec,
                    args: spec.bind_args(&raw)?,
                }
            }
            Step::Validation(v) => BoundStep::Validation(v.clone()),
            Step::TimeDelay(d) => BoundStep::TimeDelay(d.clone()),
            Step::Repeat(r) => BoundStep::Repeat {
                count: resolve_count(&r.count, self.docs)?,
                steps: self.steps(&r.steps)?,
            },
            Step::ActionGroupRef(name) => BoundStep::Group {
                name: name.clone(),
                steps: self.group(name)?,
            },
        })
    }
}
