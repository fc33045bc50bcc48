//! Error types for the sequencing engine.
//!
//! Errors are split by the phase in which they can occur, so callers can tell
//! a broken configuration apart from a stalled physical process:
//!
//! - **`ConfigError`**: the definition document (or engine settings) is invalid.
//!   Raised while loading, never while a sequence is running.
//! - **`BindError`**: a sequence's documents or `from` references could not be
//!   resolved. Raised before the first step executes.
//! - **`TagError`**: a Tag Store read or write was rejected.
//! - **`StepFailure`**: a running step failed. Hardware write errors and
//!   validation timeouts are distinct variants.
//! - **`RunnerError`**: start/stop requests that the Sequence Runner refused.
//!
//! `EngineError` wraps all of them via `#[from]` for callers that only need `?`.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::tags::{TagKind, TagValue};

/// Convenience alias for results using the crate-wide error type.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Load-time configuration errors.
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse definitions: {0}")]
    Parse(String),

    #[error("Settings load error: {0}")]
    Settings(#[from] figment::Error),

    #[error("Settings validation error: {0}")]
    InvalidSettings(String),

    #[error("Unsupported definition version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Action group '{group}' step {path}: {reason}")]
    InvalidStep {
        group: String,
        path: String,
        reason: String,
    },

    #[error("Unknown action '{action}' in action group '{group}'")]
    UnknownAction { group: String, action: String },

    #[error("Unknown state rule '{rule}' in action group '{group}'")]
    UnknownRule { group: String, rule: String },

    #[error("Unknown time delay '{delay}' in action group '{group}'")]
    UnknownDelay { group: String, delay: String },

    #[error("Unknown action group '{group}' referenced by '{referenced_by}'")]
    UnknownGroup {
        referenced_by: String,
        group: String,
    },

    #[error("Action group cycle: {}", .0.join(" -> "))]
    GroupCycle(Vec<String>),

    #[error("State rule '{rule}' declares {found} conditions but minItems is {min_items}")]
    TooFewConditions {
        rule: String,
        found: usize,
        min_items: usize,
    },

    #[error("Validation of '{rule}' in action group '{group}' has no timeout")]
    MissingTimeout { group: String, rule: String },

    #[error("Validation of '{rule}' in action group '{group}' has invalid timeout {value}")]
    InvalidTimeout {
        group: String,
        rule: String,
        value: String,
    },

    #[error("Validation of '{rule}' in action group '{group}' does not supply parameter '{param}'")]
    MissingRuleParam {
        group: String,
        rule: String,
        param: String,
    },

    #[error("Repeat in action group '{group}' has invalid count {count}")]
    InvalidRepeatCount { group: String, count: String },

    #[error("Invalid reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("Time delay '{name}' has invalid duration {value}")]
    InvalidDelay { name: String, value: f64 },

    #[error("{context} references undeclared tag '{tag}'")]
    UnknownTag { context: String, tag: String },

    #[error("Tag '{tag}' cannot be used by {context}: {reason}")]
    TagMismatch {
        context: String,
        tag: String,
        reason: String,
    },

    #[error("Sequence '{sequence}' does not supply document '{requirement}' required by '{group}'")]
    UnsatisfiedRequirement {
        sequence: String,
        group: String,
        requirement: String,
    },

    #[error("Configuration error: {0}")]
    Invalid(String),
}

/// Document Store errors.
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Document '{doc_type}/{doc_id}' not found")]
    NotFound { doc_type: String, doc_id: String },

    #[error("Invalid document id '{0}'")]
    InvalidId(String),

    #[error("Failed to read document '{doc_type}/{doc_id}': {reason}")]
    Unreadable {
        doc_type: String,
        doc_id: String,
        reason: String,
    },
}

/// Bind-time errors: everything that must resolve before step 1 runs.
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum BindError {
    #[error("Sequence does not bind document '{requirement}'")]
    MissingDocument { requirement: String },

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("Not defined: {0}")]
    Undefined(String),

    #[error("Reference '{reference}' did not resolve: {reason}")]
    UnresolvedPath { reference: String, reason: String },

    #[error("Repeat count '{count}' is invalid: {reason}")]
    InvalidCount { count: String, reason: String },

    #[error("Action '{action}' is missing argument '{argument}'")]
    MissingArgument { action: String, argument: String },

    #[error("Action '{action}' argument '{argument}': {reason}")]
    InvalidArgument {
        action: String,
        argument: String,
        reason: String,
    },
}

/// Tag Store errors.
#[allow(missing_docs)]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TagError {
    #[error("Unknown tag '{0}'")]
    UnknownTag(String),

    #[error("Tag '{tag}' expects {expected}, got {found}")]
    TypeMismatch {
        tag: String,
        expected: TagKind,
        found: TagKind,
    },

    #[error("Tag '{tag}' value {value} outside range [{min}, {max}]")]
    OutOfRange {
        tag: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Tag '{0}' is read-only")]
    ReadOnly(String),

    #[error("Tag '{0}' has no polled value yet")]
    Unavailable(String),

    #[error("Hardware error on tag '{tag}': {reason}")]
    Hardware { tag: String, reason: String },
}

/// Rule evaluation errors (configuration slipped past load, or the store failed).
#[allow(missing_docs)]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    #[error("Unknown state rule '{0}'")]
    UnknownRule(String),

    #[error("State rule '{rule}' needs parameter '{param}'")]
    MissingParam { rule: String, param: String },

    #[error("Cannot apply '{operator}' to {actual} and {expected} on tag '{tag}'")]
    Incomparable {
        tag: String,
        operator: String,
        actual: TagValue,
        expected: TagValue,
    },

    #[error(transparent)]
    Tag(#[from] TagError),
}

/// Last observed value of a tag, reported with validation timeouts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservedTag {
    /// Tag read.
    pub tag: String,
    /// `None` when the tag had no value yet.
    pub value: Option<TagValue>,
}

/// Formats observed tags as `tag=value, ...`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observed(pub Vec<ObservedTag>);

impl fmt::Display for Observed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, o) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match &o.value {
                Some(v) => write!(f, "{}={}", o.tag, v)?,
                None => write!(f, "{}=<unreadable>", o.tag)?,
            }
        }
        Ok(())
    }
}

/// Outcome of a step that did not succeed.
#[allow(missing_docs)]
#[derive(Error, Debug, Clone)]
pub enum StepFailure {
    #[error("Hardware write failed for action '{action}' on tag '{tag}': {source}")]
    HardwareWrite {
        action: String,
        tag: String,
        #[source]
        source: TagError,
    },

    #[error("Validation '{rule}' timed out after {elapsed:?} (last observed: {observed})")]
    ValidationTimeout {
        rule: String,
        elapsed: Duration,
        observed: Observed,
    },

    #[error("Validation '{rule}' could not be evaluated: {source}")]
    Evaluation {
        rule: String,
        #[source]
        source: RuleError,
    },

    #[error("Run aborted")]
    Aborted,
}

impl StepFailure {
    /// True for the stalled-process outcome rather than a failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, StepFailure::ValidationTimeout { .. })
    }
}

/// Errors returned by the Sequence Runner's public operations.
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Sequence '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Sequence '{0}' is not running")]
    NotRunning(String),

    #[error("Cannot start '{requested}': sequence '{active}' is driving the stage")]
    StageBusy { requested: String, active: String },

    #[error("Unknown sequence '{0}'")]
    UnknownSequence(String),

    #[error("Sequence '{sequence}' failed to bind: {source}")]
    Bind {
        sequence: String,
        #[source]
        source: BindError,
    },
}

/// Crate-wide error.
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Tag(#[from] TagError),

    #[error(transparent)]
    Step(#[from] StepFailure),

    #[error(transparent)]
    Runner(#[from] RunnerError),
}
