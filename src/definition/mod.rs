//! Action groups, steps, state rules and sequences.
//!
//! # Lifecycle
//!
//! Definitions are read once at process start from a versioned document
//! ([`load_definitions`]) and are immutable afterwards. A change requires a
//! restart. Every cross reference (action names, rules, delays, group
//! references, required documents) is checked at load time.
//!
//! # Document shape
//!
//! ```yaml
//! version: 1
//! time_delays: { powder_stabilize: 5.0 }
//! state_rules:
//!   feeder_stopped:
//!     type: multi_condition
//!     conditions:
//!       - { tag: feeder_frequency, operator: equal, value: 0.0 }
//!       - { tag: feeder_flow_measured, operator: less_than, value: 0.5 }
//! action_groups:
//!   stop_feeder:
//!     steps:
//!       - { action: feeder.set_frequency, parameters: { frequency: 0 } }
//!       - { validation: feeder_stopped, parameters: { timeout: 5 } }
//! sequences:
//!   stop_feeder: { action_groups: [stop_feeder] }
//! ```

mod loader;
mod model;
mod reference;

pub use loader::{load_definitions, DEFAULT_MIN_ITEMS, DEFINITION_VERSION};
pub use model::{
    ActionGroup, ActionStep, ArgSource, Condition, CountExpr, Definitions, DocumentId, Operand,
    Operator, RepeatStep, Requirement, RuleKind, SequenceDef, StateRule, Step, TimeDelayStep,
    ValidationStep,
};
pub use reference::DocRef;
