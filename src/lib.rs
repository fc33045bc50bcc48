//! Declarative process-sequence engine for a cold-spray coating stage.
//!
//! Sequences are built from named action groups whose steps write hardware
//! tags, wait on state rules, sleep for configured delays, repeat blocks and
//! call other groups. The engine walks those trees one step at a time against
//! a [`TagStore`](tags::TagStore), with bounded waits and cooperative stop.
//!
//! Data flow:
//!
//! ```text
//! SequenceRunner -> Interpreter -> { params, dispatch, rules } -> TagStore
//! ```
//!
//! Only the Tag Store touches hardware.

/// Engine settings.
pub mod config;
/// Definition model and loader.
pub mod definition;
/// Action catalog and dispatcher.
pub mod dispatch;
/// Document Store.
pub mod documents;
/// Error types.
pub mod error;
/// Run event stream.
pub mod events;
/// Step Interpreter.
pub mod interpreter;
/// Tracing setup.
pub mod logging;
/// Parameter Resolver and bind.
pub mod params;
/// Rule Evaluator.
pub mod rules;
/// Sequence Runner.
pub mod runner;
/// Tag Store.
pub mod tags;

pub use config::EngineSettings;
pub use definition::{load_definitions, Definitions};
pub use error::{EngineError, EngineResult};
pub use runner::{RunStatus, SequenceRun, SequenceRunner};
