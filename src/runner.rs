//! Sequence Runner.
//!
//! Owns the run state of every defined sequence and exposes the control
//! surface: `start`, `stop`, `pause`, `resume`, `status`.
//!
//! # Run lifecycle
//!
//! ```text
//! idle -> running <-> paused
//!           |
//!           +-> completed | aborted | error
//! ```
//!
//! `start` binds the sequence synchronously (documents, arguments, repeat
//! counts) and only then spawns the run on the tokio runtime. A bind failure
//! leaves the sequence in `error` without executing any step. Terminal runs
//! stay visible through `status` until the next `start` of the same sequence.
//!
//! # Concurrency
//!
//! - At most one active run per sequence. Starting an active sequence is
//!   rejected, never queued, and does not touch the active run.
//! - With `exclusive_stage` (the default) at most one run is active across
//!   all sequences, since they drive the same physical stage.
//! - `stop` is idempotent. Calling it on a terminal run returns the final
//!   snapshot unchanged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::definition::Definitions;
use crate::documents::DocumentStore;
use crate::error::{RunnerError, StepFailure};
use crate::events::{EventBus, RunEvent};
use crate::interpreter::{Interpreter, RunControl};
use crate::params::bind_sequence;
use crate::rules::RuleEvaluator;
use crate::tags::TagStore;

// =============================================================================
// Run snapshot
// =============================================================================

/// Status of a sequence run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Never run since the engine started.
    Idle,
    /// Executing steps.
    Running,
    /// Holding at a step boundary.
    Paused,
    /// Every step succeeded.
    Completed,
    /// Stopped on request.
    Aborted,
    /// A step failed, or binding failed.
    Error,
}

impl RunStatus {
    /// Running or paused.
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Paused)
    }

    /// Completed, aborted or failed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Aborted | RunStatus::Error
        )
    }
}

/// Snapshot of one sequence's most recent run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequenceRun {
    /// Sequence id.
    pub sequence_id: String,
    /// Uid of the latest run, if any.
    pub run_uid: Option<Uuid>,
    /// Current status.
    pub status: RunStatus,
    /// Index stack of the step currently (or last) executing.
    pub current_step_path: Vec<usize>,
    /// When the run started.
    pub start_time: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    pub end_time: Option<DateTime<Utc>>,
    /// Error that ended the run.
    pub last_error: Option<String>,
}

impl SequenceRun {
    /// Snapshot of a sequence that has not run.
    pub fn idle(sequence_id: impl Into<String>) -> Self {
        Self {
            sequence_id: sequence_id.into(),
            run_uid: None,
            status: RunStatus::Idle,
            current_step_path: Vec::new(),
            start_time: None,
            end_time: None,
            last_error: None,
        }
    }
}

// =============================================================================
// Runner
// =============================================================================

struct ActiveRun {
    control: watch::Sender<RunControl>,
    handle: JoinHandle<()>,
}

struct RunnerInner {
    defs: Arc<Definitions>,
    tags: Arc<dyn TagStore>,
    documents: Arc<dyn DocumentStore>,
    evaluator: RuleEvaluator,
    poll_interval: Duration,
    exclusive_stage: bool,
    events: EventBus,
    /// One snapshot channel per defined sequence, created up front.
    statuses: HashMap<String, Arc<watch::Sender<SequenceRun>>>,
    /// Held across bind so concurrent starts are serialized.
    runs: Mutex<HashMap<String, ActiveRun>>,
}

/// Starts, stops and reports on sequence runs. Cheap to clone.
#[derive(Clone)]
pub struct SequenceRunner {
    inner: Arc<RunnerInner>,
}

impl SequenceRunner {
    /// Runner over the given definitions and stores.
    pub fn new(
        defs: Arc<Definitions>,
        tags: Arc<dyn TagStore>,
        documents: Arc<dyn DocumentStore>,
        settings: &EngineSettings,
    ) -> Self {
        let statuses = defs
            .sequences
            .keys()
            .map(|id| {
                let (tx, _) = watch::channel(SequenceRun::idle(id.clone()));
                (id.clone(), Arc::new(tx))
            })
            .collect();
        Self {
            inner: Arc::new(RunnerInner {
                evaluator: RuleEvaluator::new(Arc::clone(&defs.rules)),
                defs,
                tags,
                documents,
                poll_interval: settings.validation_poll_interval,
                exclusive_stage: settings.exclusive_stage,
                events: EventBus::new(settings.event_capacity),
                statuses,
                runs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Definitions the runner was built with.
    pub fn definitions(&self) -> &Definitions {
        &self.inner.defs
    }

    /// Defined sequence ids, sorted.
    pub fn sequence_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.statuses.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn status_tx(&self, sequence_id: &str) -> Result<&Arc<watch::Sender<SequenceRun>>, RunnerError> {
        self.inner
            .statuses
            .get(sequence_id)
            .ok_or_else(|| RunnerError::UnknownSequence(sequence_id.to_string()))
    }

    /// Current snapshot. A sequence that never ran reports `idle`.
    pub fn status(&self, sequence_id: &str) -> Result<SequenceRun, RunnerError> {
        Ok(self.status_tx(sequence_id)?.borrow().clone())
    }

    /// Live snapshot updates for one sequence, across all of its runs.
    pub fn subscribe_status(
        &self,
        sequence_id: &str,
    ) -> Result<watch::Receiver<SequenceRun>, RunnerError> {
        Ok(self.status_tx(sequence_id)?.subscribe())
    }

    /// Run events for every sequence.
    pub fn events(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.events.subscribe()
    }

    /// Id of some active run other than `except`, if any.
    fn other_active(&self, except: &str) -> Option<String> {
        self.inner
            .statuses
            .iter()
            .filter(|(id, _)| id.as_str() != except)
            .find(|(_, tx)| tx.borrow().status.is_active())
            .map(|(id, _)| id.clone())
    }

    /// Binds and launches `sequence_id`. Returns the new run's uid once the
    /// run is executing.
    pub async fn start(&self, sequence_id: &str) -> Result<Uuid, RunnerError> {
        let status_tx = Arc::clone(self.status_tx(sequence_id)?);
        let mut runs = self.inner.runs.lock().await;

        if status_tx.borrow().status.is_active() {
            warn!(sequence = sequence_id, "start rejected: already running");
            return Err(RunnerError::AlreadyRunning(sequence_id.to_string()));
        }
        if self.inner.exclusive_stage {
            if let Some(active) = self.other_active(sequence_id) {
                warn!(sequence = sequence_id, active = %active, "start rejected: stage busy");
                return Err(RunnerError::StageBusy {
                    requested: sequence_id.to_string(),
                    active,
                });
            }
        }

        let run_uid = Uuid::new_v4();
        let start_time = Utc::now();
        info!(sequence = sequence_id, %run_uid, "binding sequence");

        let bound = match bind_sequence(
            &self.inner.defs,
            sequence_id,
            self.inner.documents.as_ref(),
        )
        .await
        {
            Ok(bound) => bound,
            Err(source) => {
                error!(sequence = sequence_id, %run_uid, error = %source, "bind failed");
                status_tx.send_replace(SequenceRun {
                    sequence_id: sequence_id.to_string(),
                    run_uid: Some(run_uid),
                    status: RunStatus::Error,
                    current_step_path: Vec::new(),
                    start_time: Some(start_time),
                    end_time: Some(Utc::now()),
                    last_error: Some(source.to_string()),
                });
                return Err(RunnerError::Bind {
                    sequence: sequence_id.to_string(),
                    source,
                });
            }
        };

        status_tx.send_replace(SequenceRun {
            sequence_id: sequence_id.to_string(),
            run_uid: Some(run_uid),
            status: RunStatus::Running,
            current_step_path: Vec::new(),
            start_time: Some(start_time),
            end_time: None,
            last_error: None,
        });
        self.inner.events.publish(RunEvent::RunStarted {
            sequence_id: sequence_id.to_string(),
            run_uid,
            at: start_time,
        });

        let (control, control_rx) = watch::channel(RunControl::Run);
        let interpreter = Interpreter::new(
            Arc::clone(&self.inner.tags),
            self.inner.evaluator.clone(),
            self.inner.poll_interval,
        )
        .with_run(sequence_id, run_uid)
        .with_events(self.inner.events.clone())
        .with_status(Arc::clone(&status_tx));
        let events = self.inner.events.clone();
        let id = sequence_id.to_string();

        let handle = tokio::spawn(async move {
            let result = interpreter.run(&bound, control_rx).await;
            let (status, last_error) = match &result {
                Ok(()) => {
                    info!(sequence = %id, %run_uid, "sequence completed");
                    (RunStatus::Completed, None)
                }
                Err(StepFailure::Aborted) => {
                    info!(sequence = %id, %run_uid, "sequence aborted");
                    (RunStatus::Aborted, None)
                }
                Err(failure) => {
                    error!(sequence = %id, %run_uid, error = %failure, "sequence failed");
                    (RunStatus::Error, Some(failure.to_string()))
                }
            };
            status_tx.send_modify(|run| {
                run.status = status;
                run.end_time = Some(Utc::now());
                run.last_error = last_error.clone();
            });
            events.publish(RunEvent::RunFinished {
                sequence_id: id,
                run_uid,
                status,
                error: last_error,
                at: Utc::now(),
            });
        });

        runs.insert(sequence_id.to_string(), ActiveRun { control, handle });
        info!(sequence = sequence_id, %run_uid, "sequence started");
        Ok(run_uid)
    }

    /// Requests a stop. Validation polling and delays are interrupted
    /// promptly; an in-flight action write completes first.
    pub async fn stop(&self, sequence_id: &str) -> Result<SequenceRun, RunnerError> {
        self.control(sequence_id, RunControl::Stop).await
    }

    /// Pauses at the next step boundary.
    pub async fn pause(&self, sequence_id: &str) -> Result<SequenceRun, RunnerError> {
        self.control(sequence_id, RunControl::Pause).await
    }

    /// Resumes a paused run.
    pub async fn resume(&self, sequence_id: &str) -> Result<SequenceRun, RunnerError> {
        self.control(sequence_id, RunControl::Run).await
    }

    async fn control(
        &self,
        sequence_id: &str,
        request: RunControl,
    ) -> Result<SequenceRun, RunnerError> {
        let status_tx = self.status_tx(sequence_id)?;
        let runs = self.inner.runs.lock().await;
        let snapshot = status_tx.borrow().clone();

        match snapshot.status {
            RunStatus::Idle => return Err(RunnerError::NotRunning(sequence_id.to_string())),
            s if s.is_terminal() => {
                if request == RunControl::Stop {
                    return Ok(snapshot);
                }
                return Err(RunnerError::NotRunning(sequence_id.to_string()));
            }
            _ => {}
        }

        if let Some(run) = runs.get(sequence_id) {
            let current = *run.control.borrow();
            if current != RunControl::Stop && current != request {
                info!(sequence = sequence_id, ?request, "run control requested");
                run.control.send_replace(request);
            }
        }
        Ok(snapshot)
    }

    /// Waits for the current run of `sequence_id` to reach a terminal state.
    pub async fn wait(&self, sequence_id: &str) -> Result<SequenceRun, RunnerError> {
        let mut rx = self.subscribe_status(sequence_id)?;
        let idle = rx.borrow().status == RunStatus::Idle;
        if idle {
            return Err(RunnerError::NotRunning(sequence_id.to_string()));
        }
        let snapshot = rx
            .wait_for(|run| run.status.is_terminal())
            .await
            .map_err(|_| RunnerError::NotRunning(sequence_id.to_string()))?
            .clone();
        Ok(snapshot)
    }

    /// Stops every active run and waits for their tasks to exit.
    pub async fn shutdown(&self) {
        let mut runs = self.inner.runs.lock().await;
        for (id, run) in runs.iter() {
            if !run.handle.is_finished() {
                info!(sequence = %id, "stopping run for shutdown");
                run.control.send_replace(RunControl::Stop);
            }
        }
        for (id, run) in runs.drain() {
            if let Err(e) = run.handle.await {
                warn!(sequence = %id, error = %e, "run task ended abnormally");
            }
        }
    }
}
