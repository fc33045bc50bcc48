//! Run event stream.
//!
//! Every run publishes lifecycle and per-step events on a broadcast channel.
//! Subscribers that fall behind lose the oldest events (`RecvError::Lagged`);
//! the authoritative state is always the run snapshot from
//! [`SequenceRunner::status`](crate::runner::SequenceRunner::status).

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::runner::RunStatus;

/// Outcome of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// The step did what it was asked.
    Succeeded,
    /// A write or evaluation failed.
    Failed,
    /// A validation ran out of time: the physical process stalled.
    TimedOut,
    /// Interrupted by a stop request.
    Aborted,
}

/// One event of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    /// Bind succeeded and the first step is about to run.
    RunStarted {
        /// Sequence id.
        sequence_id: String,
        /// Run this event belongs to.
        run_uid: Uuid,
        /// Wall-clock time of the event.
        at: DateTime<Utc>,
    },
    /// A step began.
    StepStarted {
        /// Sequence id.
        sequence_id: String,
        /// Run this event belongs to.
        run_uid: Uuid,
        /// Index stack of the step.
        path: Vec<usize>,
        /// Step label, e.g. `validation chamber_vacuum`.
        step: String,
        /// Wall-clock time of the event.
        at: DateTime<Utc>,
    },
    /// A step ended.
    StepFinished {
        /// Sequence id.
        sequence_id: String,
        /// Run this event belongs to.
        run_uid: Uuid,
        /// Index stack of the step.
        path: Vec<usize>,
        /// Step label.
        step: String,
        /// How the step ended.
        status: StepStatus,
        /// Time spent in the step.
        elapsed_ms: u64,
        /// Failure message, when the step did not succeed.
        error: Option<String>,
        /// Wall-clock time of the event.
        at: DateTime<Utc>,
    },
    /// The run reached a terminal status.
    RunFinished {
        /// Sequence id.
        sequence_id: String,
        /// Run this event belongs to.
        run_uid: Uuid,
        /// Terminal status.
        status: RunStatus,
        /// Error that ended the run, if any.
        error: Option<String>,
        /// Wall-clock time of the event.
        at: DateTime<Utc>,
    },
}

impl RunEvent {
    /// Run the event belongs to.
    pub fn run_uid(&self) -> Uuid {
        match self {
            RunEvent::RunStarted { run_uid, .. }
            | RunEvent::StepStarted { run_uid, .. }
            | RunEvent::StepFinished { run_uid, .. }
            | RunEvent::RunFinished { run_uid, .. } => *run_uid,
        }
    }
}

/// Broadcast fan-out of [`RunEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    /// Bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receives events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    /// Publishes to current subscribers. Having none is not an error.
    pub fn publish(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let uid = Uuid::new_v4();
        bus.publish(RunEvent::RunStarted {
            sequence_id: "stop_feeder".into(),
            run_uid: uid,
            at: Utc::now(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.run_uid(), uid);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(1);
        bus.publish(RunEvent::RunStarted {
            sequence_id: "x".into(),
            run_uid: Uuid::new_v4(),
            at: Utc::now(),
        });
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = RunEvent::StepFinished {
            sequence_id: "s".into(),
            run_uid: Uuid::nil(),
            path: vec![0, 2],
            step: "validation feeder_stopped".into(),
            status: StepStatus::TimedOut,
            elapsed_ms: 5000,
            error: None,
            at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "step_finished");
        assert_eq!(json["status"], "timed_out");
        assert_eq!(json["path"], serde_json::json!([0, 2]));
    }
}
