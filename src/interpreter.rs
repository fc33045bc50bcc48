//! Step Interpreter.
//!
//! Walks a [`BoundSequence`] depth first, one step at a time. Each step starts,
//! then finishes as `Succeeded`, `Failed`, `TimedOut` or `Aborted` (on stop).
//! The first unsuccessful step ends the run. There are no retries.
//!
//! # Cancellation
//!
//! The runner drives a `watch` channel of [`RunControl`]:
//!
//! - `Stop` interrupts Validation polling and TimeDelay waits immediately, and
//!   is otherwise honoured at the next step boundary. Action writes already in
//!   flight always complete.
//! - `Pause` is honoured at step boundaries only. A paused run keeps watching
//!   for `Stop`.
//! - A dropped control sender counts as `Stop`.
//!
//! # Step paths
//!
//! Paths are index stacks: `[group, step]` at top level, extended by
//! `[iteration, step]` inside a repeat and by `[step]` inside an inlined
//! action group.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::definition::{TimeDelayStep, ValidationStep};
use crate::dispatch::ActionDispatcher;
use crate::error::{Observed, StepFailure};
use crate::events::{EventBus, RunEvent, StepStatus};
use crate::params::{BoundSequence, BoundStep};
use crate::rules::RuleEvaluator;
use crate::runner::{RunStatus, SequenceRun};
use crate::tags::TagStore;

/// Requested run state, sent by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunControl {
    /// Keep executing.
    Run,
    /// Hold at the next step boundary.
    Pause,
    /// Abort as soon as possible.
    Stop,
}

/// Where progress is reported.
#[derive(Debug, Clone)]
struct Reporter {
    sequence_id: String,
    run_uid: Uuid,
    events: Option<EventBus>,
    status: Option<Arc<watch::Sender<SequenceRun>>>,
}

impl Reporter {
    fn publish(&self, event: impl FnOnce(String, Uuid) -> RunEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event(self.sequence_id.clone(), self.run_uid));
        }
    }

    fn update(&self, f: impl FnOnce(&mut SequenceRun)) {
        if let Some(status) = &self.status {
            status.send_modify(f);
        }
    }
}

/// Executes bound steps against the Tag Store.
pub struct Interpreter {
    tags: Arc<dyn TagStore>,
    dispatcher: ActionDispatcher,
    evaluator: RuleEvaluator,
    poll_interval: Duration,
    reporter: Reporter,
}

impl Interpreter {
    /// Interpreter writing and reading through `tags`.
    pub fn new(tags: Arc<dyn TagStore>, evaluator: RuleEvaluator, poll_interval: Duration) -> Self {
        Self {
            dispatcher: ActionDispatcher::new(Arc::clone(&tags)),
            tags,
            evaluator,
            poll_interval,
            reporter: Reporter {
                sequence_id: String::new(),
                run_uid: Uuid::nil(),
                events: None,
                status: None,
            },
        }
    }

    /// Identifies the run in events and logs.
    pub fn with_run(mut self, sequence_id: impl Into<String>, run_uid: Uuid) -> Self {
        self.reporter.sequence_id = sequence_id.into();
        self.reporter.run_uid = run_uid;
        self
    }

    /// Publishes step events on `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.reporter.events = Some(events);
        self
    }

    /// Snapshot to keep `current_step_path` and paused state current in.
    pub fn with_status(mut self, status: Arc<watch::Sender<SequenceRun>>) -> Self {
        self.reporter.status = Some(status);
        self
    }

    /// Delay between validation polls.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Runs every group of `sequence` in order.
    pub async fn run(
        &self,
        sequence: &BoundSequence,
        mut control: watch::Receiver<RunControl>,
    ) -> Result<(), StepFailure> {
        for (index, group) in sequence.groups.iter().enumerate() {
            info!(
                sequence = %sequence.sequence_id,
                group = %group.name,
                "running action group"
            );
            self.run_steps(&group.steps, vec![index], &mut control)
                .await?;
        }
        Ok(())
    }

    fn run_steps<'a>(
        &'a self,
        steps: &'a [BoundStep],
        prefix: Vec<usize>,
        control: &'a mut watch::Receiver<RunControl>,
    ) -> BoxFuture<'a, Result<(), StepFailure>> {
        async move {
            for (index, step) in steps.iter().enumerate() {
                let mut path = prefix.clone();
                path.push(index);
                self.checkpoint(control).await?;
                self.run_step(step, path, control).await?;
            }
            Ok(())
        }
        .boxed()
    }

    async fn run_step(
        &self,
        step: &BoundStep,
        path: Vec<usize>,
        control: &mut watch::Receiver<RunControl>,
    ) -> Result<(), StepFailure> {
        let label = step.label();
        let started = Instant::now();
        {
            let path = path.clone();
            self.reporter
                .update(move |run| run.current_step_path = path);
        }
        self.reporter.publish(|sequence_id, run_uid| RunEvent::StepStarted {
            sequence_id,
            run_uid,
            path: path.clone(),
            step: label.clone(),
            at: Utc::now(),
        });
        debug!(?path, step = %label, "step running");

        let result = match step {
            BoundStep::Action { spec, args } => self.dispatcher.dispatch(spec, args).await.map(|_| ()),
            BoundStep::Validation(v) => self.validate(v, control).await,
            BoundStep::TimeDelay(d) => self.delay(d, control).await,
            BoundStep::Repeat { count, steps } => {
                let mut result = Ok(());
                for iteration in 0..*count {
                    let mut prefix = path.clone();
                    prefix.push(iteration as usize);
                    result = self.run_steps(steps, prefix, control).await;
                    if result.is_err() {
                        break;
                    }
                }
                result
            }
            BoundStep::Group { steps, .. } => self.run_steps(steps, path.clone(), control).await,
        };

        let status = match &result {
            Ok(()) => StepStatus::Succeeded,
            Err(StepFailure::Aborted) => StepStatus::Aborted,
            Err(e) if e.is_timeout() => StepStatus::TimedOut,
            Err(_) => StepStatus::Failed,
        };
        let elapsed = started.elapsed();
        debug!(?path, step = %label, ?status, ?elapsed, "step finished");
        self.reporter.publish(|sequence_id, run_uid| RunEvent::StepFinished {
            sequence_id,
            run_uid,
            path,
            step: label,
            status,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            error: result.as_ref().err().map(ToString::to_string),
            at: Utc::now(),
        });
        result
    }

    /// Step boundary: honours pause and stop.
    async fn checkpoint(&self, control: &mut watch::Receiver<RunControl>) -> Result<(), StepFailure> {
        let mut paused = false;
        loop {
            let requested = *control.borrow_and_update();
            match requested {
                RunControl::Run => {
                    if paused {
                        info!(sequence = %self.reporter.sequence_id, "run resumed");
                        self.reporter.update(|run| run.status = RunStatus::Running);
                    }
                    return Ok(());
                }
                RunControl::Stop => return Err(StepFailure::Aborted),
                RunControl::Pause => {
                    if !paused {
                        paused = true;
                        info!(sequence = %self.reporter.sequence_id, "run paused at step boundary");
                        self.reporter.update(|run| run.status = RunStatus::Paused);
                    }
                    if control.changed().await.is_err() {
                        return Err(StepFailure::Aborted);
                    }
                }
            }
        }
    }

    /// Sleeps until `deadline` unless a stop arrives first.
    async fn wait_until(
        &self,
        deadline: Instant,
        control: &mut watch::Receiver<RunControl>,
    ) -> Result<(), StepFailure> {
        loop {
            let stop = *control.borrow_and_update() == RunControl::Stop;
            if stop {
                return Err(StepFailure::Aborted);
            }
            tokio::select! {
                _ = sleep_until(deadline) => return Ok(()),
                changed = control.changed() => {
                    if changed.is_err() {
                        return Err(StepFailure::Aborted);
                    }
                }
            }
        }
    }

    async fn delay(
        &self,
        step: &TimeDelayStep,
        control: &mut watch::Receiver<RunControl>,
    ) -> Result<(), StepFailure> {
        debug!(delay = %step.name, duration = ?step.duration, "waiting");
        self.wait_until(Instant::now() + step.duration, control).await
    }

    /// Polls the rule every poll interval until it holds or the timeout
    /// elapses. The final evaluation happens at the deadline.
    async fn validate(
        &self,
        step: &ValidationStep,
        control: &mut watch::Receiver<RunControl>,
    ) -> Result<(), StepFailure> {
        let started = Instant::now();
        let deadline = started + step.timeout;
        let mut polls = 0u32;

        loop {
            polls += 1;
            let observed: Observed = match self
                .evaluator
                .evaluate(&step.rule, &step.params, self.tags.as_ref())
                .await
            {
                Ok(e) if e.satisfied => {
                    debug!(rule = %step.rule, polls, elapsed = ?started.elapsed(), "validation satisfied");
                    return Ok(());
                }
                Ok(e) => e.observed,
                Err(source) => {
                    warn!(rule = %step.rule, error = %source, "validation could not be evaluated");
                    return Err(StepFailure::Evaluation {
                        rule: step.rule.clone(),
                        source,
                    });
                }
            };

            let now = Instant::now();
            if now >= deadline {
                let elapsed = now - started;
                warn!(
                    rule = %step.rule,
                    ?elapsed,
                    observed = %observed,
                    "validation timed out"
                );
                return Err(StepFailure::ValidationTimeout {
                    rule: step.rule.clone(),
                    elapsed,
                    observed,
                });
            }
            self.wait_until((now + self.poll_interval).min(deadline), control)
                .await?;
        }
    }
}
