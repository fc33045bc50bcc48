//! End-to-end runs through the Sequence Runner against the simulated stage.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    assert_duration_near, collect_run_events, config_path, test_settings, Harness,
    TimingTolerance,
};
use coating_sequencer::documents::FileDocumentStore;
use coating_sequencer::error::{BindError, DocumentError, RunnerError};
use coating_sequencer::events::{RunEvent, StepStatus};
use coating_sequencer::tags::{PolledTagStore, SimulatedTagStore, TagStore, TagValue};
use coating_sequencer::{load_definitions, RunStatus, SequenceRunner};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_stop_feeder_completes_once_flow_decays() {
    let harness = Harness::with_store(|store| {
        store
            .with_initial("feeder_frequency", TagValue::Float(600.0))
            .with_initial("feeder_flow_setpoint", TagValue::Float(5.0))
            .with_initial("feeder_flow_measured", TagValue::Float(5.0))
    });
    let mut events = harness.runner.events();

    let started = Instant::now();
    harness.runner.start("stop_feeder").await.unwrap();
    let run = harness.runner.wait("stop_feeder").await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.last_error.is_none());
    assert!(run.end_time.is_some());
    // Measured flow settles one second after the setpoint write.
    assert!(elapsed >= Duration::from_secs(1), "finished too early: {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(5), "took {elapsed:?}");

    let journal = harness.tags.journal().await;
    let written: Vec<_> = journal.iter().map(|w| (w.tag.as_str(), w.value)).collect();
    assert_eq!(
        written,
        vec![
            ("feeder_frequency", TagValue::Float(0.0)),
            ("deagglomerator_duty_cycle", TagValue::Float(35.0)),
            ("feeder_flow_setpoint", TagValue::Float(0.0)),
        ]
    );

    let events = collect_run_events(&mut events).await;
    let validations = events
        .iter()
        .filter(|e| {
            matches!(e, RunEvent::StepFinished { step, status, .. }
                if step.starts_with("validation") && *status == StepStatus::Succeeded)
        })
        .count();
    assert_eq!(validations, 1);
}

#[tokio::test(start_paused = true)]
async fn test_validation_timeout_ends_run_in_error() {
    let harness = Harness::new();
    let mut events = harness.runner.events();

    let started = Instant::now();
    harness.runner.start("wait_vacuum").await.unwrap();
    let run = harness.runner.wait("wait_vacuum").await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(run.status, RunStatus::Error);
    let message = run.last_error.unwrap();
    assert!(message.contains("chamber_vacuum"), "{message}");
    assert!(message.contains("timed out"), "{message}");
    assert!(message.contains("chamber_pressure=760"), "{message}");

    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(2) + test_settings().validation_poll_interval);

    let events = collect_run_events(&mut events).await;
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::StepFinished { status: StepStatus::TimedOut, .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn test_repeat_count_from_document() {
    let harness = Harness::new();
    harness.runner.start("three_passes").await.unwrap();
    let run = harness.runner.wait("three_passes").await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let shutter: Vec<_> = harness
        .tags
        .journal()
        .await
        .into_iter()
        .filter(|w| w.tag == "shutter_open")
        .map(|w| w.value)
        .collect();
    let expected: Vec<_> = (0..3)
        .flat_map(|_| [TagValue::Bool(true), TagValue::Bool(false)])
        .collect();
    assert_eq!(shutter, expected);

    // The pattern's velocity is written before each move.
    assert_eq!(harness.tags.writes_to("motion_xy_velocity").await, 3);
    assert_eq!(harness.tags.writes_to("motion_xy_start").await, 3);
}

#[tokio::test(start_paused = true)]
async fn test_zero_repeat_count_rejected_before_any_write() {
    let harness = Harness::new();
    let err = harness.runner.start("zero_passes").await.unwrap_err();
    assert!(matches!(
        err,
        RunnerError::Bind {
            source: BindError::InvalidCount { .. },
            ..
        }
    ));

    let run = harness.runner.status("zero_passes").unwrap();
    assert_eq!(run.status, RunStatus::Error);
    assert!(run.last_error.is_some());
    assert!(harness.tags.journal().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_missing_document_fails_bind() {
    let harness = Harness::new();
    let err = harness.runner.start("missing_recipe").await.unwrap_err();
    assert!(matches!(
        err,
        RunnerError::Bind {
            source: BindError::Document(DocumentError::NotFound { .. }),
            ..
        }
    ));
    assert!(harness.tags.journal().await.is_empty());

    // A failed bind does not block a later start of another sequence.
    harness.runner.start("vent").await.unwrap();
    let run = harness.runner.wait("vent").await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_hardware_write_failure_names_action_and_tag() {
    let harness = Harness::new();
    harness.tags.fail_writes("vent_valve").await;

    harness.runner.start("vent").await.unwrap();
    let run = harness.runner.wait("vent").await.unwrap();

    assert_eq!(run.status, RunStatus::Error);
    let message = run.last_error.unwrap();
    assert!(message.contains("valves.vent_valve"), "{message}");
    assert!(message.contains("'vent_valve'"), "{message}");
    assert_eq!(run.current_step_path, vec![0, 0]);
}

#[tokio::test(start_paused = true)]
async fn test_event_stream_order() {
    let harness = Harness::new();
    let mut events = harness.runner.events();

    let run_uid = harness.runner.start("blink").await.unwrap();
    let events = collect_run_events(&mut events).await;

    assert!(events.iter().all(|e| e.run_uid() == run_uid));
    assert!(matches!(events.first(), Some(RunEvent::RunStarted { .. })));
    assert!(matches!(
        events.last(),
        Some(RunEvent::RunFinished {
            status: RunStatus::Completed,
            ..
        })
    ));

    let paths: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::StepStarted { path, .. } => Some(path.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(paths, vec![vec![0, 0], vec![0, 1], vec![0, 2], vec![0, 3]]);

    let delay = events
        .iter()
        .find_map(|e| match e {
            RunEvent::StepFinished {
                step, elapsed_ms, ..
            } if step == "time_delay short" => Some(*elapsed_ms),
            _ => None,
        })
        .unwrap();
    assert_duration_near(
        Duration::from_millis(delay),
        Duration::from_secs(1),
        TimingTolerance::Tight,
        "short delay",
    );
}

#[tokio::test(start_paused = true)]
async fn test_shipped_spray_sequence_completes() {
    let defs = load_definitions(config_path("definitions.yaml")).unwrap();
    let tags = Arc::new(SimulatedTagStore::with_standard_physics(Arc::clone(
        &defs.tags,
    )));
    let documents = Arc::new(FileDocumentStore::new(config_path("documents")));
    let runner = SequenceRunner::new(Arc::new(defs), tags.clone(), documents, &test_settings());

    runner.start("spray_coating").await.unwrap();
    let run = runner.wait("spray_coating").await.unwrap();
    assert_eq!(run.status, RunStatus::Completed, "{:?}", run.last_error);

    // Two passes from the nominal recipe, shutter opened and closed per pass
    // plus the close during shutdown.
    assert_eq!(tags.writes_to("shutter_open").await, 5);
    assert_eq!(tags.read("vent_valve").await.unwrap(), TagValue::Bool(true));
}

#[tokio::test(start_paused = true)]
async fn test_spray_sequence_through_polled_store() {
    let settings = test_settings();
    let defs = load_definitions(config_path("definitions.yaml")).unwrap();
    let stage = Arc::new(SimulatedTagStore::with_standard_physics(Arc::clone(
        &defs.tags,
    )));
    let tags = Arc::new(PolledTagStore::spawn(
        stage.clone(),
        Arc::clone(&defs.tags),
        settings.tag_poll_interval,
    ));
    let documents = Arc::new(FileDocumentStore::new(config_path("documents")));
    let runner = SequenceRunner::new(Arc::new(defs), tags.clone(), documents, &settings);

    runner.start("spray_coating").await.unwrap();
    let run = runner.wait("spray_coating").await.unwrap();
    assert_eq!(run.status, RunStatus::Completed, "{:?}", run.last_error);
    assert_eq!(stage.writes_to("shutter_open").await, 5);

    // The snapshot catches up with the stage within one poll interval.
    tokio::time::sleep(settings.tag_poll_interval).await;
    assert_eq!(tags.read("vent_valve").await.unwrap(), TagValue::Bool(true));
    tags.shutdown().await;
}
