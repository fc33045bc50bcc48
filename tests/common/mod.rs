//! Common test utilities for sequencer integration tests
//!
//! This module provides reusable test helpers for:
//! - Timing assertions with appropriate tolerances
//! - A fixture definition document and a runner wired to a simulated stage

#![allow(dead_code)] // Not every test binary uses every helper

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use coating_sequencer::documents::InMemoryDocumentStore;
use coating_sequencer::events::RunEvent;
use coating_sequencer::tags::SimulatedTagStore;
use coating_sequencer::{Definitions, EngineSettings, SequenceRunner};
use serde_json::{json, Value};
use tokio::sync::broadcast;

/// Tolerance levels for timing assertions.
#[derive(Debug, Clone, Copy)]
pub enum TimingTolerance {
    /// Exact match - only for simulated time with `start_paused = true`
    Exact,
    /// 5% tolerance
    Tight,
    /// 20% tolerance - default for local development
    Normal,
}

impl TimingTolerance {
    /// Get the tolerance factor as a fraction (0.0 to 1.0)
    pub fn factor(&self) -> f64 {
        match self {
            TimingTolerance::Exact => 0.0,
            TimingTolerance::Tight => 0.05,
            TimingTolerance::Normal => 0.20,
        }
    }
}

/// Assert that a duration is within tolerance of an expected value.
///
/// # Panics
/// Panics if the actual duration is outside the tolerance range.
pub fn assert_duration_near(
    actual: Duration,
    expected: Duration,
    tolerance: TimingTolerance,
    context: &str,
) {
    let factor = tolerance.factor();
    let min = expected.mul_f64(1.0 - factor);
    let max = expected.mul_f64(1.0 + factor);

    assert!(
        actual >= min && actual <= max,
        "{}: expected {:?} +/-{:.0}%, got {:?} (acceptable range: {:?} to {:?})",
        context,
        expected,
        factor * 100.0,
        actual,
        min,
        max
    );
}

/// Settings used by the fixtures: 100 ms validation polling.
pub fn test_settings() -> EngineSettings {
    EngineSettings {
        validation_poll_interval: Duration::from_millis(100),
        ..EngineSettings::default()
    }
}

/// Path to a file under the crate's `config/` directory.
pub fn config_path(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("config")
        .join(relative)
}

/// Definition document exercising every step kind.
pub fn fixture_document() -> Value {
    json!({
        "version": 1,
        "time_delays": {"hold": 10.0, "short": 1.0},
        "state_rules": {
            "feeder_stopped": {
                "type": "multi_condition",
                "conditions": [
                    {"tag": "feeder_frequency", "operator": "equal", "value": 0.0},
                    {"tag": "feeder_flow_measured", "operator": "less_than", "value": 0.5}
                ]
            },
            "chamber_vacuum": {
                "type": "comparison",
                "tag": "chamber_pressure",
                "operator": "less_than_equal",
                "value": {"param": "target_pressure"}
            }
        },
        "action_groups": {
            "stop_feeder": {"steps": [
                {"action": "feeder.set_frequency", "parameters": {"frequency": 0}},
                {"action": "deagglomerator.set_duty_cycle", "parameters": {"duty_cycle": 35}},
                {"action": "gas.set_feeder_flow", "parameters": {"flow": 0.0}},
                {"validation": "feeder_stopped", "parameters": {"timeout": 5}}
            ]},
            "wait_vacuum": {"steps": [
                {"validation": "chamber_vacuum",
                 "parameters": {"timeout": 2, "target_pressure": 5.0}}
            ]},
            "hold": {"steps": [
                {"time_delay": "hold"},
                {"action": "valves.vent_valve", "parameters": {"open": true}}
            ]},
            "vent": {"steps": [
                {"action": "valves.vent_valve", "parameters": {"open": true}}
            ]},
            "passes": {
                "requires": [{"parameter_file": "string"}, {"pattern_file": "string"}],
                "steps": [
                    {"repeat": {"count": "{parameter_file.passes}", "steps": [
                        {"action": "motion.move_xy", "from": "{pattern_file}.start"},
                        {"action": "shutter.control_shutter", "parameters": {"open": true}},
                        {"action": "shutter.control_shutter", "parameters": {"open": false}}
                    ]}}
                ]
            },
            "blink": {"steps": [
                {"time_delay": "short"},
                {"action": "shutter.control_shutter", "parameters": {"open": true}},
                {"time_delay": "short"},
                {"action": "shutter.control_shutter", "parameters": {"open": false}}
            ]}
        },
        "sequences": {
            "stop_feeder": {"action_groups": ["stop_feeder"]},
            "wait_vacuum": {"action_groups": ["wait_vacuum"]},
            "hold": {"action_groups": ["hold"]},
            "vent": {"action_groups": ["vent"]},
            "blink": {"action_groups": ["blink"]},
            "three_passes": {
                "action_groups": ["passes"],
                "documents": {
                    "parameter_file": {"type": "parameters", "id": "three"},
                    "pattern_file": {"type": "patterns", "id": "line"}
                }
            },
            "zero_passes": {
                "action_groups": ["passes"],
                "documents": {
                    "parameter_file": {"type": "parameters", "id": "zero"},
                    "pattern_file": {"type": "patterns", "id": "line"}
                }
            },
            "missing_recipe": {
                "action_groups": ["passes"],
                "documents": {
                    "parameter_file": {"type": "parameters", "id": "absent"},
                    "pattern_file": {"type": "patterns", "id": "line"}
                }
            }
        }
    })
}

/// Documents referenced by [`fixture_document`].
pub fn fixture_documents() -> InMemoryDocumentStore {
    InMemoryDocumentStore::new()
        .with("parameters", "three", json!({"passes": 3}))
        .with("parameters", "zero", json!({"passes": 0}))
        .with(
            "patterns",
            "line",
            json!({"start": {"x": 10.0, "y": 20.0, "velocity": 100.0}}),
        )
}

/// Runner over the fixture definitions and a simulated stage.
pub struct Harness {
    pub runner: SequenceRunner,
    pub tags: Arc<SimulatedTagStore>,
}

impl Harness {
    /// Fixture harness with standard physics.
    pub fn new() -> Self {
        Self::with_store(|store| store)
    }

    /// Fixture harness whose store is adjusted by `configure` before use.
    pub fn with_store(configure: impl FnOnce(SimulatedTagStore) -> SimulatedTagStore) -> Self {
        let defs = Definitions::from_value(fixture_document()).expect("fixture definitions load");
        let tags = Arc::new(configure(SimulatedTagStore::with_standard_physics(
            Arc::clone(&defs.tags),
        )));
        let runner = SequenceRunner::new(
            Arc::new(defs),
            tags.clone(),
            Arc::new(fixture_documents()),
            &test_settings(),
        );
        Self { runner, tags }
    }
}

/// Drains events until the matching `run_finished` arrives.
pub async fn collect_run_events(rx: &mut broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    loop {
        let event = rx.recv().await.expect("event bus open");
        let done = matches!(event, RunEvent::RunFinished { .. });
        events.push(event);
        if done {
            return events;
        }
    }
}
