//! Loading definition documents from disk and rejecting broken ones.

mod common;

use std::io::Write;

use common::{config_path, fixture_document};
use coating_sequencer::definition::{CountExpr, Step};
use coating_sequencer::error::ConfigError;
use coating_sequencer::{load_definitions, Definitions, EngineSettings};

#[test]
fn test_shipped_definitions_load() {
    let defs = load_definitions(config_path("definitions.yaml")).unwrap();
    for id in [
        "ready_system",
        "stop_feeder",
        "spray_coating",
        "shutdown_process",
    ] {
        assert!(defs.sequence(id).is_some(), "missing sequence {id}");
    }

    let pattern = defs.group("execute_pattern").unwrap();
    match &pattern.steps[1] {
        Step::Repeat(repeat) => {
            assert!(matches!(repeat.count, CountExpr::Reference(_)));
            assert_eq!(repeat.steps.len(), 6);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_shipped_settings_load() {
    let settings = EngineSettings::load_from(config_path("coatseq.toml")).unwrap();
    assert!(settings.exclusive_stage);
    assert_eq!(settings.event_capacity, 256);
}

#[test]
fn test_json_file_round_trip() {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    write!(file, "{}", fixture_document()).unwrap();

    let defs = load_definitions(file.path()).unwrap();
    let from_value = Definitions::from_value(fixture_document()).unwrap();
    let mut loaded: Vec<_> = defs.sequences.keys().collect();
    let mut expected: Vec<_> = from_value.sequences.keys().collect();
    loaded.sort();
    expected.sort();
    assert_eq!(loaded, expected);
}

#[test]
fn test_transitive_cycle_rejected_at_load() {
    let mut doc = fixture_document();
    doc["action_groups"]["a"] = serde_json::json!({"steps": [{"action_group": "b"}]});
    doc["action_groups"]["b"] = serde_json::json!({"steps": [
        {"time_delay": "short"},
        {"repeat": {"count": 2, "steps": [{"action_group": "a"}]}}
    ]});

    match Definitions::from_value(doc) {
        Err(ConfigError::GroupCycle(path)) => {
            assert_eq!(path.first(), path.last());
            assert!(path.contains(&"a".to_string()));
            assert!(path.contains(&"b".to_string()));
        }
        other => panic!("expected a cycle error, got {other:?}"),
    }
}

#[test]
fn test_yaml_parse_error_reported() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(file, "version: 1\naction_groups: [unclosed").unwrap();
    assert!(matches!(
        load_definitions(file.path()),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn test_missing_file_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.yaml");
    assert!(matches!(
        load_definitions(&path),
        Err(ConfigError::Io { .. })
    ));
}
