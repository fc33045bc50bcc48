//! Tag Store: named hardware signals.
//!
//! A tag is a single sensor reading or actuator command with a declared type,
//! unit, range and scale. The engine only talks to hardware through the
//! [`TagStore`] trait; a handle is passed explicitly to every evaluator and
//! dispatcher call.
//!
//! # Implementations
//!
//! - [`SimulatedTagStore`]: in-memory hardware stand-in with settle-time physics
//! - [`PolledTagStore`]: snapshot cache over a raw [`TagSource`], refreshed at a
//!   fixed cadence by a background task
//!
//! # Concurrency
//!
//! Reads are non-exclusive. Writes are serialized per tag through [`TagLocks`]
//! so the engine and a manual operator override never interleave on one tag.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TagError;

/// Snapshot store over a raw source.
pub mod polled;
/// In-memory stage simulation.
pub mod simulated;

pub use polled::{PolledTagStore, TagSource};
pub use simulated::{Follow, SimulatedTagStore, TagWrite};

// =============================================================================
// Values
// =============================================================================

/// Declared type of a tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagKind {
    /// On/off signal.
    Bool,
    /// Whole-number value.
    Int,
    /// Analog value.
    Float,
}

impl fmt::Display for TagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagKind::Bool => write!(f, "bool"),
            TagKind::Int => write!(f, "int"),
            TagKind::Float => write!(f, "float"),
        }
    }
}

/// A typed tag value in engineering units.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Floating-point value.
    Float(f64),
}

impl TagValue {
    /// The kind of this value.
    pub fn kind(&self) -> TagKind {
        match self {
            TagValue::Bool(_) => TagKind::Bool,
            TagValue::Int(_) => TagKind::Int,
            TagValue::Float(_) => TagKind::Float,
        }
    }

    /// Numeric view. Booleans have none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TagValue::Bool(_) => None,
            TagValue::Int(v) => Some(*v as f64),
            TagValue::Float(v) => Some(*v),
        }
    }

    /// Zero value of the given kind.
    pub fn zero(kind: TagKind) -> Self {
        match kind {
            TagKind::Bool => TagValue::Bool(false),
            TagKind::Int => TagValue::Int(0),
            TagKind::Float => TagValue::Float(0.0),
        }
    }

    /// Converts a JSON scalar. Objects, arrays, strings and null have no tag value.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(TagValue::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(TagValue::Int)
                .or_else(|| n.as_f64().map(TagValue::Float)),
            _ => None,
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Bool(v) => write!(f, "{v}"),
            TagValue::Int(v) => write!(f, "{v}"),
            TagValue::Float(v) => write!(f, "{v}"),
        }
    }
}

// =============================================================================
// Catalog
// =============================================================================

/// Who may touch a tag.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagAccess {
    /// Sensor reading.
    Read,
    /// Actuator command; reads return the last commanded value.
    Write,
    /// Readable and writable.
    #[default]
    ReadWrite,
}

impl TagAccess {
    /// Reads are allowed.
    pub fn readable(&self) -> bool {
        !matches!(self, TagAccess::Write)
    }

    /// Writes are allowed.
    pub fn writable(&self) -> bool {
        !matches!(self, TagAccess::Read)
    }
}

/// Declared metadata for one tag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagDefinition {
    /// Tag name.
    pub name: String,
    /// Declared type.
    #[serde(rename = "type")]
    pub kind: TagKind,
    /// Engineering unit, for display.
    #[serde(default)]
    pub unit: Option<String>,
    /// Lowest value a write may carry.
    #[serde(default)]
    pub min: Option<f64>,
    /// Highest value a write may carry.
    #[serde(default)]
    pub max: Option<f64>,
    /// Engineering value = raw value * scale.
    #[serde(default)]
    pub scale: Option<f64>,
    /// Who may read and write.
    #[serde(default)]
    pub access: TagAccess,
}

impl TagDefinition {
    /// Unscaled, unbounded definition.
    pub fn new(name: impl Into<String>, kind: TagKind, access: TagAccess) -> Self {
        Self {
            name: name.into(),
            kind,
            unit: None,
            min: None,
            max: None,
            scale: None,
            access,
        }
    }

    /// Sets the unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Bounds writes to `min..=max`.
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    /// Sets the raw-to-engineering scale.
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    /// Coerces `value` to this tag's kind and checks the declared range.
    ///
    /// Ints widen to float tags; nothing else converts.
    pub fn coerce(&self, value: TagValue) -> Result<TagValue, TagError> {
        let coerced = match (self.kind, value) {
            (TagKind::Bool, TagValue::Bool(_))
            | (TagKind::Int, TagValue::Int(_))
            | (TagKind::Float, TagValue::Float(_)) => value,
            (TagKind::Float, TagValue::Int(v)) => TagValue::Float(v as f64),
            (expected, found) => {
                return Err(TagError::TypeMismatch {
                    tag: self.name.clone(),
                    expected,
                    found: found.kind(),
                })
            }
        };

        if let Some(v) = coerced.as_f64() {
            let min = self.min.unwrap_or(f64::NEG_INFINITY);
            let max = self.max.unwrap_or(f64::INFINITY);
            if !v.is_finite() || v < min || v > max {
                return Err(TagError::OutOfRange {
                    tag: self.name.clone(),
                    value: v,
                    min,
                    max,
                });
            }
        }
        Ok(coerced)
    }

    /// Engineering value to raw hardware value.
    pub fn to_raw(&self, value: TagValue) -> TagValue {
        match (self.scale, value) {
            (Some(scale), TagValue::Float(v)) if scale != 0.0 => TagValue::Float(v / scale),
            (Some(scale), TagValue::Int(v)) if scale != 0.0 => {
                TagValue::Int((v as f64 / scale).round() as i64)
            }
            _ => value,
        }
    }

    /// Raw hardware value to engineering value.
    pub fn from_raw(&self, raw: TagValue) -> TagValue {
        match (self.scale, raw) {
            (Some(scale), TagValue::Float(v)) => TagValue::Float(v * scale),
            (Some(scale), TagValue::Int(v)) => match self.kind {
                TagKind::Float => TagValue::Float(v as f64 * scale),
                _ => TagValue::Int((v as f64 * scale).round() as i64),
            },
            _ => raw,
        }
    }
}

/// All declared tags, keyed by name.
#[derive(Clone, Debug, Default)]
pub struct TagCatalog {
    tags: HashMap<String, TagDefinition>,
}

impl TagCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog covering every tag the built-in actions write plus the stage's
    /// standard sensors.
    pub fn standard() -> Self {
        use TagAccess::{Read, ReadWrite, Write};
        use TagKind::{Bool, Float, Int};

        let defs = [
            // Valves
            TagDefinition::new("main_gas_valve", Bool, ReadWrite),
            TagDefinition::new("feeder_gas_valve", Bool, ReadWrite),
            TagDefinition::new("vent_valve", Bool, ReadWrite),
            TagDefinition::new("gate_valve_partial", Bool, ReadWrite),
            TagDefinition::new("gate_valve_open", Bool, ReadWrite),
            // Gas
            TagDefinition::new("main_flow_setpoint", Float, ReadWrite)
                .with_unit("SLPM")
                .with_range(0.0, 100.0),
            TagDefinition::new("main_flow_measured", Float, Read).with_unit("SLPM"),
            TagDefinition::new("feeder_flow_setpoint", Float, ReadWrite)
                .with_unit("SLPM")
                .with_range(0.0, 10.0),
            TagDefinition::new("feeder_flow_measured", Float, Read).with_unit("SLPM"),
            TagDefinition::new("main_supply_pressure", Float, Read).with_unit("psi"),
            // Powder feed
            TagDefinition::new("feeder_frequency", Float, ReadWrite)
                .with_unit("Hz")
                .with_range(0.0, 1200.0),
            TagDefinition::new("deagglomerator_duty_cycle", Float, ReadWrite)
                .with_unit("%")
                .with_range(20.0, 35.0),
            TagDefinition::new("deagglomerator_frequency", Float, ReadWrite)
                .with_unit("Hz")
                .with_range(0.0, 500.0),
            TagDefinition::new("active_hardware_set", Int, ReadWrite).with_range(1.0, 2.0),
            // Vacuum
            TagDefinition::new("mechanical_pump_on", Bool, ReadWrite),
            TagDefinition::new("booster_pump_on", Bool, ReadWrite),
            TagDefinition::new("chamber_pressure", Float, Read).with_unit("torr"),
            // Nozzle and shutter
            TagDefinition::new("nozzle_select", Int, ReadWrite).with_range(1.0, 2.0),
            TagDefinition::new("shutter_open", Bool, ReadWrite),
            // Motion
            TagDefinition::new("motion_x_target", Float, ReadWrite)
                .with_unit("mm")
                .with_range(0.0, 300.0),
            TagDefinition::new("motion_y_target", Float, ReadWrite)
                .with_unit("mm")
                .with_range(0.0, 300.0),
            TagDefinition::new("motion_z_target", Float, ReadWrite)
                .with_unit("mm")
                .with_range(0.0, 100.0),
            TagDefinition::new("motion_xy_velocity", Float, ReadWrite)
                .with_unit("mm/s")
                .with_range(0.0, 500.0),
            TagDefinition::new("motion_z_velocity", Float, ReadWrite)
                .with_unit("mm/s")
                .with_range(0.0, 50.0),
            TagDefinition::new("motion_xy_start", Bool, Write),
            TagDefinition::new("motion_z_start", Bool, Write),
            TagDefinition::new("motion_home", Bool, Write),
            TagDefinition::new("motion_x_position", Float, Read).with_unit("mm"),
            TagDefinition::new("motion_y_position", Float, Read).with_unit("mm"),
            TagDefinition::new("motion_z_position", Float, Read).with_unit("mm"),
            TagDefinition::new("motion_homed", Bool, Read),
        ];

        let mut catalog = Self::new();
        for def in defs {
            catalog.insert(def);
        }
        catalog
    }

    /// Adds or replaces a tag definition.
    pub fn insert(&mut self, def: TagDefinition) {
        self.tags.insert(def.name.clone(), def);
    }

    /// Looks up a tag definition.
    pub fn get(&self, name: &str) -> Option<&TagDefinition> {
        self.tags.get(name)
    }

    /// Number of tags.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// True when no tags are declared.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Every definition, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &TagDefinition> {
        self.tags.values()
    }

    /// Validates a write: tag exists, is writable, value fits type and range.
    pub fn check_write(&self, name: &str, value: TagValue) -> Result<TagValue, TagError> {
        let def = self
            .get(name)
            .ok_or_else(|| TagError::UnknownTag(name.to_string()))?;
        if !def.access.writable() {
            return Err(TagError::ReadOnly(name.to_string()));
        }
        def.coerce(value)
    }
}

// =============================================================================
// Store contract
// =============================================================================

/// Read/write boundary to live hardware signals.
#[async_trait]
pub trait TagStore: Send + Sync {
    /// Current value of `tag` in engineering units.
    async fn read(&self, tag: &str) -> Result<TagValue, TagError>;

    /// Commands `tag` to `value`. Resolves once the write is acknowledged.
    async fn write(&self, tag: &str, value: TagValue) -> Result<(), TagError>;
}

/// Per-tag async write locks.
#[derive(Debug, Default)]
pub struct TagLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TagLocks {
    /// No locks yet; they are created on first use.
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock guarding writes to `tag`.
    pub fn lock_for(&self, tag: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(tag.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_value_from_json() {
        assert_eq!(
            TagValue::from_json(&serde_json::json!(true)),
            Some(TagValue::Bool(true))
        );
        assert_eq!(
            TagValue::from_json(&serde_json::json!(35)),
            Some(TagValue::Int(35))
        );
        assert_eq!(
            TagValue::from_json(&serde_json::json!(0.5)),
            Some(TagValue::Float(0.5))
        );
        assert_eq!(TagValue::from_json(&serde_json::json!("on")), None);
    }

    #[test]
    fn test_untagged_deserialize_prefers_int() {
        let v: TagValue = serde_json::from_str("3").unwrap();
        assert_eq!(v, TagValue::Int(3));
        let v: TagValue = serde_json::from_str("3.5").unwrap();
        assert_eq!(v, TagValue::Float(3.5));
    }

    #[test]
    fn test_coerce_widens_int_to_float() {
        let def = TagDefinition::new("flow", TagKind::Float, TagAccess::ReadWrite);
        assert_eq!(def.coerce(TagValue::Int(5)).unwrap(), TagValue::Float(5.0));
    }

    #[test]
    fn test_coerce_rejects_bool_for_numeric() {
        let def = TagDefinition::new("flow", TagKind::Float, TagAccess::ReadWrite);
        let err = def.coerce(TagValue::Bool(true)).unwrap_err();
        assert!(matches!(err, TagError::TypeMismatch { .. }));
    }

    #[test]
    fn test_coerce_enforces_range() {
        let def = TagDefinition::new("duty", TagKind::Float, TagAccess::ReadWrite)
            .with_range(20.0, 35.0);
        assert!(def.coerce(TagValue::Float(35.0)).is_ok());
        assert!(matches!(
            def.coerce(TagValue::Float(40.0)),
            Err(TagError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_scale_round_trip() {
        let def =
            TagDefinition::new("pressure", TagKind::Float, TagAccess::Read).with_scale(0.01);
        assert_eq!(def.from_raw(TagValue::Int(1250)), TagValue::Float(12.5));
        let raw = def.to_raw(TagValue::Float(12.5));
        assert!(matches!(raw, TagValue::Float(v) if (v - 1250.0).abs() < 1e-9));
    }

    #[test]
    fn test_check_write_rejects_sensor_tags() {
        let catalog = TagCatalog::standard();
        assert_eq!(
            catalog.check_write("chamber_pressure", TagValue::Float(1.0)),
            Err(TagError::ReadOnly("chamber_pressure".into()))
        );
        assert_eq!(
            catalog.check_write("nope", TagValue::Bool(true)),
            Err(TagError::UnknownTag("nope".into()))
        );
    }

    #[tokio::test]
    async fn test_tag_locks_share_per_tag() {
        let locks = TagLocks::new();
        let a = locks.lock_for("main_gas_valve");
        let b = locks.lock_for("main_gas_valve");
        assert!(Arc::ptr_eq(&a, &b));
        let _held = a.lock().await;
        assert!(b.try_lock().is_err());
        assert!(locks.lock_for("vent_valve").try_lock().is_ok());
    }
}
