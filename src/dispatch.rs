//! Action Dispatcher.
//!
//! Maps dotted action names (`gas.set_main_flow`, `motion.move_xy`, ...) to
//! one or more Tag Store writes. The mapping is a static catalog: the loader
//! rejects any action name not listed here, so an unknown action can never
//! reach run time.
//!
//! Each [`ActionSpec`] declares:
//! - its argument contract (checked at bind time, see [`ActionSpec::bind_args`])
//! - the tags it writes (checked against the tag catalog at load time)
//! - a plan function producing the concrete writes, including any clamping the
//!   action promises (e.g. deagglomerator duty cycle limited to 20-35 %)

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::error::{BindError, ConfigError, StepFailure};
use crate::params;
use crate::tags::{TagCatalog, TagKind, TagStore, TagValue};

// =============================================================================
// Arguments
// =============================================================================

/// Expected shape of one action argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    /// Boolean, or a switch state such as `"open"`/`"closed"`.
    Flag,
    /// Finite number.
    Number,
    /// Whole number; `2.0` counts.
    Integer,
    /// One of a fixed set of strings.
    Choice(&'static [&'static str]),
}

/// One entry of an action's argument contract.
#[derive(Clone, Copy, Debug)]
pub struct ArgSpec {
    /// Argument name.
    pub name: &'static str,
    /// Expected value shape.
    pub kind: ArgKind,
    /// Binding fails when a required argument is missing.
    pub required: bool,
}

const fn req(name: &'static str, kind: ArgKind) -> ArgSpec {
    ArgSpec {
        name,
        kind,
        required: true,
    }
}

const fn opt(name: &'static str, kind: ArgKind) -> ArgSpec {
    ArgSpec {
        name,
        kind,
        required: false,
    }
}

/// A checked argument value.
#[derive(Clone, Debug, PartialEq)]
pub enum ArgValue {
    /// Checked boolean.
    Flag(bool),
    /// Checked number.
    Number(f64),
    /// Checked integer.
    Integer(i64),
    /// One of the allowed choices.
    Choice(String),
}

/// Arguments that passed an action's contract.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ActionArgs(HashMap<String, ArgValue>);

impl ActionArgs {
    /// Boolean argument, if present.
    pub fn flag(&self, name: &str) -> Option<bool> {
        match self.0.get(name) {
            Some(ArgValue::Flag(v)) => Some(*v),
            _ => None,
        }
    }

    /// Numeric argument. Integers widen.
    pub fn number(&self, name: &str) -> Option<f64> {
        match self.0.get(name) {
            Some(ArgValue::Number(v)) => Some(*v),
            Some(ArgValue::Integer(v)) => Some(*v as f64),
            _ => None,
        }
    }

    /// Integer argument, if present.
    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.0.get(name) {
            Some(ArgValue::Integer(v)) => Some(*v),
            _ => None,
        }
    }

    /// Choice argument, if present.
    pub fn choice(&self, name: &str) -> Option<&str> {
        match self.0.get(name) {
            Some(ArgValue::Choice(v)) => Some(v),
            _ => None,
        }
    }

    /// Number of bound arguments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no arguments were bound.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn convert(kind: ArgKind, value: &Value) -> Result<ArgValue, String> {
    match kind {
        ArgKind::Flag => match value {
            Value::Bool(b) => Ok(ArgValue::Flag(*b)),
            Value::String(s) => match s.as_str() {
                "on" | "open" | "true" => Ok(ArgValue::Flag(true)),
                "off" | "closed" | "close" | "false" => Ok(ArgValue::Flag(false)),
                other => Err(format!("'{other}' is not a switch state")),
            },
            other => Err(format!("expected a boolean, got {other}")),
        },
        ArgKind::Number => value
            .as_f64()
            .filter(|v| v.is_finite())
            .map(ArgValue::Number)
            .ok_or_else(|| format!("expected a number, got {value}")),
        ArgKind::Integer => params::whole_number(value)
            .map(ArgValue::Integer)
            .ok_or_else(|| format!("expected an integer, got {value}")),
        ArgKind::Choice(options) => match value.as_str() {
            Some(s) if options.contains(&s) => Ok(ArgValue::Choice(s.to_string())),
            _ => Err(format!(
                "expected one of [{}], got {value}",
                options.join(", ")
            )),
        },
    }
}

// =============================================================================
// Catalog
// =============================================================================

/// One concrete tag write produced by an action.
#[derive(Clone, Debug, PartialEq)]
pub struct PlannedWrite {
    /// Tag to write.
    pub tag: &'static str,
    /// Value in engineering units.
    pub value: TagValue,
}

fn write(tag: &'static str, value: TagValue) -> PlannedWrite {
    PlannedWrite { tag, value }
}

/// Static description of one dotted action.
pub struct ActionSpec {
    /// Dotted name used in definition documents.
    pub name: &'static str,
    /// One-line summary.
    pub description: &'static str,
    /// Argument contract.
    pub args: &'static [ArgSpec],
    /// Every tag the plan may write, with the kind it writes.
    pub tags: &'static [(&'static str, TagKind)],
    plan: fn(&ActionArgs) -> Vec<PlannedWrite>,
}

impl fmt::Debug for ActionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionSpec")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("tags", &self.tags)
            .finish()
    }
}

impl ActionSpec {
    /// Checks resolved arguments against the contract. Unknown names are ignored
    /// so a `from` base object may carry extra fields.
    pub fn bind_args(&self, raw: &Map<String, Value>) -> Result<ActionArgs, BindError> {
        let mut args = HashMap::new();
        for spec in self.args {
            match raw.get(spec.name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(BindError::MissingArgument {
                        action: self.name.to_string(),
                        argument: spec.name.to_string(),
                    })
                }
                None | Some(Value::Null) => {}
                Some(value) => {
                    let v = convert(spec.kind, value).map_err(|reason| {
                        BindError::InvalidArgument {
                            action: self.name.to_string(),
                            argument: spec.name.to_string(),
                            reason,
                        }
                    })?;
                    args.insert(spec.name.to_string(), v);
                }
            }
        }
        for key in raw.keys() {
            if !self.args.iter().any(|a| a.name == key) {
                debug!(action = self.name, argument = %key, "ignoring unused argument");
            }
        }
        Ok(ActionArgs(args))
    }

    /// Concrete writes for already-bound arguments.
    pub fn plan(&self, args: &ActionArgs) -> Vec<PlannedWrite> {
        (self.plan)(args)
    }

    /// Load-time check that every tag this action writes is declared,
    /// writable and of the kind the action produces.
    pub fn check_tags(&self, catalog: &TagCatalog) -> Result<(), ConfigError> {
        let context = format!("action '{}'", self.name);
        for (tag, kind) in self.tags {
            let def = catalog.get(tag).ok_or_else(|| ConfigError::UnknownTag {
                context: context.clone(),
                tag: tag.to_string(),
            })?;
            if !def.access.writable() {
                return Err(ConfigError::TagMismatch {
                    context,
                    tag: tag.to_string(),
                    reason: "tag is read-only".to_string(),
                });
            }
            if def.kind != *kind {
                return Err(ConfigError::TagMismatch {
                    context,
                    tag: tag.to_string(),
                    reason: format!("tag is {}, action writes {}", def.kind, kind),
                });
            }
        }
        Ok(())
    }
}

fn clamp(arg: &str, value: f64, min: f64, max: f64) -> f64 {
    let clamped = value.clamp(min, max);
    if clamped != value {
        debug!(arg, value, clamped, "argument clamped to action range");
    }
    clamped
}

fn flag_write(args: &ActionArgs, arg: &str, tag: &'static str) -> Vec<PlannedWrite> {
    vec![write(tag, TagValue::Bool(args.flag(arg).unwrap_or(false)))]
}

fn float_write(
    args: &ActionArgs,
    arg: &str,
    tag: &'static str,
    min: f64,
    max: f64,
) -> Vec<PlannedWrite> {
    let v = clamp(arg, args.number(arg).unwrap_or(min), min, max);
    vec![write(tag, TagValue::Float(v))]
}

const ON_OFF: &[ArgSpec] = &[req("open", ArgKind::Flag)];
const PUMP: &[ArgSpec] = &[req("on", ArgKind::Flag)];
const GATE_POSITIONS: &[&str] = &["open", "partial", "closed"];

/// Stage travel and actuator ranges promised by the action contracts.
pub mod limits {
    /// Main gas flow, SLPM.
    pub const MAIN_FLOW_SLPM: (f64, f64) = (0.0, 100.0);
    /// Feeder gas flow, SLPM.
    pub const FEEDER_FLOW_SLPM: (f64, f64) = (0.0, 10.0);
    /// Powder feeder frequency, Hz.
    pub const FEEDER_FREQUENCY_HZ: (f64, f64) = (0.0, 1200.0);
    /// Deagglomerator duty cycle, percent.
    pub const DEAGGLOMERATOR_DUTY_PCT: (f64, f64) = (20.0, 35.0);
    /// Deagglomerator frequency, Hz.
    pub const DEAGGLOMERATOR_FREQUENCY_HZ: (f64, f64) = (0.0, 500.0);
    /// X and Y travel, mm.
    pub const XY_TRAVEL_MM: (f64, f64) = (0.0, 300.0);
    /// Z travel, mm.
    pub const Z_TRAVEL_MM: (f64, f64) = (0.0, 100.0);
    /// XY velocity, mm/s.
    pub const XY_VELOCITY_MM_S: (f64, f64) = (0.0, 500.0);
    /// Z velocity, mm/s.
    pub const Z_VELOCITY_MM_S: (f64, f64) = (0.0, 50.0);
    /// Selectable hardware sets.
    pub const HARDWARE_SETS: (i64, i64) = (1, 2);
    /// Duty cycle that stops the deagglomerator.
    pub const DEAGGLOMERATOR_IDLE_PCT: f64 = 35.0;
}

use limits::*;

fn plan_gate_valve(args: &ActionArgs) -> Vec<PlannedWrite> {
    let (partial, open) = match args.choice("position") {
        Some("open") => (false, true),
        Some("partial") => (true, false),
        _ => (false, false),
    };
    vec![
        write("gate_valve_partial", TagValue::Bool(partial)),
        write("gate_valve_open", TagValue::Bool(open)),
    ]
}

fn plan_nozzle(args: &ActionArgs) -> Vec<PlannedWrite> {
    let (lo, hi) = HARDWARE_SETS;
    let n = args.integer("nozzle").unwrap_or(lo).clamp(lo, hi);
    vec![write("nozzle_select", TagValue::Int(n))]
}

fn plan_move_xy(args: &ActionArgs) -> Vec<PlannedWrite> {
    let (lo, hi) = XY_TRAVEL_MM;
    let mut writes = Vec::with_capacity(4);
    if let Some(v) = args.number("velocity") {
        let (vlo, vhi) = XY_VELOCITY_MM_S;
        writes.push(write(
            "motion_xy_velocity",
            TagValue::Float(clamp("velocity", v, vlo, vhi)),
        ));
    }
    let x = clamp("x", args.number("x").unwrap_or(lo), lo, hi);
    let y = clamp("y", args.number("y").unwrap_or(lo), lo, hi);
    writes.push(write("motion_x_target", TagValue::Float(x)));
    writes.push(write("motion_y_target", TagValue::Float(y)));
    writes.push(write("motion_xy_start", TagValue::Bool(true)));
    writes
}

fn plan_move_z(args: &ActionArgs) -> Vec<PlannedWrite> {
    let (lo, hi) = Z_TRAVEL_MM;
    let mut writes = Vec::with_capacity(3);
    if let Some(v) = args.number("velocity") {
        let (vlo, vhi) = Z_VELOCITY_MM_S;
        writes.push(write(
            "motion_z_velocity",
            TagValue::Float(clamp("velocity", v, vlo, vhi)),
        ));
    }
    let z = clamp("z", args.number("z").unwrap_or(lo), lo, hi);
    writes.push(write("motion_z_target", TagValue::Float(z)));
    writes.push(write("motion_z_start", TagValue::Bool(true)));
    writes
}

fn plan_select_set(args: &ActionArgs) -> Vec<PlannedWrite> {
    let (lo, hi) = HARDWARE_SETS;
    let set = args.integer("set").unwrap_or(lo).clamp(lo, hi);
    vec![
        write("active_hardware_set", TagValue::Int(set)),
        write("nozzle_select", TagValue::Int(set)),
    ]
}

fn plan_feeder_on(args: &ActionArgs) -> Vec<PlannedWrite> {
    let mut writes = vec![write("feeder_gas_valve", TagValue::Bool(true))];
    writes.extend(float_write(
        args,
        "flow",
        "feeder_flow_setpoint",
        FEEDER_FLOW_SLPM.0,
        FEEDER_FLOW_SLPM.1,
    ));
    writes.extend(float_write(
        args,
        "frequency",
        "feeder_frequency",
        FEEDER_FREQUENCY_HZ.0,
        FEEDER_FREQUENCY_HZ.1,
    ));
    writes.extend(float_write(
        args,
        "duty_cycle",
        "deagglomerator_duty_cycle",
        DEAGGLOMERATOR_DUTY_PCT.0,
        DEAGGLOMERATOR_DUTY_PCT.1,
    ));
    writes
}

fn plan_feeder_off(_: &ActionArgs) -> Vec<PlannedWrite> {
    vec![
        write("feeder_frequency", TagValue::Float(0.0)),
        write(
            "deagglomerator_duty_cycle",
            TagValue::Float(DEAGGLOMERATOR_IDLE_PCT),
        ),
        write("feeder_flow_setpoint", TagValue::Float(0.0)),
        write("feeder_gas_valve", TagValue::Bool(false)),
    ]
}

static CATALOG: &[ActionSpec] = &[
    ActionSpec {
        name: "valves.main_gas_valve",
        description: "Open or close the main process gas valve",
        args: ON_OFF,
        tags: &[("main_gas_valve", TagKind::Bool)],
        plan: |a| flag_write(a, "open", "main_gas_valve"),
    },
    ActionSpec {
        name: "valves.feeder_gas_valve",
        description: "Open or close the powder feeder gas valve",
        args: ON_OFF,
        tags: &[("feeder_gas_valve", TagKind::Bool)],
        plan: |a| flag_write(a, "open", "feeder_gas_valve"),
    },
    ActionSpec {
        name: "valves.vent_valve",
        description: "Open or close the chamber vent valve",
        args: ON_OFF,
        tags: &[("vent_valve", TagKind::Bool)],
        plan: |a| flag_write(a, "open", "vent_valve"),
    },
    ActionSpec {
        name: "valves.gate_valve",
        description: "Move the pump gate valve to open, partial or closed",
        args: &[req("position", ArgKind::Choice(GATE_POSITIONS))],
        tags: &[
            ("gate_valve_partial", TagKind::Bool),
            ("gate_valve_open", TagKind::Bool),
        ],
        plan: plan_gate_valve,
    },
    ActionSpec {
        name: "gas.set_main_flow",
        description: "Main gas flow setpoint in SLPM",
        args: &[req("flow", ArgKind::Number)],
        tags: &[("main_flow_setpoint", TagKind::Float)],
        plan: |a| float_write(a, "flow", "main_flow_setpoint", MAIN_FLOW_SLPM.0, MAIN_FLOW_SLPM.1),
    },
    ActionSpec {
        name: "gas.set_feeder_flow",
        description: "Feeder carrier gas flow setpoint in SLPM",
        args: &[req("flow", ArgKind::Number)],
        tags: &[("feeder_flow_setpoint", TagKind::Float)],
        plan: |a| {
            float_write(
                a,
                "flow",
                "feeder_flow_setpoint",
                FEEDER_FLOW_SLPM.0,
                FEEDER_FLOW_SLPM.1,
            )
        },
    },
    ActionSpec {
        name: "feeder.set_frequency",
        description: "Powder feeder drive frequency in Hz",
        args: &[req("frequency", ArgKind::Number)],
        tags: &[("feeder_frequency", TagKind::Float)],
        plan: |a| {
            float_write(
                a,
                "frequency",
                "feeder_frequency",
                FEEDER_FREQUENCY_HZ.0,
                FEEDER_FREQUENCY_HZ.1,
            )
        },
    },
    ActionSpec {
        name: "deagglomerator.set_duty_cycle",
        description: "Deagglomerator duty cycle in percent (35 = idle)",
        args: &[req("duty_cycle", ArgKind::Number)],
        tags: &[("deagglomerator_duty_cycle", TagKind::Float)],
        plan: |a| {
            float_write(
                a,
                "duty_cycle",
                "deagglomerator_duty_cycle",
                DEAGGLOMERATOR_DUTY_PCT.0,
                DEAGGLOMERATOR_DUTY_PCT.1,
            )
        },
    },
    ActionSpec {
        name: "deagglomerator.set_frequency",
        description: "Deagglomerator drive frequency in Hz",
        args: &[req("frequency", ArgKind::Number)],
        tags: &[("deagglomerator_frequency", TagKind::Float)],
        plan: |a| {
            float_write(
                a,
                "frequency",
                "deagglomerator_frequency",
                DEAGGLOMERATOR_FREQUENCY_HZ.0,
                DEAGGLOMERATOR_FREQUENCY_HZ.1,
            )
        },
    },
    ActionSpec {
        name: "vacuum.mechanical_pump",
        description: "Start or stop the mechanical roughing pump",
        args: PUMP,
        tags: &[("mechanical_pump_on", TagKind::Bool)],
        plan: |a| flag_write(a, "on", "mechanical_pump_on"),
    },
    ActionSpec {
        name: "vacuum.booster_pump",
        description: "Start or stop the booster pump",
        args: PUMP,
        tags: &[("booster_pump_on", TagKind::Bool)],
        plan: |a| flag_write(a, "on", "booster_pump_on"),
    },
    ActionSpec {
        name: "nozzle.select",
        description: "Select the active nozzle (1 or 2)",
        args: &[req("nozzle", ArgKind::Integer)],
        tags: &[("nozzle_select", TagKind::Int)],
        plan: plan_nozzle,
    },
    ActionSpec {
        name: "shutter.control_shutter",
        description: "Open or close the spray shutter",
        args: ON_OFF,
        tags: &[("shutter_open", TagKind::Bool)],
        plan: |a| flag_write(a, "open", "shutter_open"),
    },
    ActionSpec {
        name: "motion.move_xy",
        description: "Absolute XY move in mm, optional velocity in mm/s",
        args: &[
            req("x", ArgKind::Number),
            req("y", ArgKind::Number),
            opt("velocity", ArgKind::Number),
        ],
        tags: &[
            ("motion_xy_velocity", TagKind::Float),
            ("motion_x_target", TagKind::Float),
            ("motion_y_target", TagKind::Float),
            ("motion_xy_start", TagKind::Bool),
        ],
        plan: plan_move_xy,
    },
    ActionSpec {
        name: "motion.move_z",
        description: "Absolute Z move in mm, optional velocity in mm/s",
        args: &[req("z", ArgKind::Number), opt("velocity", ArgKind::Number)],
        tags: &[
            ("motion_z_velocity", TagKind::Float),
            ("motion_z_target", TagKind::Float),
            ("motion_z_start", TagKind::Bool),
        ],
        plan: plan_move_z,
    },
    ActionSpec {
        name: "motion.home",
        description: "Home all axes",
        args: &[],
        tags: &[("motion_home", TagKind::Bool)],
        plan: |_| vec![write("motion_home", TagValue::Bool(true))],
    },
    ActionSpec {
        name: "hardware_sets.select",
        description: "Make hardware set 1 or 2 (nozzle plus feeder) active",
        args: &[req("set", ArgKind::Integer)],
        tags: &[
            ("active_hardware_set", TagKind::Int),
            ("nozzle_select", TagKind::Int),
        ],
        plan: plan_select_set,
    },
    ActionSpec {
        name: "hardware_sets.feeder_on",
        description: "Start powder feed: carrier gas, feeder and deagglomerator",
        args: &[
            req("flow", ArgKind::Number),
            req("frequency", ArgKind::Number),
            req("duty_cycle", ArgKind::Number),
        ],
        tags: &[
            ("feeder_gas_valve", TagKind::Bool),
            ("feeder_flow_setpoint", TagKind::Float),
            ("feeder_frequency", TagKind::Float),
            ("deagglomerator_duty_cycle", TagKind::Float),
        ],
        plan: plan_feeder_on,
    },
    ActionSpec {
        name: "hardware_sets.feeder_off",
        description: "Stop powder feed and close the feeder gas valve",
        args: &[],
        tags: &[
            ("feeder_frequency", TagKind::Float),
            ("deagglomerator_duty_cycle", TagKind::Float),
            ("feeder_flow_setpoint", TagKind::Float),
            ("feeder_gas_valve", TagKind::Bool),
        ],
        plan: plan_feeder_off,
    },
];

/// Looks up a built-in action by dotted name.
pub fn lookup(name: &str) -> Option<&'static ActionSpec> {
    CATALOG.iter().find(|spec| spec.name == name)
}

/// Every built-in action.
pub fn catalog() -> &'static [ActionSpec] {
    CATALOG
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Performs actions against a Tag Store.
#[derive(Clone)]
pub struct ActionDispatcher {
    tags: Arc<dyn TagStore>,
}

impl ActionDispatcher {
    /// Dispatcher writing through `tags`.
    pub fn new(tags: Arc<dyn TagStore>) -> Self {
        Self { tags }
    }

    /// Writes every planned tag in order. Stops at the first failed write.
    /// Returns the number of acknowledged writes.
    pub async fn dispatch(
        &self,
        spec: &ActionSpec,
        args: &ActionArgs,
    ) -> Result<usize, StepFailure> {
        let writes = spec.plan(args);
        for w in &writes {
            debug!(action = spec.name, tag = w.tag, value = %w.value, "dispatching write");
            if let Err(source) = self.tags.write(w.tag, w.value).await {
                error!(action = spec.name, tag = w.tag, error = %source, "hardware write failed");
                return Err(StepFailure::HardwareWrite {
                    action: spec.name.to_string(),
                    tag: w.tag.to_string(),
                    source,
                });
            }
        }
        Ok(writes.len())
    }

    /// Looks up, binds and dispatches in one call. Intended for manual
    /// operator commands outside a sequence.
    pub async fn dispatch_named(
        &self,
        name: &str,
        args: &Map<String, Value>,
    ) -> crate::error::EngineResult<usize> {
        let spec = lookup(name).ok_or_else(|| {
            ConfigError::Invalid(format!("unknown action '{name}'"))
        })?;
        let args = spec.bind_args(args)?;
        Ok(self.dispatch(spec, &args).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::{SimulatedTagStore, TagAccess, TagDefinition};
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_catalog_names_are_unique() {
        for (i, a) in CATALOG.iter().enumerate() {
            assert!(
                CATALOG[i + 1..].iter().all(|b| b.name != a.name),
                "duplicate action {}",
                a.name
            );
        }
    }

    #[test]
    fn test_standard_catalog_covers_every_action() {
        let tags = TagCatalog::standard();
        for spec in catalog() {
            spec.check_tags(&tags).unwrap();
        }
    }

    #[test]
    fn test_check_tags_rejects_read_only_and_kind_mismatch() {
        let mut tags = TagCatalog::new();
        tags.insert(TagDefinition::new(
            "main_flow_setpoint",
            TagKind::Float,
            TagAccess::Read,
        ));
        let spec = lookup("gas.set_main_flow").unwrap();
        assert!(matches!(
            spec.check_tags(&tags),
            Err(ConfigError::TagMismatch { .. })
        ));

        tags.insert(TagDefinition::new(
            "main_flow_setpoint",
            TagKind::Int,
            TagAccess::ReadWrite,
        ));
        assert!(matches!(
            spec.check_tags(&tags),
            Err(ConfigError::TagMismatch { .. })
        ));

        assert!(matches!(
            lookup("shutter.control_shutter").unwrap().check_tags(&tags),
            Err(ConfigError::UnknownTag { .. })
        ));
    }

    #[test]
    fn test_bind_args_checks_contract() {
        let spec = lookup("motion.move_xy").unwrap();
        let args = spec
            .bind_args(&obj(json!({"x": 10, "y": 20.5, "name": "start"})))
            .unwrap();
        assert_eq!(args.number("x"), Some(10.0));
        assert_eq!(args.number("y"), Some(20.5));
        assert_eq!(args.number("velocity"), None);

        assert!(matches!(
            spec.bind_args(&obj(json!({"x": 10}))),
            Err(BindError::MissingArgument { .. })
        ));
        assert!(matches!(
            spec.bind_args(&obj(json!({"x": 10, "y": "far"}))),
            Err(BindError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_flag_accepts_switch_words() {
        let spec = lookup("shutter.control_shutter").unwrap();
        let args = spec.bind_args(&obj(json!({"open": "open"}))).unwrap();
        assert_eq!(args.flag("open"), Some(true));
        assert!(spec.bind_args(&obj(json!({"open": "ajar"}))).is_err());
    }

    #[test]
    fn test_duty_cycle_is_clamped() {
        let spec = lookup("deagglomerator.set_duty_cycle").unwrap();
        let args = spec.bind_args(&obj(json!({"duty_cycle": 80}))).unwrap();
        assert_eq!(
            spec.plan(&args),
            vec![write("deagglomerator_duty_cycle", TagValue::Float(35.0))]
        );
        let args = spec.bind_args(&obj(json!({"duty_cycle": 5}))).unwrap();
        assert_eq!(
            spec.plan(&args),
            vec![write("deagglomerator_duty_cycle", TagValue::Float(20.0))]
        );
    }

    #[test]
    fn test_gate_valve_positions() {
        let spec = lookup("valves.gate_valve").unwrap();
        let args = spec
            .bind_args(&obj(json!({"position": "partial"})))
            .unwrap();
        assert_eq!(
            spec.plan(&args),
            vec![
                write("gate_valve_partial", TagValue::Bool(true)),
                write("gate_valve_open", TagValue::Bool(false)),
            ]
        );
        assert!(spec
            .bind_args(&obj(json!({"position": "half"})))
            .is_err());
    }

    #[test]
    fn test_move_xy_writes_velocity_only_when_given() {
        let spec = lookup("motion.move_xy").unwrap();
        let args = spec.bind_args(&obj(json!({"x": 1, "y": 2}))).unwrap();
        assert_eq!(spec.plan(&args).len(), 3);
        let args = spec
            .bind_args(&obj(json!({"x": 1, "y": 2, "velocity": 20})))
            .unwrap();
        let plan = spec.plan(&args);
        assert_eq!(plan.len(), 4);
        assert_eq!(plan[0].tag, "motion_xy_velocity");
        assert_eq!(plan[3], write("motion_xy_start", TagValue::Bool(true)));
    }

    #[test]
    fn test_dispatch_from_blocking_caller() {
        let store = Arc::new(SimulatedTagStore::new(Arc::new(TagCatalog::standard())));
        let dispatcher = ActionDispatcher::new(store.clone());
        let args = obj(json!({"open": "closed"}));
        let n = tokio_test::assert_ok!(tokio_test::block_on(
            dispatcher.dispatch_named("valves.vent_valve", &args)
        ));
        assert_eq!(n, 1);
        let journal = tokio_test::block_on(store.journal());
        assert_eq!(journal[0].value, TagValue::Bool(false));
    }

    #[tokio::test]
    async fn test_dispatch_writes_in_order() {
        let store = Arc::new(SimulatedTagStore::new(Arc::new(TagCatalog::standard())));
        let dispatcher = ActionDispatcher::new(store.clone());
        let n = dispatcher
            .dispatch_named("hardware_sets.feeder_off", &Map::new())
            .await
            .unwrap();
        assert_eq!(n, 4);

        let tags: Vec<_> = store.journal().await.into_iter().map(|w| w.tag).collect();
        assert_eq!(
            tags,
            vec![
                "feeder_frequency",
                "deagglomerator_duty_cycle",
                "feeder_flow_setpoint",
                "feeder_gas_valve"
            ]
        );
    }

    #[tokio::test]
    async fn test_dispatch_stops_at_first_failed_write() {
        let store = Arc::new(SimulatedTagStore::new(Arc::new(TagCatalog::standard())));
        store.fail_writes("motion_y_target").await;
        let dispatcher = ActionDispatcher::new(store.clone());
        let spec = lookup("motion.move_xy").unwrap();
        let args = spec.bind_args(&obj(json!({"x": 5, "y": 5}))).unwrap();

        let err = dispatcher.dispatch(spec, &args).await.unwrap_err();
        match err {
            StepFailure::HardwareWrite { action, tag, .. } => {
                assert_eq!(action, "motion.move_xy");
                assert_eq!(tag, "motion_y_target");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.writes_to("motion_xy_start").await, 0);
    }
}
