//! Simulated Tag Store
//!
//! In-memory stand-in for the stage's PLC. Used by the CLI and by tests.
//! All timing uses `tokio::time`, so tests running with `start_paused = true`
//! see deterministic settle times.
//!
//! Physics is modelled with [`Follow`] links: writing a source tag schedules a
//! value on a target (sensor) tag that becomes visible after a settle time.
//! Pending values are folded in lazily on read, no background task is needed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

use super::{TagCatalog, TagKind, TagLocks, TagSource, TagStore, TagValue};
use crate::error::TagError;

/// How a write to one tag moves another.
#[derive(Clone, Debug)]
pub enum Follow {
    /// `target` settles to the value written to `source`.
    Mirror {
        /// Tag whose writes are mirrored.
        source: String,
        /// Sensor tag that follows.
        target: String,
        /// Time before the target shows the value.
        settle: Duration,
    },
    /// `target` settles to `on` or `off` depending on the boolean written to `source`.
    Switch {
        /// Boolean tag that drives the switch.
        source: String,
        /// Sensor tag that follows.
        target: String,
        /// Settled value after writing `true`.
        on: TagValue,
        /// Settled value after writing `false`.
        off: TagValue,
        /// Time before the target shows the value.
        settle: Duration,
    },
}

impl Follow {
    /// `target` follows writes to `source` after `settle`.
    pub fn mirror(source: impl Into<String>, target: impl Into<String>, settle: Duration) -> Self {
        Follow::Mirror {
            source: source.into(),
            target: target.into(),
            settle,
        }
    }

    /// `target` settles to `on` or `off` as `source` is switched.
    pub fn switch(
        source: impl Into<String>,
        target: impl Into<String>,
        on: TagValue,
        off: TagValue,
        settle: Duration,
    ) -> Self {
        Follow::Switch {
            source: source.into(),
            target: target.into(),
            on,
            off,
            settle,
        }
    }

    fn source(&self) -> &str {
        match self {
            Follow::Mirror { source, .. } | Follow::Switch { source, .. } => source,
        }
    }

    /// Target tag, settled value and settle time for a write of `written`.
    fn outcome(&self, written: TagValue) -> (&str, TagValue, Duration) {
        match self {
            Follow::Mirror { target, settle, .. } => (target, written, *settle),
            Follow::Switch {
                target,
                on,
                off,
                settle,
                ..
            } => {
                let value = if written == TagValue::Bool(true) { *on } else { *off };
                (target, value, *settle)
            }
        }
    }
}

/// One acknowledged write, as recorded in the journal.
#[derive(Clone, Debug, PartialEq)]
pub struct TagWrite {
    /// Tag written.
    pub tag: String,
    /// Value written.
    pub value: TagValue,
    /// When the write was acknowledged.
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct Pending {
    value: TagValue,
    ready_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    values: HashMap<String, TagValue>,
    pending: HashMap<String, Pending>,
}

impl State {
    fn current(&self, tag: &str) -> Option<TagValue> {
        match self.pending.get(tag) {
            Some(p) if Instant::now() >= p.ready_at => Some(p.value),
            _ => self.values.get(tag).copied(),
        }
    }

    fn settle(&mut self, tag: &str) {
        let ready = matches!(self.pending.get(tag), Some(p) if Instant::now() >= p.ready_at);
        if ready {
            if let Some(p) = self.pending.remove(tag) {
                self.values.insert(tag.to_string(), p.value);
            }
        }
    }
}

/// In-memory Tag Store with settle-time physics and fault injection.
#[derive(Debug)]
pub struct SimulatedTagStore {
    catalog: Arc<TagCatalog>,
    state: RwLock<State>,
    follows: Vec<Follow>,
    failing: RwLock<HashSet<String>>,
    journal: RwLock<Vec<TagWrite>>,
    locks: TagLocks,
    write_latency: Duration,
}

impl SimulatedTagStore {
    /// Store with every tag at its zero value and no physics.
    pub fn new(catalog: Arc<TagCatalog>) -> Self {
        Self {
            catalog,
            state: RwLock::new(State::default()),
            follows: Vec::new(),
            failing: RwLock::new(HashSet::new()),
            journal: RwLock::new(Vec::new()),
            locks: TagLocks::new(),
            write_latency: Duration::ZERO,
        }
    }

    /// Store wired with the stage's nominal response times.
    pub fn with_standard_physics(catalog: Arc<TagCatalog>) -> Self {
        let settle = Duration::from_secs(1);
        let motion = Duration::from_millis(500);
        Self::new(catalog)
            .with_follow(Follow::mirror("main_flow_setpoint", "main_flow_measured", settle))
            .with_follow(Follow::mirror(
                "feeder_flow_setpoint",
                "feeder_flow_measured",
                settle,
            ))
            .with_follow(Follow::switch(
                "mechanical_pump_on",
                "chamber_pressure",
                TagValue::Float(2.0),
                TagValue::Float(760.0),
                Duration::from_secs(3),
            ))
            .with_follow(Follow::mirror("motion_x_target", "motion_x_position", motion))
            .with_follow(Follow::mirror("motion_y_target", "motion_y_position", motion))
            .with_follow(Follow::mirror("motion_z_target", "motion_z_position", motion))
            .with_follow(Follow::switch(
                "motion_home",
                "motion_homed",
                TagValue::Bool(true),
                TagValue::Bool(false),
                settle,
            ))
            .with_initial("chamber_pressure", TagValue::Float(760.0))
            .with_initial("main_supply_pressure", TagValue::Float(120.0))
    }

    /// Adds a physics link.
    pub fn with_follow(mut self, follow: Follow) -> Self {
        self.follows.push(follow);
        self
    }

    /// Sets a starting value without going through the write path.
    pub fn with_initial(mut self, tag: &str, value: TagValue) -> Self {
        self.state.get_mut().values.insert(tag.to_string(), value);
        self
    }

    /// Simulated PLC acknowledgement time per write.
    pub fn with_write_latency(mut self, latency: Duration) -> Self {
        self.write_latency = latency;
        self
    }

    /// Injects a sensor value, bypassing access checks. Cancels pending settles.
    pub async fn set(&self, tag: &str, value: TagValue) -> Result<(), TagError> {
        let def = self
            .catalog
            .get(tag)
            .ok_or_else(|| TagError::UnknownTag(tag.to_string()))?;
        let value = match (def.kind, value) {
            (TagKind::Float, TagValue::Int(v)) => TagValue::Float(v as f64),
            (kind, v) if kind == v.kind() => v,
            (expected, found) => {
                return Err(TagError::TypeMismatch {
                    tag: tag.to_string(),
                    expected,
                    found: found.kind(),
                })
            }
        };
        let mut state = self.state.write().await;
        state.pending.remove(tag);
        state.values.insert(tag.to_string(), value);
        Ok(())
    }

    /// Makes every subsequent write to `tag` fail with a hardware error.
    pub async fn fail_writes(&self, tag: &str) {
        self.failing.write().await.insert(tag.to_string());
    }

    /// Undoes [`fail_writes`](Self::fail_writes).
    pub async fn restore_writes(&self, tag: &str) {
        self.failing.write().await.remove(tag);
    }

    /// All acknowledged writes, oldest first.
    pub async fn journal(&self) -> Vec<TagWrite> {
        self.journal.read().await.clone()
    }

    /// Number of acknowledged writes to `tag`.
    pub async fn writes_to(&self, tag: &str) -> usize {
        self.journal
            .read()
            .await
            .iter()
            .filter(|w| w.tag == tag)
            .count()
    }

    /// Forgets every recorded write.
    pub async fn clear_journal(&self) {
        self.journal.write().await.clear();
    }

    fn follow_value(&self, target: &str, value: TagValue) -> TagValue {
        match (self.catalog.get(target).map(|d| d.kind), value) {
            (Some(TagKind::Float), TagValue::Int(v)) => TagValue::Float(v as f64),
            _ => value,
        }
    }
}

#[async_trait]
impl TagStore for SimulatedTagStore {
    async fn read(&self, tag: &str) -> Result<TagValue, TagError> {
        let def = self
            .catalog
            .get(tag)
            .ok_or_else(|| TagError::UnknownTag(tag.to_string()))?;
        let state = self.state.read().await;
        Ok(state.current(tag).unwrap_or_else(|| TagValue::zero(def.kind)))
    }

    async fn write(&self, tag: &str, value: TagValue) -> Result<(), TagError> {
        let value = self.catalog.check_write(tag, value)?;
        let lock = self.locks.lock_for(tag);
        let _guard = lock.lock().await;

        if self.failing.read().await.contains(tag) {
            return Err(TagError::Hardware {
                tag: tag.to_string(),
                reason: "simulated write fault".to_string(),
            });
        }
        if !self.write_latency.is_zero() {
            sleep(self.write_latency).await;
        }

        {
            let mut state = self.state.write().await;
            state.pending.remove(tag);
            state.values.insert(tag.to_string(), value);

            for follow in self.follows.iter().filter(|f| f.source() == tag) {
                let (target, settled, settle) = follow.outcome(value);
                let settled = self.follow_value(target, settled);
                state.settle(target);
                if settle.is_zero() {
                    state.pending.remove(target);
                    state.values.insert(target.to_string(), settled);
                } else {
                    state.pending.insert(
                        target.to_string(),
                        Pending {
                            value: settled,
                            ready_at: Instant::now() + settle,
                        },
                    );
                }
            }
        }

        debug!(tag, %value, "simulated write");
        self.journal.write().await.push(TagWrite {
            tag: tag.to_string(),
            value,
            at: Utc::now(),
        });
        Ok(())
    }
}

/// Lets the simulated stage stand behind a [`PolledTagStore`](super::PolledTagStore)
/// the way a PLC would, exchanging values in raw units.
#[async_trait]
impl TagSource for SimulatedTagStore {
    async fn read_many(&self, tags: &[String]) -> Result<HashMap<String, TagValue>, TagError> {
        let mut values = HashMap::with_capacity(tags.len());
        for tag in tags {
            let def = self
                .catalog
                .get(tag)
                .ok_or_else(|| TagError::UnknownTag(tag.clone()))?;
            let value = TagStore::read(self, tag).await?;
            values.insert(tag.clone(), def.to_raw(value));
        }
        Ok(values)
    }

    async fn write_raw(&self, tag: &str, raw: TagValue) -> Result<(), TagError> {
        let def = self
            .catalog
            .get(tag)
            .ok_or_else(|| TagError::UnknownTag(tag.to_string()))?;
        TagStore::write(self, tag, def.from_raw(raw)).await
    }
}
