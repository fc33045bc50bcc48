//! Polled snapshot store over a raw hardware source.
//!
//! A background task reads every readable tag from the [`TagSource`] at a fixed
//! cadence and publishes the result as a snapshot. Reads are served from the
//! most recent snapshot, so staleness is bounded by one poll interval. Writes
//! bypass the snapshot and go straight to the source, serialized per tag.
//!
//! Raw values are converted to engineering units with each tag's declared scale.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{TagCatalog, TagLocks, TagStore, TagValue};
use crate::error::TagError;

/// Raw hardware boundary (PLC, fieldbus driver). Values are in raw units.
#[async_trait]
pub trait TagSource: Send + Sync {
    /// Reads the given tags in one round trip.
    async fn read_many(&self, tags: &[String]) -> Result<HashMap<String, TagValue>, TagError>;

    /// Writes one raw value.
    async fn write_raw(&self, tag: &str, raw: TagValue) -> Result<(), TagError>;
}

#[derive(Debug, Default)]
struct Snapshot {
    values: HashMap<String, TagValue>,
    taken_at: Option<Instant>,
}

struct Shared {
    source: Arc<dyn TagSource>,
    catalog: Arc<TagCatalog>,
    readable: Vec<String>,
    snapshot: RwLock<Snapshot>,
    locks: TagLocks,
}

impl Shared {
    async fn poll_once(&self) -> Result<(), TagError> {
        let raw = self.source.read_many(&self.readable).await?;
        let values = raw
            .into_iter()
            .filter_map(|(tag, value)| {
                let def = self.catalog.get(&tag)?;
                Some((tag, def.from_raw(value)))
            })
            .collect();

        let mut snapshot = self.snapshot.write().await;
        snapshot.values = values;
        snapshot.taken_at = Some(Instant::now());
        Ok(())
    }
}

/// Tag Store that serves reads from a periodically refreshed snapshot.
pub struct PolledTagStore {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    poller: std::sync::Mutex<Option<JoinHandle<()>>>,
    poll_interval: Duration,
}

impl PolledTagStore {
    /// Starts the poll loop. Must be called inside a tokio runtime.
    pub fn spawn(
        source: Arc<dyn TagSource>,
        catalog: Arc<TagCatalog>,
        poll_interval: Duration,
    ) -> Self {
        let mut readable: Vec<String> = catalog
            .iter()
            .filter(|d| d.access.readable())
            .map(|d| d.name.clone())
            .collect();
        readable.sort();

        let shared = Arc::new(Shared {
            source,
            catalog,
            readable,
            snapshot: RwLock::new(Snapshot::default()),
            locks: TagLocks::new(),
        });
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task_shared = Arc::clone(&shared);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                tags = task_shared.readable.len(),
                ?poll_interval,
                "tag poller started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = task_shared.poll_once().await {
                            warn!(error = %e, "tag poll failed, keeping previous snapshot");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("tag poller stopped");
        });

        Self {
            shared,
            shutdown,
            poller: std::sync::Mutex::new(Some(handle)),
            poll_interval,
        }
    }

    /// Forces a poll outside the regular cadence.
    pub async fn refresh(&self) -> Result<(), TagError> {
        self.shared.poll_once().await
    }

    /// Age of the current snapshot, if one has been taken.
    pub async fn snapshot_age(&self) -> Option<Duration> {
        self.shared
            .snapshot
            .read()
            .await
            .taken_at
            .map(|t| t.elapsed())
    }

    /// Snapshot refresh cadence.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Stops the poll loop and waits for it to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handle = match self.poller.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "tag poller task ended abnormally");
            }
        }
    }
}

impl Drop for PolledTagStore {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[async_trait]
impl TagStore for PolledTagStore {
    async fn read(&self, tag: &str) -> Result<TagValue, TagError> {
        if self.shared.catalog.get(tag).is_none() {
            return Err(TagError::UnknownTag(tag.to_string()));
        }
        self.shared
            .snapshot
            .read()
            .await
            .values
            .get(tag)
            .copied()
            .ok_or_else(|| TagError::Unavailable(tag.to_string()))
    }

    async fn write(&self, tag: &str, value: TagValue) -> Result<(), TagError> {
        let value = self.shared.catalog.check_write(tag, value)?;
        let raw = match self.shared.catalog.get(tag) {
            Some(def) => def.to_raw(value),
            None => return Err(TagError::UnknownTag(tag.to_string())),
        };
        let lock = self.shared.locks.lock_for(tag);
        let _guard = lock.lock().await;
        debug!(tag, %value, %raw, "writing tag");
        self.shared.source.write_raw(tag, raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::{TagAccess, TagDefinition, TagKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct MemorySource {
        values: Mutex<HashMap<String, TagValue>>,
        polls: AtomicUsize,
        writes: Mutex<Vec<(String, TagValue)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl TagSource for MemorySource {
        async fn read_many(
            &self,
            tags: &[String],
        ) -> Result<HashMap<String, TagValue>, TagError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let values = self.values.lock().await;
            Ok(tags
                .iter()
                .filter_map(|t| values.get(t).map(|v| (t.clone(), *v)))
                .collect())
        }

        async fn write_raw(&self, tag: &str, raw: TagValue) -> Result<(), TagError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.writes.lock().await.push((tag.to_string(), raw));
            self.values.lock().await.insert(tag.to_string(), raw);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn catalog() -> Arc<TagCatalog> {
        let mut catalog = TagCatalog::new();
        catalog.insert(
            TagDefinition::new("chamber_pressure", TagKind::Float, TagAccess::Read)
                .with_scale(0.01),
        );
        catalog.insert(
            TagDefinition::new("main_flow_setpoint", TagKind::Float, TagAccess::ReadWrite)
                .with_range(0.0, 100.0),
        );
        Arc::new(catalog)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_come_from_snapshot() {
        let source = Arc::new(MemorySource::default());
        source
            .values
            .lock()
            .await
            .insert("chamber_pressure".into(), TagValue::Int(76000));

        let store = PolledTagStore::spawn(source.clone(), catalog(), Duration::from_millis(50));
        // Let the immediate first tick run.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            store.read("chamber_pressure").await.unwrap(),
            TagValue::Float(760.0)
        );
        assert!(store.snapshot_age().await.is_some());

        // Source changes are invisible until the next poll.
        source
            .values
            .lock()
            .await
            .insert("chamber_pressure".into(), TagValue::Int(200));
        assert_eq!(
            store.read("chamber_pressure").await.unwrap(),
            TagValue::Float(760.0)
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            store.read("chamber_pressure").await.unwrap(),
            TagValue::Float(2.0)
        );
        assert!(source.polls.load(Ordering::SeqCst) >= 2);
        store.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpolled_tag_is_unavailable() {
        let source = Arc::new(MemorySource::default());
        let store = PolledTagStore::spawn(source, catalog(), Duration::from_millis(50));
        store.refresh().await.unwrap();
        assert_eq!(
            store.read("chamber_pressure").await,
            Err(TagError::Unavailable("chamber_pressure".into()))
        );
        assert_eq!(
            store.read("unknown").await,
            Err(TagError::UnknownTag("unknown".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_to_one_tag_are_serialized() {
        let source = Arc::new(MemorySource::default());
        let store = Arc::new(PolledTagStore::spawn(
            source.clone(),
            catalog(),
            Duration::from_millis(50),
        ));

        let a = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .write("main_flow_setpoint", TagValue::Float(10.0))
                    .await
            })
        };
        let b = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .write("main_flow_setpoint", TagValue::Float(20.0))
                    .await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(source.writes.lock().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_checks_catalog_before_source() {
        let source = Arc::new(MemorySource::default());
        let store = PolledTagStore::spawn(source.clone(), catalog(), Duration::from_millis(50));
        assert!(matches!(
            store
                .write("main_flow_setpoint", TagValue::Float(150.0))
                .await,
            Err(TagError::OutOfRange { .. })
        ));
        assert!(matches!(
            store.write("chamber_pressure", TagValue::Float(1.0)).await,
            Err(TagError::ReadOnly(_))
        ));
        assert!(source.writes.lock().await.is_empty());
    }
}
