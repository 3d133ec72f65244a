//! Last-value cache fed by the pipeline
//!
//! [`LiveValueStore`] keeps the most recent record per key and a
//! snapshot-complete flag. Readers on other tasks (the management
//! surface, application code) query it concurrently with the processing
//! unit writing to it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use feed_types::record::LiveRecord;
use tracing::{debug, info};

use crate::dispatcher::RecordProcessor;

/// Notified synchronously on every stored value.
pub trait ValueUpdateListener<T>: Send + Sync {
    fn value_updated(&self, key: &str, value: &T);
}

/// Notified when the initial load of values has completed.
pub trait DataStateListener: Send + Sync {
    fn values_refreshed(&self);
}

#[derive(Default)]
struct SnapshotState {
    complete: bool,
    listener: Option<Arc<dyn DataStateListener>>,
}

/// Keyed last-value cache.
pub struct LiveValueStore<T> {
    values: DashMap<String, T>,
    snapshot: Mutex<SnapshotState>,
    update_listener: RwLock<Option<Arc<dyn ValueUpdateListener<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> LiveValueStore<T> {
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
            snapshot: Mutex::new(SnapshotState::default()),
            update_listener: RwLock::new(None),
        }
    }

    fn snapshot_state(&self) -> MutexGuard<'_, SnapshotState> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Overwrite the value for `key`, then notify the update listener.
    pub fn store_value(&self, key: impl Into<String>, value: T) {
        let key = key.into();
        self.values.insert(key.clone(), value.clone());

        let listener = self
            .update_listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            listener.value_updated(&key, &value);
        }
    }

    pub fn get_latest_value(&self, key: &str) -> Option<T> {
        self.values.get(key).map(|entry| entry.value().clone())
    }

    /// True iff a value has ever been stored for `key`.
    pub fn is_data_available(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Cached keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Copy of every cached value, sorted by key.
    pub fn snapshot(&self) -> Vec<(String, T)> {
        let mut entries: Vec<(String, T)> = self
            .values
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn is_snapshot_complete(&self) -> bool {
        self.snapshot_state().complete
    }

    /// Set the snapshot flag. Setting it to `true` notifies the data-state
    /// listener, if one is registered.
    pub fn set_snapshot_complete(&self, complete: bool) {
        // Decide under the lock, call outside it; a listener registered
        // concurrently is then notified exactly once, by one side or the
        // other.
        let listener = {
            let mut state = self.snapshot_state();
            state.complete = complete;
            if complete {
                state.listener.clone()
            } else {
                None
            }
        };
        info!(complete, cached_keys = self.values.len(), "Snapshot state changed");
        if let Some(listener) = listener {
            listener.values_refreshed();
        }
    }

    /// Register (or replace) the data-state listener. If the snapshot is
    /// already complete it is notified immediately.
    pub fn set_data_state_listener(&self, listener: Arc<dyn DataStateListener>) {
        let fire = {
            let mut state = self.snapshot_state();
            state.listener = Some(Arc::clone(&listener));
            state.complete
        };
        if fire {
            listener.values_refreshed();
        }
    }

    pub fn set_value_update_listener(&self, listener: Arc<dyn ValueUpdateListener<T>>) {
        *self
            .update_listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }
}

impl<T: Clone + Send + Sync + 'static> Default for LiveValueStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Record processor that writes into a [`LiveValueStore`]. A snapshot
/// marker completes the snapshot instead of being stored.
pub struct StoreProcessor<T> {
    store: Arc<LiveValueStore<T>>,
}

impl<T> StoreProcessor<T> {
    pub fn new(store: Arc<LiveValueStore<T>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<T: LiveRecord> RecordProcessor<T> for StoreProcessor<T> {
    async fn process(&self, record: T) -> anyhow::Result<()> {
        if record.is_snapshot_marker() {
            self.store.set_snapshot_complete(true);
            return Ok(());
        }
        debug!(key = record.key(), "Storing value");
        let key = record.key().to_string();
        self.store.store_value(key, record);
        Ok(())
    }
}
