//! In-memory, append-only record store.
//!
//! The Store maps a key (a drone or region identity) to the ordered sequence
//! of canonical records written under it. Keys appear on first write and a
//! key's sequence only ever grows; there is no delete.
//!
//! # Concurrency
//!
//! The key map sits behind a read-write lock that is held only long enough
//! to find or create a key's log. Each log has its own mutex, so writers to
//! different keys never wait on each other's appends.
//!
//! # Example
//!
//! ```rust
//! use skyrelay::store::Store;
//!
//! let store = Store::new();
//! store.append("Sul", "[15.00//70.00//1010.00//500.00]");
//! store.append("Sul", "[16.00//71.00//1011.00//501.00]");
//!
//! assert_eq!(store.read_all("Sul").len(), 2);
//! assert!(store.read_all("Norte").is_empty());
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// One key's append-only log.
type Log = Arc<Mutex<Vec<String>>>;

/// Concurrent append-only log of canonical records keyed by identity.
///
/// Share it between tasks with an `Arc<Store>`.
#[derive(Debug, Default)]
pub struct Store {
    logs: RwLock<HashMap<String, Log>>,
}

impl Store {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `value` to the log for `key`, creating the log if needed.
    pub fn append(&self, key: &str, value: impl Into<String>) {
        let log = self.log_for(key);
        log.lock().push(value.into());
    }

    /// Snapshot of the log for `key`; empty if the key has never been
    /// written.
    pub fn read_all(&self, key: &str) -> Vec<String> {
        let log = self.logs.read().get(key).cloned();
        log.map(|log| log.lock().clone()).unwrap_or_default()
    }

    /// Snapshot of every key's log, ordered by key.
    pub fn read_everything(&self) -> BTreeMap<String, Vec<String>> {
        let logs: Vec<(String, Log)> = self
            .logs
            .read()
            .iter()
            .map(|(key, log)| (key.clone(), Arc::clone(log)))
            .collect();

        logs.into_iter()
            .map(|(key, log)| {
                let values = log.lock().clone();
                (key, values)
            })
            .collect()
    }

    /// Keys that have at least one record, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.logs.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Total number of records across all keys.
    pub fn len(&self) -> usize {
        let logs: Vec<Log> = self.logs.read().values().cloned().collect();
        logs.iter().map(|log| log.lock().len()).sum()
    }

    /// Returns true if nothing has been appended yet.
    pub fn is_empty(&self) -> bool {
        self.logs.read().is_empty()
    }

    /// Finds or creates the log for `key`.
    fn log_for(&self, key: &str) -> Log {
        if let Some(log) = self.logs.read().get(key) {
            return Arc::clone(log);
        }

        let mut logs = self.logs.write();
        Arc::clone(logs.entry(key.to_string()).or_default())
    }
}
