//! Test fixtures and engine helpers.
//!
//! Timestamps are seconds after 2024-01-01T00:00:00Z so tests can reason
//! about ordering with small integers.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tasksync_engine::{BackendAdapter, CycleReport, MemoryBackend, SyncConfig, SyncEngine};
use tasksync_protocol::{BackendId, LogicalKey, Task};
use tasksync_store::MemorySnapshotStore;

const EPOCH: i64 = 1_704_067_200;

/// Returns the timestamp `secs` seconds after the fixture epoch.
pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(EPOCH + secs, 0)
        .single()
        .expect("timestamp in range")
}

/// Returns a backend id, panicking on invalid names.
pub fn backend_id(name: &str) -> BackendId {
    BackendId::new(name).expect("valid backend id")
}

/// Builds an open task carrying its logical key.
pub fn task(id: &str, key: &str, title: &str, secs: i64) -> Task {
    Task::new(id, title, ts(secs)).with_logical_key(key)
}

/// An engine over in-memory backends and an in-memory store.
pub struct SyncHarness {
    /// The engine.
    pub engine: SyncEngine<Arc<MemorySnapshotStore>>,
    /// The store, shared with the engine.
    pub store: Arc<MemorySnapshotStore>,
    backends: BTreeMap<String, Arc<MemoryBackend>>,
}

impl SyncHarness {
    /// Creates a harness with default configuration.
    pub fn new(names: &[&str]) -> Self {
        Self::with_config(names, SyncConfig::default())
    }

    /// Creates a harness with `config`.
    pub fn with_config(names: &[&str], config: SyncConfig) -> Self {
        let store = Arc::new(MemorySnapshotStore::new());
        let mut engine = SyncEngine::new(config, Arc::clone(&store));
        let mut backends = BTreeMap::new();
        for name in names {
            let backend = Arc::new(MemoryBackend::new(*name));
            engine
                .register(backend_id(name), backend.clone() as Arc<dyn BackendAdapter>)
                .expect("unique backend names");
            backends.insert((*name).to_string(), backend);
        }
        Self {
            engine,
            store,
            backends,
        }
    }

    /// Returns the backend called `name`.
    pub fn backend(&self, name: &str) -> &Arc<MemoryBackend> {
        self.backends
            .get(name)
            .unwrap_or_else(|| panic!("no backend named {name}"))
    }

    /// Iterates over all backends.
    pub fn backends(&self) -> impl Iterator<Item = &Arc<MemoryBackend>> {
        self.backends.values()
    }

    /// Runs a cycle, panicking if it aborts.
    pub fn sync(&self) -> CycleReport {
        self.engine.sync().expect("sync cycle")
    }

    /// Content of every task on `name`, by logical key.
    pub fn contents(&self, name: &str) -> BTreeMap<LogicalKey, (String, bool, Option<DateTime<Utc>>)> {
        self.backend(name)
            .tasks()
            .into_iter()
            .map(|t| (t.logical_key.clone(), (t.title, t.completed, t.due_date)))
            .collect()
    }

    /// Returns true if every backend holds the same tasks with the same content.
    pub fn is_converged(&self) -> bool {
        let mut names = self.backends.keys();
        let Some(first) = names.next() else {
            return true;
        };
        let reference = self.contents(first);
        names.all(|name| self.contents(name) == reference)
    }
}
