//! Global logical key to backend id mapping table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tasksync_protocol::{BackendId, LogicalKey};

/// Per-key entry of the mapping table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyEntry {
    /// Backend-local id of the task on each backend that holds it.
    #[serde(default)]
    pub ids: BTreeMap<BackendId, String>,
    /// Set when the key was resolved to a deletion that has not yet
    /// reached every backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl KeyEntry {
    /// Returns true if the entry carries no information.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.deleted_at.is_none()
    }
}

/// Mapping table shared by all backends.
///
/// Records which backend-local id each logical key has on each backend,
/// so backends that cannot store the logical key themselves still map
/// their tasks onto the same key every cycle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdMap {
    entries: BTreeMap<LogicalKey, KeyEntry>,
}

impl IdMap {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for `key`.
    pub fn get(&self, key: &LogicalKey) -> Option<&KeyEntry> {
        self.entries.get(key)
    }

    /// Iterates over all entries in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&LogicalKey, &KeyEntry)> {
        self.entries.iter()
    }

    /// Returns the number of keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the id `key` has on `backend`.
    pub fn id_for(&self, key: &LogicalKey, backend: &BackendId) -> Option<&str> {
        self.entries
            .get(key)
            .and_then(|entry| entry.ids.get(backend))
            .map(String::as_str)
    }

    /// Builds a backend-local id to logical key index for `backend`.
    pub fn reverse_index(&self, backend: &BackendId) -> HashMap<String, LogicalKey> {
        self.entries
            .iter()
            .filter_map(|(key, entry)| entry.ids.get(backend).map(|id| (id.clone(), key.clone())))
            .collect()
    }

    /// Records that `key` lives on `backend` under `id`.
    pub fn record(&mut self, key: LogicalKey, backend: BackendId, id: impl Into<String>) {
        self.entries.entry(key).or_default().ids.insert(backend, id.into());
    }

    /// Forgets `key` on `backend`.
    pub fn forget(&mut self, key: &LogicalKey, backend: &BackendId) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.ids.remove(backend);
            if entry.is_empty() {
                self.entries.remove(key);
            }
        }
    }

    /// Marks `key` as deleted at `at`.
    pub fn tombstone(&mut self, key: LogicalKey, at: DateTime<Utc>) {
        let entry = self.entries.entry(key).or_default();
        entry.deleted_at = Some(entry.deleted_at.map_or(at, |prev| prev.max(at)));
    }

    /// Clears a deletion tombstone (the task was restored).
    pub fn clear_tombstone(&mut self, key: &LogicalKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.deleted_at = None;
            if entry.is_empty() {
                self.entries.remove(key);
            }
        }
    }

    /// Returns the deletion tombstone of `key`.
    pub fn tombstone_of(&self, key: &LogicalKey) -> Option<DateTime<Utc>> {
        self.entries.get(key).and_then(|entry| entry.deleted_at)
    }

    /// Removes every entry for which `keep` returns false.
    pub fn retain(&mut self, mut keep: impl FnMut(&LogicalKey, &mut KeyEntry) -> bool) {
        self.entries.retain(|key, entry| keep(key, entry));
    }
}
