//! File-backed snapshot store.
//!
//! Layout of the state directory:
//!
//! ```text
//! <state_dir>/
//! ├─ LOCK                   # Advisory lock, one owning process
//! ├─ mappings.json          # Logical key to backend id table
//! └─ snapshots/
//!    ├─ <backend>.json      # Last committed snapshot per backend
//!    └─ ...
//! ```
//!
//! Every file is replaced with write-then-rename, so a crash leaves either
//! the old or the new content, never a mix.

use crate::error::{StoreError, StoreResult};
use crate::mappings::IdMap;
use crate::snapshot::{Snapshot, SnapshotFile};
use crate::store::SnapshotStore;
use fs2::FileExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tasksync_protocol::BackendId;
use tracing::debug;

const LOCK_FILE: &str = "LOCK";
const MAPPINGS_FILE: &str = "mappings.json";
const SNAPSHOTS_DIR: &str = "snapshots";
const TEMP_SUFFIX: &str = "tmp";

/// Snapshot store persisted as JSON files in a directory.
///
/// # Thread Safety
///
/// The store holds an exclusive lock on the directory for its lifetime.
/// Within the process, commits are serialized by an internal mutex.
#[derive(Debug)]
pub struct FileSnapshotStore {
    path: PathBuf,
    write_lock: Mutex<()>,
    _lock_file: File,
}

impl FileSnapshotStore {
    /// Opens or creates a state directory.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (returns `Locked`)
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> StoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(StoreError::Io(std::io::Error::new(
                    ErrorKind::NotFound,
                    format!("state directory does not exist: {}", path.display()),
                )));
            }
        }

        if !path.is_dir() {
            return Err(StoreError::Corrupted {
                path: path.to_path_buf(),
                message: "not a directory".into(),
            });
        }

        fs::create_dir_all(path.join(SNAPSHOTS_DIR))?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
            _lock_file: lock_file,
        })
    }

    /// Returns the state directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the snapshot file of `backend`.
    pub fn snapshot_path(&self, backend: &BackendId) -> PathBuf {
        self.path
            .join(SNAPSHOTS_DIR)
            .join(format!("{}.json", backend.as_str()))
    }

    /// Returns the mapping table file.
    pub fn mappings_path(&self) -> PathBuf {
        self.path.join(MAPPINGS_FILE)
    }

    fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if data.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| StoreError::Corrupted {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
    }

    /// Replaces `target` atomically:
    /// 1. Write to a temporary file next to it
    /// 2. Sync the temporary file
    /// 3. Rename over the target
    /// 4. Sync the parent directory so the rename is durable
    fn write_atomic(target: &Path, data: &[u8]) -> StoreResult<()> {
        let mut temp_name = target.as_os_str().to_owned();
        temp_name.push(".");
        temp_name.push(TEMP_SUFFIX);
        let temp_path = PathBuf::from(temp_name);

        let result = (|| -> StoreResult<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
            drop(file);
            fs::rename(&temp_path, target)?;
            Ok(())
        })();

        if result.is_err() && temp_path.is_file() {
            let _ = fs::remove_file(&temp_path);
        }
        result?;

        if let Some(parent) = target.parent() {
            sync_directory(parent)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn sync_directory(dir: &Path) -> StoreResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> StoreResult<()> {
    // NTFS journals metadata; directories cannot be fsynced on Windows.
    Ok(())
}

impl SnapshotStore for FileSnapshotStore {
    fn get(&self, backend: &BackendId) -> StoreResult<Snapshot> {
        let file: Option<SnapshotFile> = Self::read_json(&self.snapshot_path(backend))?;
        Ok(file.map(Snapshot::from).unwrap_or_default())
    }

    fn commit(&self, backend: &BackendId, snapshot: Snapshot) -> StoreResult<()> {
        let data = serde_json::to_vec_pretty(&SnapshotFile::from(&snapshot))?;
        let _guard = self.write_lock.lock();
        Self::write_atomic(&self.snapshot_path(backend), &data)?;
        debug!(backend = %backend, tasks = snapshot.len(), "snapshot committed");
        Ok(())
    }

    fn mappings(&self) -> StoreResult<IdMap> {
        Ok(Self::read_json(&self.mappings_path())?.unwrap_or_default())
    }

    fn commit_mappings(&self, mappings: IdMap) -> StoreResult<()> {
        let data = serde_json::to_vec_pretty(&mappings)?;
        let _guard = self.write_lock.lock();
        Self::write_atomic(&self.mappings_path(), &data)?;
        debug!(keys = mappings.len(), "mapping table committed");
        Ok(())
    }

    fn backends(&self) -> StoreResult<Vec<BackendId>> {
        let mut backends = Vec::new();
        for entry in fs::read_dir(self.path.join(SNAPSHOTS_DIR))? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                backends.push(BackendId::new(stem)?);
            }
        }
        backends.sort();
        Ok(backends)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use tasksync_protocol::{LogicalKey, Task};
    use tempfile::tempdir;

    fn backend(id: &str) -> BackendId {
        BackendId::new(id).unwrap()
    }

    fn snapshot_with(key: &str, title: &str) -> Snapshot {
        let at = Utc.timestamp_opt(1_696_118_400, 0).unwrap();
        let mut tasks = BTreeMap::new();
        tasks.insert(
            LogicalKey::from(key),
            Task::new("1", title, at)
                .with_logical_key(key)
                .with_due_date(Some(at)),
        );
        Snapshot::new(tasks, at)
    }

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let state = temp.path().join("state");

        let store = FileSnapshotStore::open(&state, true).unwrap();
        assert!(state.join("snapshots").is_dir());
        assert_eq!(store.path(), state.as_path());
    }

    #[test]
    fn open_fails_if_not_exists_and_no_create() {
        let temp = tempdir().unwrap();
        assert!(FileSnapshotStore::open(&temp.path().join("missing"), false).is_err());
    }

    #[test]
    fn lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let _first = FileSnapshotStore::open(temp.path(), true).unwrap();
        assert!(matches!(
            FileSnapshotStore::open(temp.path(), true),
            Err(StoreError::Locked)
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        {
            let _store = FileSnapshotStore::open(temp.path(), true).unwrap();
        }
        let _again = FileSnapshotStore::open(temp.path(), true).unwrap();
    }

    #[test]
    fn snapshot_round_trip() {
        let temp = tempdir().unwrap();
        let store = FileSnapshotStore::open(temp.path(), true).unwrap();

        assert!(store.get(&backend("a")).unwrap().is_empty());

        let snapshot = snapshot_with("T1", "Task 1");
        store.commit(&backend("a"), snapshot.clone()).unwrap();
        assert_eq!(store.get(&backend("a")).unwrap(), snapshot);
        assert_eq!(store.backends().unwrap(), vec![backend("a")]);

        let raw = fs::read_to_string(store.snapshot_path(&backend("a"))).unwrap();
        assert!(raw.contains("\"dueDate\": \"2023-10-01T00:00:00Z\""));
    }

    #[test]
    fn failed_commit_keeps_previous_snapshot() {
        let temp = tempdir().unwrap();
        let store = FileSnapshotStore::open(temp.path(), true).unwrap();
        let before = snapshot_with("T1", "before");
        store.commit(&backend("a"), before.clone()).unwrap();

        // A directory squatting on the temp path makes the write fail.
        let snapshot_path = store.snapshot_path(&backend("a"));
        let squatter = PathBuf::from(format!("{}.tmp", snapshot_path.display()));
        fs::create_dir(&squatter).unwrap();

        assert!(store.commit(&backend("a"), snapshot_with("T2", "after")).is_err());
        assert_eq!(store.get(&backend("a")).unwrap(), before);
        assert!(squatter.is_dir());
    }

    #[test]
    fn mappings_round_trip() {
        let temp = tempdir().unwrap();
        let store = FileSnapshotStore::open(temp.path(), true).unwrap();
        assert!(store.mappings().unwrap().is_empty());

        let mut map = IdMap::new();
        map.record("T1".into(), backend("a"), "1");
        map.record("T1".into(), backend("b"), "b-1");
        map.tombstone("T3".into(), Utc.timestamp_opt(5, 0).unwrap());
        store.commit_mappings(map.clone()).unwrap();

        assert_eq!(store.mappings().unwrap(), map);
    }

    #[test]
    fn corrupted_snapshot_is_reported() {
        let temp = tempdir().unwrap();
        let store = FileSnapshotStore::open(temp.path(), true).unwrap();
        fs::write(store.snapshot_path(&backend("a")), b"{not json").unwrap();

        assert!(matches!(
            store.get(&backend("a")),
            Err(StoreError::Corrupted { .. })
        ));
    }
}
