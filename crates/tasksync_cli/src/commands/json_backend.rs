//! Backend adapter over a JSON task file.
//!
//! File layout:
//!
//! ```json
//! {
//!   "tasks": [ { "id": "...", "title": "...", ... } ],
//!   "tombstones": [ { "id": "...", "deletedAt": "..." } ],
//!   "applied": { "<idempotence token>": "<task id>" }
//! }
//! ```
//!
//! A missing file is an empty backend. Every write replaces the file with
//! write-then-rename. A repeated token is skipped only while its effect is
//! still visible in the file. Only the latest token per task id is kept.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tasksync_engine::{AdapterError, AdapterResult, BackendAdapter};
use tasksync_protocol::{IdempotenceToken, Task, Tombstone};
use uuid::Uuid;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskFile {
    #[serde(default)]
    tasks: Vec<Task>,
    #[serde(default)]
    tombstones: Vec<Tombstone>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    applied: BTreeMap<String, String>,
}

impl TaskFile {
    fn position(&self, id: &str) -> Option<usize> {
        self.tasks.iter().position(|task| task.id == id)
    }
}

/// Task backend stored in a single JSON file.
///
/// Each call reads the file, so edits made by other tools between cycles are
/// picked up. Calls within the process are serialized by a mutex.
#[derive(Debug)]
pub struct JsonFileBackend {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileBackend {
    /// Opens the backend stored at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Returns the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> AdapterResult<TaskFile> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(TaskFile::default()),
            Err(e) => return Err(io_error(&self.path, e)),
        };
        if data.is_empty() {
            return Ok(TaskFile::default());
        }
        serde_json::from_slice(&data).map_err(|e| {
            AdapterError::permanent(format!("{}: malformed task file: {e}", self.path.display()))
        })
    }

    fn store(&self, file: &TaskFile) -> AdapterResult<()> {
        let data = serde_json::to_vec_pretty(file)
            .map_err(|e| AdapterError::permanent(format!("cannot encode task file: {e}")))?;

        let mut temp_name = self.path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);

        let result = (|| -> std::io::Result<()> {
            let mut temp = File::create(&temp_path)?;
            temp.write_all(&data)?;
            temp.sync_all()?;
            drop(temp);
            fs::rename(&temp_path, &self.path)
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path);
            return Err(io_error(&self.path, e));
        }
        Ok(())
    }

    /// Runs `apply` unless `token` was applied before and `holds` confirms
    /// its effect is still in the file, then persists the file.
    ///
    /// Returns the id recorded for the token.
    fn apply_once(
        &self,
        token: &IdempotenceToken,
        holds: impl FnOnce(&TaskFile, &str) -> bool,
        apply: impl FnOnce(&mut TaskFile) -> AdapterResult<String>,
    ) -> AdapterResult<String> {
        let _guard = self.lock.lock();
        let mut file = self.load()?;
        if let Some(id) = file.applied.get(token.as_str()) {
            if holds(&file, id) {
                return Ok(id.clone());
            }
        }
        let id = apply(&mut file)?;
        file.applied.retain(|_, seen| *seen != id);
        file.applied.insert(token.as_str().to_string(), id.clone());
        self.store(&file)?;
        Ok(id)
    }
}

fn io_error(path: &Path, error: std::io::Error) -> AdapterError {
    AdapterError::transient(format!("{}: {error}", path.display()))
}

impl BackendAdapter for JsonFileBackend {
    fn fetch_tasks(&self) -> AdapterResult<Vec<Task>> {
        let _guard = self.lock.lock();
        Ok(self.load()?.tasks)
    }

    fn fetch_tombstones(&self) -> AdapterResult<Vec<Tombstone>> {
        let _guard = self.lock.lock();
        Ok(self.load()?.tombstones)
    }

    fn create_task(&self, task: &Task, token: &IdempotenceToken) -> AdapterResult<String> {
        let present = |file: &TaskFile, recorded: &str| file.position(recorded).is_some();
        self.apply_once(token, present, |file| {
            let id = Uuid::new_v4().to_string();
            file.tasks.push(task.clone().with_id(id.clone()));
            Ok(id)
        })
    }

    fn update_task(&self, id: &str, task: &Task, token: &IdempotenceToken) -> AdapterResult<()> {
        let current = |file: &TaskFile, recorded: &str| {
            file.position(recorded)
                .is_some_and(|index| file.tasks[index].same_content(task))
        };
        self.apply_once(token, current, |file| {
            let index = file.position(id).ok_or_else(|| AdapterError::not_found(id))?;
            file.tasks[index] = task.clone().with_id(id);
            Ok(id.to_string())
        })
        .map(|_| ())
    }

    fn delete_task(&self, id: &str, token: &IdempotenceToken) -> AdapterResult<()> {
        let gone = |file: &TaskFile, recorded: &str| file.position(recorded).is_none();
        self.apply_once(token, gone, |file| {
            let index = file.position(id).ok_or_else(|| AdapterError::not_found(id))?;
            file.tasks.remove(index);
            file.tombstones.push(Tombstone::new(id, Utc::now()));
            Ok(id.to_string())
        })
        .map(|_| ())
    }

    fn forget_tombstones(&self, ids: &[String]) -> AdapterResult<()> {
        let _guard = self.lock.lock();
        let mut file = self.load()?;
        let before = (file.tombstones.len(), file.applied.len());
        file.tombstones.retain(|t| !ids.contains(&t.id));
        file.applied.retain(|_, id| !ids.contains(id));
        if (file.tombstones.len(), file.applied.len()) == before {
            return Ok(());
        }
        self.store(&file)
    }
}
