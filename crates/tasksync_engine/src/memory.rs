//! In-memory backend adapter.

use crate::adapter::{AdapterError, AdapterResult, BackendAdapter};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tasksync_protocol::{IdempotenceToken, Task, Tombstone};

/// Adapter call that an injected failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailOn {
    /// `fetch_tasks`.
    Fetch,
    /// `create_task`.
    Create,
    /// `update_task`.
    Update,
    /// `delete_task`.
    Delete,
}

/// Number of adapter calls made, per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// `fetch_tasks` calls.
    pub fetch: u32,
    /// `create_task` calls.
    pub create: u32,
    /// `update_task` calls.
    pub update: u32,
    /// `delete_task` calls.
    pub delete: u32,
}

#[derive(Debug)]
struct Injected {
    on: FailOn,
    error: AdapterError,
    remaining: u32,
    after_apply: bool,
}

#[derive(Debug, Default)]
struct Inner {
    tasks: BTreeMap<String, Task>,
    tombstones: Vec<Tombstone>,
    next_id: u64,
    seen_tokens: HashMap<IdempotenceToken, String>,
    failures: Vec<Injected>,
    calls: CallCounts,
}

impl Inner {
    /// Pops the next failure for `on`, if one is armed.
    fn take_failure(&mut self, on: FailOn) -> Option<(AdapterError, bool)> {
        let index = self.failures.iter().position(|f| f.on == on)?;
        let failure = &mut self.failures[index];
        let taken = (failure.error.clone(), failure.after_apply);
        failure.remaining = failure.remaining.saturating_sub(1);
        if failure.remaining == 0 {
            self.failures.remove(index);
        }
        Some(taken)
    }

    /// Returns the id recorded for `token` if `holds` confirms its effect is
    /// still in place.
    fn applied(
        &self,
        token: &IdempotenceToken,
        holds: impl FnOnce(&Self, &str) -> bool,
    ) -> Option<String> {
        let id = self.seen_tokens.get(token)?;
        holds(self, id).then(|| id.clone())
    }

    /// Records `token` for `id`, replacing tokens of earlier writes to it.
    fn remember(&mut self, token: &IdempotenceToken, id: &str) {
        self.seen_tokens.retain(|_, seen| seen.as_str() != id);
        self.seen_tokens.insert(token.clone(), id.to_string());
    }

    /// Returns an unused id of the form `<name>-<n>`.
    fn fresh_id(&mut self, name: &str) -> String {
        loop {
            self.next_id += 1;
            let id = format!("{name}-{}", self.next_id);
            if !self.tasks.contains_key(&id) {
                return id;
            }
        }
    }
}

/// A backend that keeps its tasks in memory.
///
/// Assigns ids of the form `<name>-<n>`, honours idempotence tokens (a
/// repeated token whose effect is still in place returns the original
/// result without applying anything), records tombstones for deletions and
/// can be told to fail specific calls.
/// Used by the test suite and the `demo` command.
#[derive(Debug)]
pub struct MemoryBackend {
    name: String,
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Creates a backend holding `tasks`.
    pub fn with_tasks(name: impl Into<String>, tasks: impl IntoIterator<Item = Task>) -> Self {
        let backend = Self::new(name);
        for task in tasks {
            backend.put(task);
        }
        backend
    }

    /// Returns the backend name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inserts or replaces a task as a user editing the backend directly would.
    ///
    /// A task with an empty id receives a fresh one, which is returned.
    pub fn put(&self, mut task: Task) -> String {
        let mut inner = self.inner.lock();
        if task.id.is_empty() {
            task.id = inner.fresh_id(&self.name);
        }
        let id = task.id.clone();
        inner.tasks.insert(id.clone(), task);
        id
    }

    /// Applies `edit` to the task `id` as an external change.
    ///
    /// Returns false if the task does not exist.
    pub fn edit(&self, id: &str, edit: impl FnOnce(&mut Task)) -> bool {
        let mut inner = self.inner.lock();
        match inner.tasks.get_mut(id) {
            Some(task) => {
                edit(task);
                task.version += 1;
                true
            }
            None => false,
        }
    }

    /// Deletes the task `id` as an external change, recording a tombstone at `at`.
    pub fn remove(&self, id: &str, at: DateTime<Utc>) -> Option<Task> {
        let mut inner = self.inner.lock();
        let removed = inner.tasks.remove(id)?;
        inner.tombstones.push(Tombstone::new(id, at));
        Some(removed)
    }

    /// Deletes the task `id` without leaving a tombstone.
    pub fn remove_silently(&self, id: &str) -> Option<Task> {
        self.inner.lock().tasks.remove(id)
    }

    /// Returns all tasks ordered by id.
    pub fn tasks(&self) -> Vec<Task> {
        self.inner.lock().tasks.values().cloned().collect()
    }

    /// Returns the task `id`.
    pub fn task(&self, id: &str) -> Option<Task> {
        self.inner.lock().tasks.get(id).cloned()
    }

    /// Returns the task stored under logical key `key`.
    pub fn task_by_key(&self, key: &str) -> Option<Task> {
        self.inner
            .lock()
            .tasks
            .values()
            .find(|task| task.logical_key.as_str() == key)
            .cloned()
    }

    /// Returns the recorded tombstones.
    pub fn tombstones(&self) -> Vec<Tombstone> {
        self.inner.lock().tombstones.clone()
    }

    /// Returns the number of idempotence tokens on record.
    pub fn recorded_tokens(&self) -> usize {
        self.inner.lock().seen_tokens.len()
    }

    /// Returns the number of tasks.
    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// Returns true if the backend holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes the next `times` calls of kind `on` fail with `error`.
    pub fn fail_next(&self, on: FailOn, error: AdapterError, times: u32) {
        self.inner.lock().failures.push(Injected {
            on,
            error,
            remaining: times,
            after_apply: false,
        });
    }

    /// Makes the next call of kind `on` apply its effect and then fail with
    /// `error`, as when a response is lost after the backend committed.
    pub fn fail_after_apply(&self, on: FailOn, error: AdapterError) {
        self.inner.lock().failures.push(Injected {
            on,
            error,
            remaining: 1,
            after_apply: true,
        });
    }

    /// Drops every armed failure.
    pub fn clear_failures(&self) {
        self.inner.lock().failures.clear();
    }

    /// Returns the number of calls made so far.
    pub fn calls(&self) -> CallCounts {
        self.inner.lock().calls
    }
}

impl BackendAdapter for MemoryBackend {
    fn fetch_tasks(&self) -> AdapterResult<Vec<Task>> {
        let mut inner = self.inner.lock();
        inner.calls.fetch += 1;
        if let Some((error, _)) = inner.take_failure(FailOn::Fetch) {
            return Err(error);
        }
        Ok(inner.tasks.values().cloned().collect())
    }

    fn fetch_tombstones(&self) -> AdapterResult<Vec<Tombstone>> {
        Ok(self.inner.lock().tombstones.clone())
    }

    fn create_task(&self, task: &Task, token: &IdempotenceToken) -> AdapterResult<String> {
        let mut inner = self.inner.lock();
        inner.calls.create += 1;
        let failure = inner.take_failure(FailOn::Create);
        if let Some((error, false)) = failure {
            return Err(error);
        }
        let present = |inner: &Inner, id: &str| inner.tasks.contains_key(id);
        let id = match inner.applied(token, present) {
            Some(id) => id,
            None => {
                let id = inner.fresh_id(&self.name);
                inner.tasks.insert(id.clone(), task.clone().with_id(id.clone()));
                inner.remember(token, &id);
                id
            }
        };

        match failure {
            Some((error, true)) => Err(error),
            _ => Ok(id),
        }
    }

    fn update_task(&self, id: &str, task: &Task, token: &IdempotenceToken) -> AdapterResult<()> {
        let mut inner = self.inner.lock();
        inner.calls.update += 1;
        let failure = inner.take_failure(FailOn::Update);
        if let Some((error, false)) = failure {
            return Err(error);
        }
        let current = |inner: &Inner, recorded: &str| {
            inner
                .tasks
                .get(recorded)
                .is_some_and(|stored| stored.same_content(task))
        };
        if inner.applied(token, current).is_none() {
            if !inner.tasks.contains_key(id) {
                return Err(AdapterError::not_found(id));
            }
            inner.tasks.insert(id.to_string(), task.clone().with_id(id));
            inner.remember(token, id);
        }

        match failure {
            Some((error, true)) => Err(error),
            _ => Ok(()),
        }
    }

    fn delete_task(&self, id: &str, token: &IdempotenceToken) -> AdapterResult<()> {
        let mut inner = self.inner.lock();
        inner.calls.delete += 1;
        let failure = inner.take_failure(FailOn::Delete);
        if let Some((error, false)) = failure {
            return Err(error);
        }
        let gone = |inner: &Inner, recorded: &str| !inner.tasks.contains_key(recorded);
        if inner.applied(token, gone).is_none() {
            if inner.tasks.remove(id).is_none() {
                return Err(AdapterError::not_found(id));
            }
            inner.tombstones.push(Tombstone::new(id, Utc::now()));
            inner.remember(token, id);
        }

        match failure {
            Some((error, true)) => Err(error),
            _ => Ok(()),
        }
    }

    fn forget_tombstones(&self, ids: &[String]) -> AdapterResult<()> {
        let mut inner = self.inner.lock();
        inner.tombstones.retain(|t| !ids.contains(&t.id));
        inner.seen_tokens.retain(|_, id| !ids.contains(id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tasksync_protocol::{LogicalKey, OperationKind};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn token(kind: OperationKind, key: &str, task: &Task) -> IdempotenceToken {
        IdempotenceToken::new(kind, &LogicalKey::from(key), task, None)
    }

    #[test]
    fn create_assigns_sequential_ids() {
        let backend = MemoryBackend::new("b");
        let first = Task::new("", "one", at(1)).with_logical_key("T1");
        let second = Task::new("", "two", at(1)).with_logical_key("T2");

        let id1 = backend
            .create_task(&first, &token(OperationKind::Create, "T1", &first))
            .unwrap();
        let id2 = backend
            .create_task(&second, &token(OperationKind::Create, "T2", &second))
            .unwrap();

        assert_eq!(id1, "b-1");
        assert_eq!(id2, "b-2");
        assert_eq!(backend.task_by_key("T2").unwrap().id, "b-2");
    }

    #[test]
    fn generated_ids_skip_taken_ones() {
        let backend = MemoryBackend::new("b");
        backend.put(Task::new("b-1", "manual", at(1)));

        let task = Task::new("", "created", at(2));
        let id = backend
            .create_task(&task, &token(OperationKind::Create, "T2", &task))
            .unwrap();

        assert_eq!(id, "b-2");
        assert_eq!(backend.len(), 2);
    }

    #[test]
    fn repeated_token_is_not_applied_twice() {
        let backend = MemoryBackend::new("b");
        let task = Task::new("", "one", at(1)).with_logical_key("T1");
        let token = token(OperationKind::Create, "T1", &task);

        let id1 = backend.create_task(&task, &token).unwrap();
        let id2 = backend.create_task(&task, &token).unwrap();

        assert_eq!(id1, id2);
        assert_eq!(backend.len(), 1);
        assert_eq!(backend.calls().create, 2);
    }

    #[test]
    fn injected_failures_are_consumed() {
        let backend = MemoryBackend::with_tasks("a", [Task::new("1", "x", at(1))]);
        backend.fail_next(FailOn::Fetch, AdapterError::transient("timeout"), 2);

        assert!(backend.fetch_tasks().is_err());
        assert!(backend.fetch_tasks().is_err());
        assert_eq!(backend.fetch_tasks().unwrap().len(), 1);
        assert_eq!(backend.calls().fetch, 3);
    }

    #[test]
    fn failure_after_apply_keeps_effect() {
        let backend = MemoryBackend::with_tasks("a", [Task::new("1", "x", at(1))]);
        let gone = Task::new("1", "x", at(1));
        let token = token(OperationKind::Delete, "T1", &gone);
        backend.fail_after_apply(FailOn::Delete, AdapterError::transient("lost response"));

        assert!(backend.delete_task("1", &token).is_err());
        assert!(backend.is_empty());

        // The retry is recognised and succeeds without a second deletion.
        backend.delete_task("1", &token).unwrap();
        assert_eq!(backend.tombstones().len(), 1);
    }

    #[test]
    fn repeated_token_applies_again_once_overwritten() {
        let backend = MemoryBackend::with_tasks("a", [Task::new("1", "x", at(1))]);
        let target = Task::new("1", "y", at(2));
        let token = token(OperationKind::Update, "T1", &target);
        backend.update_task("1", &target, &token).unwrap();

        backend.edit("1", |task| task.title = "z".into());
        backend.update_task("1", &target, &token).unwrap();
        assert_eq!(backend.task("1").unwrap().title, "y");
    }

    #[test]
    fn repeated_create_after_removal_creates_again() {
        let backend = MemoryBackend::new("b");
        let task = Task::new("", "one", at(1)).with_logical_key("T1");
        let token = token(OperationKind::Create, "T1", &task);

        let first = backend.create_task(&task, &token).unwrap();
        backend.remove(&first, at(5)).unwrap();
        let second = backend.create_task(&task, &token).unwrap();

        assert_ne!(first, second);
        assert_eq!(backend.task_by_key("T1").unwrap().id, second);
    }

    #[test]
    fn superseded_tokens_are_dropped() {
        let backend = MemoryBackend::with_tasks("a", [Task::new("1", "v0", at(1))]);
        for round in 1..=5 {
            let target = Task::new("1", format!("v{round}"), at(round));
            backend
                .update_task("1", &target, &token(OperationKind::Update, "T1", &target))
                .unwrap();
        }
        assert_eq!(backend.recorded_tokens(), 1);

        let gone = backend.task("1").unwrap();
        backend
            .delete_task("1", &token(OperationKind::Delete, "T1", &gone))
            .unwrap();
        backend.forget_tombstones(&["1".to_string()]).unwrap();
        assert!(backend.tombstones().is_empty());
        assert_eq!(backend.recorded_tokens(), 0);
    }

    #[test]
    fn missing_targets_report_not_found() {
        let backend = MemoryBackend::new("a");
        let task = Task::new("9", "x", at(1));
        assert_eq!(
            backend.update_task("9", &task, &token(OperationKind::Update, "T", &task)),
            Err(AdapterError::not_found("9"))
        );
        assert_eq!(
            backend.delete_task("9", &token(OperationKind::Delete, "T", &task)),
            Err(AdapterError::not_found("9"))
        );
    }

    #[test]
    fn external_removal_leaves_tombstone() {
        let backend = MemoryBackend::with_tasks("a", [Task::new("3", "x", at(1))]);
        backend.remove("3", at(7)).unwrap();

        assert!(backend.is_empty());
        assert_eq!(backend.fetch_tombstones().unwrap(), vec![Tombstone::new("3", at(7))]);
    }
}
