//! Property-based test generators using proptest.
//!
//! Logical keys are drawn from a small pool so that independently
//! generated backends overlap and produce conflicts.

use crate::fixtures::{task, ts};
use proptest::prelude::*;
use std::collections::BTreeMap;
use tasksync_engine::MemoryBackend;
use tasksync_protocol::Task;

/// Pool of logical keys shared by all generated backends.
pub const KEY_POOL: &[&str] = &["T0", "T1", "T2", "T3", "T4", "T5", "T6", "T7"];

/// Strategy for a key from [`KEY_POOL`].
pub fn key_strategy() -> impl Strategy<Value = &'static str> {
    prop::sample::select(KEY_POOL)
}

/// Strategy for task titles.
pub fn title_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{1,8}( [a-z]{1,8})?").expect("Invalid regex")
}

/// Strategy for task content: title, completion flag, optional due date.
pub fn content_strategy() -> impl Strategy<Value = (String, bool, Option<i64>)> {
    (
        title_strategy(),
        any::<bool>(),
        prop::option::of(0i64..10_000),
    )
}

/// Strategy for the task list of one backend named `name`.
///
/// Keys are unique within the list, ids are `<name>-<key>`.
pub fn backend_tasks_strategy(name: &'static str) -> impl Strategy<Value = Vec<Task>> {
    prop::collection::btree_map(key_strategy(), (content_strategy(), 0i64..1_000), 0..6)
        .prop_map(move |entries| {
            entries
                .into_iter()
                .map(|(key, ((title, completed, due), secs))| {
                    task(&format!("{name}-{key}"), key, &title, secs)
                        .with_completed(completed)
                        .with_due_date(due.map(ts))
                })
                .collect()
        })
}

/// An edit a user makes directly on one backend between cycles.
#[derive(Debug, Clone)]
pub enum Edit {
    /// Create a task under `key` (or overwrite the one already there).
    Put {
        /// Logical key.
        key: &'static str,
        /// New title.
        title: String,
        /// New completion flag.
        completed: bool,
    },
    /// Delete the task under `key`, if any.
    Delete {
        /// Logical key.
        key: &'static str,
    },
}

/// Strategy for a single edit.
pub fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        3 => (key_strategy(), title_strategy(), any::<bool>())
            .prop_map(|(key, title, completed)| Edit::Put { key, title, completed }),
        1 => key_strategy().prop_map(|key| Edit::Delete { key }),
    ]
}

/// Strategy for edits per backend, keyed by backend position.
pub fn edits_strategy(backends: usize) -> impl Strategy<Value = BTreeMap<usize, Vec<Edit>>> {
    prop::collection::btree_map(0..backends, prop::collection::vec(edit_strategy(), 0..4), 0..=backends)
}

/// Applies `edit` to `backend` with timestamp `secs`.
pub fn apply_edit(backend: &MemoryBackend, edit: &Edit, secs: i64) {
    match edit {
        Edit::Put {
            key,
            title,
            completed,
        } => match backend.task_by_key(key) {
            Some(existing) => {
                backend.edit(&existing.id, |t| {
                    t.title = title.clone();
                    t.completed = *completed;
                    t.updated_at = ts(secs);
                });
            }
            None => {
                backend.put(task("", key, title, secs).with_completed(*completed));
            }
        },
        Edit::Delete { key } => {
            if let Some(existing) = backend.task_by_key(key) {
                backend.remove(&existing.id, ts(secs));
            }
        }
    }
}
