//! Inspect command implementation.

use serde::Serialize;
use std::path::Path;
use tasksync_store::{FileSnapshotStore, SnapshotStore};

/// Summary of one backend's snapshot.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSummary {
    /// Backend id.
    pub backend: String,
    /// Number of tasks in the snapshot.
    pub tasks: usize,
    /// Number of completed tasks.
    pub completed: usize,
    /// Commit time of the snapshot.
    pub synced_at: Option<String>,
}

/// Summary of a state directory.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSummary {
    /// State directory.
    pub path: String,
    /// Per-backend snapshots.
    pub backends: Vec<BackendSummary>,
    /// Logical keys in the mapping table.
    pub mapped_keys: usize,
    /// Keys with a pending deletion.
    pub tombstones: Vec<String>,
}

/// Runs the inspect command.
pub fn run(state: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let summary = summarize(state)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&summary)?),
        "text" => print_text(&summary),
        other => return Err(format!("Unknown format: {other}").into()),
    }
    Ok(())
}

/// Collects the summary of the state directory at `state`.
pub fn summarize(state: &Path) -> Result<StateSummary, Box<dyn std::error::Error>> {
    let store = FileSnapshotStore::open(state, false)?;

    let mut backends = Vec::new();
    for backend in store.backends()? {
        let snapshot = store.get(&backend)?;
        backends.push(BackendSummary {
            backend: backend.to_string(),
            tasks: snapshot.len(),
            completed: snapshot.tasks.values().filter(|task| task.completed).count(),
            synced_at: snapshot.synced_at.map(|at| at.to_rfc3339()),
        });
    }

    let mappings = store.mappings()?;
    let tombstones = mappings
        .entries()
        .filter(|(_, entry)| entry.deleted_at.is_some())
        .map(|(key, _)| key.to_string())
        .collect();

    Ok(StateSummary {
        path: state.display().to_string(),
        backends,
        mapped_keys: mappings.len(),
        tombstones,
    })
}

fn print_text(summary: &StateSummary) {
    println!("State directory: {}", summary.path);
    println!();

    if summary.backends.is_empty() {
        println!("No snapshots committed yet");
    } else {
        println!("Snapshots:");
        for backend in &summary.backends {
            println!(
                "  {:<16} {:>5} tasks ({} completed), synced {}",
                backend.backend,
                backend.tasks,
                backend.completed,
                backend.synced_at.as_deref().unwrap_or("never")
            );
        }
    }

    println!();
    println!("Mapping table: {} key(s)", summary.mapped_keys);
    if !summary.tombstones.is_empty() {
        println!("Pending deletions: {}", summary.tombstones.join(", "));
    }
}
