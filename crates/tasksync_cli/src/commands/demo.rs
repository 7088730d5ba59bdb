//! Demo command implementation.
//!
//! Two in-memory backends share T1 and T3, then drift apart:
//! - T1: completed on `b` after `a` last touched it
//! - T2: created on `a` only
//! - T3: deleted on `a`, then edited on `b`

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tasksync_engine::{MemoryBackend, SyncConfig, SyncEngine};
use tasksync_protocol::{BackendId, Task};
use tasksync_store::MemorySnapshotStore;

/// Runs the demo command.
pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    let base = DateTime::<Utc>::from_timestamp(1_704_099_600, 0).ok_or("invalid demo epoch")?;
    let at = |minutes: i64| base + Duration::minutes(minutes);

    let a = Arc::new(MemoryBackend::new("a"));
    let b = Arc::new(MemoryBackend::new("b"));
    a.put(Task::new("a-1", "Buy milk", at(0)).with_logical_key("T1"));
    a.put(Task::new("a-3", "Call plumber", at(0)).with_logical_key("T3"));
    b.put(Task::new("b-1", "Buy milk", at(0)).with_logical_key("T1"));
    b.put(Task::new("b-3", "Call plumber", at(0)).with_logical_key("T3"));

    let config = SyncConfig::default().with_priority([BackendId::new("a")?, BackendId::new("b")?]);
    let engine = SyncEngine::new(config, MemorySnapshotStore::new())
        .with_backend(BackendId::new("a")?, a.clone())?
        .with_backend(BackendId::new("b")?, b.clone())?;

    let baseline = engine.sync()?;
    println!("Baseline cycle: {} operation(s)", baseline.planned);

    b.edit("b-1", |task| {
        task.completed = true;
        task.updated_at = at(10);
    });
    a.put(Task::new("a-2", "Pay rent", at(15)).with_logical_key("T2"));
    a.remove("a-3", at(20));
    b.edit("b-3", |task| {
        task.title = "Call plumber about the sink".into();
        task.updated_at = at(30);
    });

    println!();
    println!("Before:");
    dump(&a);
    dump(&b);

    let report = engine.sync()?;
    println!();
    println!("Cycle:");
    print!("{report}");

    println!();
    println!("After:");
    dump(&a);
    dump(&b);

    let second = engine.sync()?;
    println!();
    println!("Next cycle: {} operation(s)", second.planned);
    Ok(())
}

fn dump(backend: &MemoryBackend) {
    println!("  {}:", backend.name());
    for task in backend.tasks() {
        println!(
            "    {:<4} {:<6} [{}] {}  (updated {})",
            task.logical_key.as_str(),
            task.id,
            if task.completed { "x" } else { " " },
            task.title,
            task.updated_at.format("%H:%M")
        );
    }
}
