//! Sync command implementation.

use super::json_backend::JsonFileBackend;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tasksync_engine::{CyclePreview, SyncConfig, SyncEngine};
use tasksync_protocol::BackendId;
use tasksync_store::FileSnapshotStore;
use tracing::debug;

/// Runs the sync command.
pub fn run(
    state: &Path,
    config: Option<&Path>,
    backends: &[String],
    dry_run: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if !matches!(format, "text" | "json") {
        return Err(format!("Unknown format: {format}").into());
    }

    let config = match config {
        Some(path) => SyncConfig::from_file(path)?,
        None => SyncConfig::default(),
    };

    let store = FileSnapshotStore::open(state, true)?;
    let mut engine = SyncEngine::new(config, store);
    for arg in backends {
        let (id, path) = parse_backend(arg)?;
        debug!(backend = %id, path = %path.display(), "using JSON task file");
        engine.register(id, Arc::new(JsonFileBackend::new(path)))?;
    }

    if dry_run {
        let preview = engine.preview()?;
        print_preview(&preview, format)?;
        return Ok(());
    }

    let report = engine.sync()?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report.to_json())?),
        _ => print!("{report}"),
    }

    if report.is_complete() {
        Ok(())
    } else {
        Err("Sync cycle incomplete; rerun to retry the failed backends".into())
    }
}

/// Splits a `NAME=PATH` backend argument.
fn parse_backend(arg: &str) -> Result<(BackendId, PathBuf), Box<dyn std::error::Error>> {
    let (name, path) = arg
        .split_once('=')
        .filter(|(name, path)| !name.is_empty() && !path.is_empty())
        .ok_or_else(|| format!("Invalid backend '{arg}', expected NAME=PATH"))?;
    Ok((BackendId::new(name)?, PathBuf::from(path)))
}

fn print_preview(preview: &CyclePreview, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        "json" => {
            let operations: Vec<_> = preview
                .plan
                .operations()
                .map(|op| {
                    json!({
                        "backend": op.backend.as_str(),
                        "kind": op.kind.as_str(),
                        "key": op.key.as_str(),
                        "token": op.token.as_str(),
                    })
                })
                .collect();
            let conflicts: Vec<_> = preview
                .conflicts
                .iter()
                .map(|conflict| {
                    json!({
                        "key": conflict.key.as_str(),
                        "winner": conflict.winner().map(BackendId::as_str),
                    })
                })
                .collect();
            let value = json!({ "operations": operations, "conflicts": conflicts });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        _ => {
            println!("Dry run: {} operation(s) planned", preview.plan.len());
            for (backend, ops) in preview.plan.iter() {
                if ops.is_empty() {
                    continue;
                }
                println!("  {backend}:");
                for op in ops {
                    println!("    {} {}", op.kind, op.key);
                }
            }
            for conflict in &preview.conflicts {
                match conflict.winner() {
                    Some(winner) => println!("  conflict  {} won by {winner}", conflict.key),
                    None => println!("  review    {} needs a manual decision", conflict.key),
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_arguments() {
        let (id, path) = parse_backend("work=/tmp/work.json").unwrap();
        assert_eq!(id.as_str(), "work");
        assert_eq!(path, PathBuf::from("/tmp/work.json"));

        assert!(parse_backend("work").is_err());
        assert!(parse_backend("=x.json").is_err());
        assert!(parse_backend("work=").is_err());
    }
}
