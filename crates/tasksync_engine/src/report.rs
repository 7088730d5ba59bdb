//! Outcome of one sync cycle.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tasksync_protocol::{BackendId, Conflict, ConflictOutcome, Operation};

/// An operation that did not reach its backend.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedOperation {
    /// The operation.
    pub operation: Operation,
    /// Why it did not happen.
    pub reason: String,
}

/// Result of a sync cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Number of operations planned.
    pub planned: usize,
    /// Operations the backends applied.
    pub applied: Vec<Operation>,
    /// Operations whose target was already gone.
    pub converged: Vec<Operation>,
    /// Operations that failed or were never attempted.
    pub skipped: Vec<SkippedOperation>,
    /// Conflicts settled by the policy.
    pub resolved_conflicts: Vec<Conflict>,
    /// Conflicts left for a human.
    pub manual_review: Vec<Conflict>,
    /// Backends whose snapshot was committed.
    pub committed: Vec<BackendId>,
    /// Backends left at their previous snapshot, with the reason.
    pub failed_backends: BTreeMap<BackendId, String>,
    /// Number of retried adapter calls.
    pub retries: u64,
    /// Whether the cycle was cancelled mid-execution.
    pub cancelled: bool,
    /// Why the mapping table could not be written, if it could not.
    ///
    /// Backends and snapshots keep this cycle's changes; tasks created on a
    /// backend map back through the logical key they carry.
    pub mappings_error: Option<String>,
    /// Duration of the cycle.
    pub duration: Duration,
}

impl CycleReport {
    /// Returns true if every backend was committed.
    pub fn is_complete(&self) -> bool {
        self.failed_backends.is_empty() && !self.cancelled && self.mappings_error.is_none()
    }

    /// Returns true if nothing had to be done.
    pub fn is_noop(&self) -> bool {
        self.planned == 0 && self.manual_review.is_empty()
    }

    /// Renders the report as JSON.
    pub fn to_json(&self) -> Value {
        json!({
            "planned": self.planned,
            "applied": self.applied.iter().map(operation_json).collect::<Vec<_>>(),
            "converged": self.converged.iter().map(operation_json).collect::<Vec<_>>(),
            "skipped": self.skipped.iter().map(|s| {
                let mut op = operation_json(&s.operation);
                op["reason"] = json!(s.reason);
                op
            }).collect::<Vec<_>>(),
            "resolvedConflicts": self.resolved_conflicts.iter().map(conflict_json).collect::<Vec<_>>(),
            "manualReview": self.manual_review.iter().map(conflict_json).collect::<Vec<_>>(),
            "committed": self.committed.iter().map(BackendId::as_str).collect::<Vec<_>>(),
            "failedBackends": self.failed_backends.iter()
                .map(|(b, reason)| (b.to_string(), json!(reason)))
                .collect::<serde_json::Map<_, _>>(),
            "retries": self.retries,
            "cancelled": self.cancelled,
            "mappingsError": self.mappings_error,
            "durationMs": self.duration.as_millis() as u64,
        })
    }
}

fn operation_json(op: &Operation) -> Value {
    json!({
        "backend": op.backend.as_str(),
        "kind": op.kind.as_str(),
        "key": op.key.as_str(),
        "remoteId": op.remote_id,
        "token": op.token.as_str(),
    })
}

fn conflict_json(conflict: &Conflict) -> Value {
    let outcome = match &conflict.outcome {
        Some(ConflictOutcome::Kept { winner }) => json!({ "kept": winner.as_str() }),
        Some(ConflictOutcome::Deleted { winner }) => json!({ "deleted": winner.as_str() }),
        Some(ConflictOutcome::Undeleted { winner }) => json!({ "undeleted": winner.as_str() }),
        Some(ConflictOutcome::ManualReview) => json!("manual-review"),
        None => Value::Null,
    };
    json!({
        "key": conflict.key.as_str(),
        "backends": conflict.proposals.iter().map(|p| json!({
            "backend": p.backend.as_str(),
            "delete": p.is_delete(),
            "at": p.at.to_rfc3339(),
        })).collect::<Vec<_>>(),
        "outcome": outcome,
    })
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} planned, {} applied, {} converged, {} skipped ({} ms)",
            self.planned,
            self.applied.len(),
            self.converged.len(),
            self.skipped.len(),
            self.duration.as_millis()
        )?;
        for op in &self.applied {
            writeln!(f, "  applied   {op}")?;
        }
        for skipped in &self.skipped {
            writeln!(f, "  skipped   {} ({})", skipped.operation, skipped.reason)?;
        }
        for conflict in &self.resolved_conflicts {
            let winner = conflict.winner().map(BackendId::as_str).unwrap_or("-");
            writeln!(f, "  conflict  {} won by {winner}", conflict.key)?;
        }
        for conflict in &self.manual_review {
            writeln!(f, "  review    {} needs a manual decision", conflict.key)?;
        }
        for (backend, reason) in &self.failed_backends {
            writeln!(f, "  failed    {backend}: {reason}")?;
        }
        if let Some(error) = &self.mappings_error {
            writeln!(f, "  mappings  not saved: {error}")?;
        }
        if self.cancelled {
            writeln!(f, "  cycle cancelled")?;
        }
        Ok(())
    }
}
