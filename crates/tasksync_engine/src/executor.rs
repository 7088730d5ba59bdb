//! Runs a plan against the backends.
//!
//! Backends are independent, so each one gets its own worker thread.
//! Operations on one backend run strictly in plan order because later
//! ones may depend on earlier ones.

use crate::adapter::{AdapterError, AdapterResult, BackendAdapter};
use crate::config::RetryConfig;
use crate::planner::Plan;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tasksync_protocol::{BackendId, Operation, OperationKind};
use tracing::{debug, warn};

/// Final status of one planned operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    /// The backend applied the operation. Creates carry the new id.
    Applied {
        /// Backend-assigned id (creates only).
        remote_id: Option<String>,
    },
    /// The target was already gone; the backend is in the intended state
    /// for deletes, and drops out of the key for updates.
    Converged,
    /// The operation failed permanently or ran out of retries.
    Failed(AdapterError),
    /// The operation was never attempted.
    Skipped(SkipReason),
}

/// Why an operation was not attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The cycle was cancelled.
    Cancelled,
    /// An earlier operation on the same backend failed.
    BackendAborted,
}

impl SkipReason {
    /// Returns a short description.
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Cancelled => "cancelled",
            SkipReason::BackendAborted => "earlier operation on this backend failed",
        }
    }
}

impl OperationStatus {
    /// Returns true if the backend ended up in the intended state.
    pub fn is_settled(&self) -> bool {
        matches!(self, OperationStatus::Applied { .. } | OperationStatus::Converged)
    }
}

/// Result of one planned operation.
#[derive(Debug, Clone)]
pub struct OperationOutcome {
    /// The operation.
    pub operation: Operation,
    /// What happened.
    pub status: OperationStatus,
    /// Number of adapter calls made.
    pub attempts: u32,
}

/// Results of one backend's operations, in plan order.
#[derive(Debug, Clone, Default)]
pub struct BackendOutcome {
    /// Per-operation results.
    pub outcomes: Vec<OperationOutcome>,
}

impl BackendOutcome {
    /// Returns true if every operation settled.
    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(|o| o.status.is_settled())
    }

    /// Returns true if any operation was skipped because of cancellation.
    pub fn was_cancelled(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| o.status == OperationStatus::Skipped(SkipReason::Cancelled))
    }

    /// The first failure, if any.
    pub fn failure(&self) -> Option<(&Operation, &AdapterError)> {
        self.outcomes.iter().find_map(|o| match &o.status {
            OperationStatus::Failed(error) => Some((&o.operation, error)),
            _ => None,
        })
    }

    /// Number of retries performed.
    pub fn retries(&self) -> u64 {
        self.outcomes
            .iter()
            .map(|o| u64::from(o.attempts.saturating_sub(1)))
            .sum()
    }
}

/// Executes plans with retry and cancellation.
#[derive(Debug, Clone, Copy)]
pub struct Executor<'a> {
    retry: &'a RetryConfig,
    cancelled: &'a AtomicBool,
}

impl<'a> Executor<'a> {
    /// Creates an executor.
    pub fn new(retry: &'a RetryConfig, cancelled: &'a AtomicBool) -> Self {
        Self { retry, cancelled }
    }

    /// Runs every backend's operations, backends in parallel.
    ///
    /// Backends without an adapter are reported as failed.
    pub fn run(
        &self,
        plan: &Plan,
        adapters: &BTreeMap<BackendId, Arc<dyn BackendAdapter>>,
    ) -> BTreeMap<BackendId, BackendOutcome> {
        thread::scope(|scope| {
            let workers: Vec<_> = plan
                .iter()
                .map(|(backend, ops)| {
                    let adapter = adapters.get(backend).cloned();
                    let worker = scope.spawn(move || match adapter {
                        Some(adapter) => self.run_backend(backend, adapter.as_ref(), ops),
                        None => unavailable(ops),
                    });
                    (backend.clone(), worker)
                })
                .collect();

            workers
                .into_iter()
                .map(|(backend, worker)| {
                    let outcome = worker
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
                    (backend, outcome)
                })
                .collect()
        })
    }

    fn run_backend(
        &self,
        backend: &BackendId,
        adapter: &dyn BackendAdapter,
        ops: &[Operation],
    ) -> BackendOutcome {
        let mut outcomes = Vec::with_capacity(ops.len());
        let mut aborted = false;

        for op in ops {
            let (status, attempts) = if self.cancelled.load(Ordering::SeqCst) {
                (OperationStatus::Skipped(SkipReason::Cancelled), 0)
            } else if aborted {
                (OperationStatus::Skipped(SkipReason::BackendAborted), 0)
            } else {
                let (status, attempts) = self.apply(adapter, op);
                match &status {
                    OperationStatus::Failed(error) => {
                        warn!(backend = %backend, op = %op, error = %error, "operation failed, skipping rest of backend");
                        aborted = true;
                    }
                    _ => debug!(backend = %backend, op = %op, attempts, "operation settled"),
                }
                (status, attempts)
            };
            outcomes.push(OperationOutcome {
                operation: op.clone(),
                status,
                attempts,
            });
        }

        BackendOutcome { outcomes }
    }

    fn apply(&self, adapter: &dyn BackendAdapter, op: &Operation) -> (OperationStatus, u32) {
        let remote_id = op.remote_id.as_deref().unwrap_or_default();
        let (result, attempts) = with_retry(self.retry, Some(self.cancelled), || match op.kind {
            OperationKind::Create => adapter.create_task(&op.payload, &op.token).map(Some),
            OperationKind::Update => adapter
                .update_task(remote_id, &op.payload, &op.token)
                .map(|()| None),
            OperationKind::Delete => adapter.delete_task(remote_id, &op.token).map(|()| None),
        });

        let status = match (result, op.kind) {
            (Ok(remote_id), _) => OperationStatus::Applied { remote_id },
            (Err(AdapterError::NotFound(_)), OperationKind::Update | OperationKind::Delete) => {
                OperationStatus::Converged
            }
            (Err(error), _) => OperationStatus::Failed(error),
        };
        (status, attempts)
    }
}

fn unavailable(ops: &[Operation]) -> BackendOutcome {
    BackendOutcome {
        outcomes: ops
            .iter()
            .map(|op| OperationOutcome {
                operation: op.clone(),
                status: OperationStatus::Failed(AdapterError::permanent("backend not registered")),
                attempts: 0,
            })
            .collect(),
    }
}

/// Calls `call` until it succeeds, fails with a non-transient error, or
/// runs out of attempts. Returns the last result and the number of calls.
///
/// Stops early, returning the last transient error, once `cancelled` is set.
pub(crate) fn with_retry<T>(
    retry: &RetryConfig,
    cancelled: Option<&AtomicBool>,
    mut call: impl FnMut() -> AdapterResult<T>,
) -> (AdapterResult<T>, u32) {
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let delay = retry.delay_for_attempt(attempt);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        attempt += 1;

        match call() {
            Err(error) if error.is_retryable() && attempt < max_attempts => {
                if cancelled.map_or(false, |flag| flag.load(Ordering::SeqCst)) {
                    return (Err(error), attempt);
                }
                warn!(attempt, error = %error, "transient failure, retrying");
            }
            result => return (result, attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FailOn, MemoryBackend};
    use chrono::{TimeZone, Utc};
    use tasksync_protocol::{LogicalKey, Task};

    fn backend(id: &str) -> BackendId {
        BackendId::new(id).unwrap()
    }

    fn new_task(key: &str) -> Task {
        Task::new("", key, Utc.timestamp_opt(10, 0).unwrap())
    }

    fn create(on: &str, key: &str) -> Operation {
        Operation::create(backend(on), LogicalKey::from(key), new_task(key), None)
    }

    fn plan_for(on: &str, ops: Vec<Operation>) -> Plan {
        let mut plan = Plan::default();
        plan.insert(backend(on), ops);
        plan
    }

    fn adapters(
        entries: &[(&str, Arc<MemoryBackend>)],
    ) -> BTreeMap<BackendId, Arc<dyn BackendAdapter>> {
        entries
            .iter()
            .map(|(name, adapter)| (backend(name), adapter.clone() as Arc<dyn BackendAdapter>))
            .collect()
    }

    #[test]
    fn transient_errors_are_retried() {
        let b = Arc::new(MemoryBackend::new("b"));
        b.fail_next(FailOn::Create, AdapterError::transient("timeout"), 2);
        let cancelled = AtomicBool::new(false);
        let retry = RetryConfig::immediate(3);

        let outcomes = Executor::new(&retry, &cancelled)
            .run(&plan_for("b", vec![create("b", "T1")]), &adapters(&[("b", b.clone())]));

        let outcome = &outcomes[&backend("b")];
        assert!(outcome.is_complete());
        assert_eq!(outcome.outcomes[0].attempts, 3);
        assert_eq!(outcome.retries(), 2);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn permanent_error_skips_rest_of_backend() {
        let b = Arc::new(MemoryBackend::new("b"));
        b.fail_next(FailOn::Create, AdapterError::permanent("forbidden"), 1);
        let cancelled = AtomicBool::new(false);
        let retry = RetryConfig::immediate(3);

        let outcomes = Executor::new(&retry, &cancelled).run(
            &plan_for("b", vec![create("b", "T1"), create("b", "T2")]),
            &adapters(&[("b", b.clone())]),
        );

        let outcome = &outcomes[&backend("b")];
        assert!(!outcome.is_complete());
        assert_eq!(outcome.outcomes[0].attempts, 1);
        assert_eq!(
            outcome.outcomes[1].status,
            OperationStatus::Skipped(SkipReason::BackendAborted)
        );
        assert!(b.is_empty());
    }

    #[test]
    fn missing_target_converges() {
        let b = Arc::new(MemoryBackend::new("b"));
        let gone = Task::new("b-9", "gone", Utc.timestamp_opt(10, 0).unwrap());
        let cancelled = AtomicBool::new(false);
        let retry = RetryConfig::no_retry();

        let outcomes = Executor::new(&retry, &cancelled).run(
            &plan_for("b", vec![Operation::delete(backend("b"), "T9".into(), gone)]),
            &adapters(&[("b", b)]),
        );

        assert_eq!(
            outcomes[&backend("b")].outcomes[0].status,
            OperationStatus::Converged
        );
    }

    #[test]
    fn cancelled_flag_stops_before_each_operation() {
        let b = Arc::new(MemoryBackend::new("b"));
        let cancelled = AtomicBool::new(true);
        let retry = RetryConfig::no_retry();

        let outcomes = Executor::new(&retry, &cancelled)
            .run(&plan_for("b", vec![create("b", "T1")]), &adapters(&[("b", b.clone())]));

        assert!(outcomes[&backend("b")].was_cancelled());
        assert_eq!(b.calls().create, 0);
    }

    #[test]
    fn unregistered_backend_fails() {
        let cancelled = AtomicBool::new(false);
        let retry = RetryConfig::no_retry();
        let outcomes = Executor::new(&retry, &cancelled)
            .run(&plan_for("x", vec![create("x", "T1")]), &BTreeMap::new());

        assert!(outcomes[&backend("x")].failure().is_some());
    }

    #[test]
    fn retry_gives_up_after_max_attempts() {
        let mut calls = 0;
        let (result, attempts) = with_retry(&RetryConfig::immediate(4), None, || -> AdapterResult<()> {
            calls += 1;
            Err(AdapterError::transient("down"))
        });
        assert!(result.is_err());
        assert_eq!(attempts, 4);
        assert_eq!(calls, 4);

        let (result, attempts) = with_retry(&RetryConfig::immediate(4), None, || -> AdapterResult<()> {
            Err(AdapterError::permanent("denied"))
        });
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }
}
