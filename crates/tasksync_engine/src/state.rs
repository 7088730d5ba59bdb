//! Sync engine state machine.

use crate::adapter::{AdapterResult, BackendAdapter};
use crate::config::{RetryConfig, SyncConfig};
use crate::diff::BackendView;
use crate::error::{SyncError, SyncResult};
use crate::executor::{with_retry, BackendOutcome, Executor, OperationStatus};
use crate::merge::{Decision, Resolution, Resolver};
use crate::planner::Plan;
use crate::report::{CycleReport, SkippedOperation};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tasksync_protocol::{BackendId, Conflict, LogicalKey, OperationKind, Task, Tombstone};
use tasksync_store::{IdMap, Snapshot, SnapshotStore};
use tracing::{debug, error, info, warn};

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Engine is idle, no cycle has run yet.
    Idle,
    /// Engine is fetching from the backends.
    Fetching,
    /// Engine is diffing, merging and planning.
    Planning,
    /// Engine is running operations against the backends.
    Executing,
    /// Engine is committing snapshots and the mapping table.
    Committing,
    /// The last cycle committed every backend.
    Synced,
    /// The last cycle failed or left some backends behind.
    Error,
}

impl SyncState {
    /// Returns true if a cycle is in progress.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Fetching | SyncState::Planning | SyncState::Executing | SyncState::Committing
        )
    }

    /// Returns true if the engine can start a new cycle.
    pub fn can_start_sync(&self) -> bool {
        matches!(self, SyncState::Idle | SyncState::Synced | SyncState::Error)
    }
}

/// Statistics about sync cycles.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Total number of cycles that reached the commit phase.
    pub cycles_completed: u64,
    /// Total number of operations applied or converged.
    pub operations_applied: u64,
    /// Total number of operations that failed or were skipped.
    pub operations_failed: u64,
    /// Total number of conflicts settled by the policy.
    pub conflicts_resolved: u64,
    /// Total number of conflicts left for manual review.
    pub manual_reviews: u64,
    /// Total number of retried adapter calls.
    pub retries: u64,
    /// Last sync time.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// What a cycle would do, computed without touching any backend.
#[derive(Debug, Clone, Default)]
pub struct CyclePreview {
    /// Operations that would run.
    pub plan: Plan,
    /// Conflicts that would be settled or reported.
    pub conflicts: Vec<Conflict>,
}

struct Fetched {
    tasks: Vec<Task>,
    tombstones: Vec<Tombstone>,
    attempts: u32,
}

/// Reconciles a set of backends through a snapshot store.
///
/// One cycle:
/// 1. Fetch every backend (in parallel, with retry)
/// 2. Diff each fetch against that backend's snapshot
/// 3. Merge the deltas per logical key and settle conflicts
/// 4. Plan and execute the operations (in parallel across backends)
/// 5. Commit the snapshot of every backend whose operations all settled,
///    then the mapping table
///
/// Any failure before step 4 aborts the cycle with no backend or snapshot
/// modified.
pub struct SyncEngine<S: SnapshotStore> {
    config: SyncConfig,
    store: S,
    adapters: BTreeMap<BackendId, Arc<dyn BackendAdapter>>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    cancelled: AtomicBool,
}

impl<S: SnapshotStore> SyncEngine<S> {
    /// Creates an engine with no backends.
    pub fn new(config: SyncConfig, store: S) -> Self {
        Self {
            config,
            store,
            adapters: BTreeMap::new(),
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Registers a backend.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `id` is already registered.
    pub fn register(&mut self, id: BackendId, adapter: Arc<dyn BackendAdapter>) -> SyncResult<()> {
        if self.adapters.contains_key(&id) {
            return Err(SyncError::Config(format!("backend {id} registered twice")));
        }
        debug!(backend = %id, "backend registered");
        self.adapters.insert(id, adapter);
        Ok(())
    }

    /// Registers a backend, builder style.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `id` is already registered.
    pub fn with_backend(mut self, id: BackendId, adapter: Arc<dyn BackendAdapter>) -> SyncResult<Self> {
        self.register(id, adapter)?;
        Ok(self)
    }

    /// Returns the registered backends in id order.
    pub fn backends(&self) -> impl Iterator<Item = &BackendId> {
        self.adapters.keys()
    }

    /// Gets the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Gets the snapshot store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Asks the running (or next) cycle to stop.
    ///
    /// Before execution starts, the cycle returns `Cancelled` without
    /// touching anything. During execution, operations not yet started are
    /// skipped and only fully settled backends are committed.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Resets the cancelled flag.
    pub fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Returns true if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    /// Runs one full sync cycle.
    ///
    /// Returns a report even when some backends failed; those keep their
    /// previous snapshot and are retried next cycle.
    ///
    /// # Errors
    ///
    /// - `InvalidStateTransition` if a cycle is already running
    /// - `Config` if no backend is registered or the configuration is invalid
    /// - `Fetch`, `Protocol`, `ConflictResolution`, `Cancelled` abort the
    ///   cycle before any operation executes
    /// - `Store` if the store cannot be read; write failures after execution
    ///   are reported in the [`CycleReport`] instead
    pub fn sync(&self) -> SyncResult<CycleReport> {
        let start = Instant::now();
        self.begin()?;
        info!(backends = self.adapters.len(), policy = %self.config.conflict_policy, "sync cycle started");

        let result = self.run_cycle(start);
        match &result {
            Ok(report) => self.finish(report),
            Err(e) => self.handle_error(e),
        }
        self.reset_cancel();
        result
    }

    /// Computes what the next cycle would do without executing or committing.
    ///
    /// # Errors
    ///
    /// Same as the abort conditions of [`sync`](Self::sync).
    pub fn preview(&self) -> SyncResult<CyclePreview> {
        if self.state().is_active() {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{:?}", self.state()),
                to: "preview".into(),
            });
        }
        self.config.validate()?;
        let mappings = self.store.mappings()?;
        let (fetched, _) = self.fetch_all()?;
        let views = self.build_views(fetched, &mappings)?;
        let decisions = self.resolver().resolve(&views, &mappings)?;
        let plan = Plan::build(&decisions, &views);
        Ok(CyclePreview {
            plan,
            conflicts: decisions.into_iter().filter_map(|d| d.conflict).collect(),
        })
    }

    fn begin(&self) -> SyncResult<()> {
        let mut state = self.state.write();
        if !state.can_start_sync() {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{:?}", *state),
                to: "sync".into(),
            });
        }
        if self.adapters.is_empty() {
            return Err(SyncError::Config("no backends registered".into()));
        }
        self.config.validate()?;
        *state = SyncState::Fetching;
        Ok(())
    }

    fn resolver(&self) -> Resolver<'_> {
        Resolver::new(self.config.conflict_policy, &self.config.backend_priority)
    }

    fn run_cycle(&self, start: Instant) -> SyncResult<CycleReport> {
        let mappings = self.store.mappings()?;
        let (fetched, fetch_retries) = self.fetch_all()?;
        self.check_cancelled()?;

        self.set_state(SyncState::Planning);
        let views = self.build_views(fetched, &mappings)?;
        let decisions = self.resolver().resolve(&views, &mappings)?;
        let plan = Plan::build(&decisions, &views);
        for (backend, ops) in plan.iter() {
            debug!(backend = %backend, operations = ops.len(), "planned");
        }
        self.check_cancelled()?;
        info!(
            changes = views.iter().map(BackendView::change_count).sum::<usize>(),
            operations = plan.len(),
            conflicts = decisions.iter().filter(|d| d.conflict.is_some()).count(),
            "plan ready"
        );

        self.set_state(SyncState::Executing);
        let outcomes = Executor::new(&self.config.retry, &self.cancelled).run(&plan, &self.adapters);

        self.set_state(SyncState::Committing);
        let mut report = CycleReport {
            planned: plan.len(),
            retries: fetch_retries,
            ..CycleReport::default()
        };
        for decision in &decisions {
            match (&decision.resolution, &decision.conflict) {
                (Resolution::ManualReview, Some(conflict)) => {
                    report.manual_review.push(conflict.clone())
                }
                (_, Some(conflict)) => report.resolved_conflicts.push(conflict.clone()),
                _ => {}
            }
        }
        self.commit(&views, &decisions, &outcomes, mappings, &mut report);
        report.duration = start.elapsed();
        Ok(report)
    }

    /// Fetches every backend concurrently. Returns the fetches and the
    /// number of retried calls.
    fn fetch_all(&self) -> SyncResult<(BTreeMap<BackendId, Fetched>, u64)> {
        let retry = &self.config.retry;
        let results: Vec<(BackendId, AdapterResult<Fetched>)> = thread::scope(|scope| {
            let workers: Vec<_> = self
                .adapters
                .iter()
                .map(|(id, adapter)| {
                    let worker = scope.spawn(move || fetch_one(adapter.as_ref(), retry));
                    (id.clone(), worker)
                })
                .collect();
            workers
                .into_iter()
                .map(|(id, worker)| {
                    let result = worker
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
                    (id, result)
                })
                .collect()
        });

        let mut fetched = BTreeMap::new();
        let mut retries = 0;
        for (backend, result) in results {
            match result {
                Ok(fetch) => {
                    debug!(backend = %backend, tasks = fetch.tasks.len(), attempts = fetch.attempts, "fetched");
                    retries += u64::from(fetch.attempts.saturating_sub(1));
                    fetched.insert(backend, fetch);
                }
                Err(source) => {
                    warn!(backend = %backend, error = %source, "fetch failed, aborting cycle");
                    return Err(SyncError::Fetch { backend, source });
                }
            }
        }
        Ok((fetched, retries))
    }

    fn build_views(
        &self,
        fetched: BTreeMap<BackendId, Fetched>,
        mappings: &IdMap,
    ) -> SyncResult<Vec<BackendView>> {
        fetched
            .into_iter()
            .map(|(backend, fetch)| {
                let snapshot = self.store.get(&backend)?;
                let view =
                    BackendView::build(backend, fetch.tasks, &fetch.tombstones, snapshot, mappings)?;
                debug!(backend = %view.backend, changes = view.change_count(), "diffed");
                Ok(view)
            })
            .collect()
    }

    /// Commits every fully settled backend, then the mapping table.
    ///
    /// Commit failures land in the report; the backends have already changed
    /// by this point.
    fn commit(
        &self,
        views: &[BackendView],
        decisions: &[Decision],
        outcomes: &BTreeMap<BackendId, BackendOutcome>,
        mut mappings: IdMap,
        report: &mut CycleReport,
    ) {
        let now = Utc::now();
        let manual: BTreeSet<&LogicalKey> = decisions
            .iter()
            .filter(|d| d.resolution == Resolution::ManualReview)
            .map(|d| &d.key)
            .collect();
        let empty = BackendOutcome::default();
        let mut holders: BTreeMap<&BackendId, BTreeSet<LogicalKey>> = BTreeMap::new();

        for view in views {
            let outcome = outcomes.get(&view.backend).unwrap_or(&empty);
            collect_outcomes(outcome, report);

            let observed = observed_state(view, outcome);
            for key in mappings.reverse_index(&view.backend).into_values() {
                if !observed.contains_key(&key) {
                    mappings.forget(&key, &view.backend);
                }
            }
            for (key, task) in &observed {
                mappings.record(key.clone(), view.backend.clone(), task.id.clone());
            }

            if outcome.is_complete() {
                let snapshot = Snapshot::new(revert_manual(observed.clone(), view, &manual), now);
                let settled = settled_tombstones(view, &snapshot);
                match self.store.commit(&view.backend, snapshot) {
                    Ok(()) => {
                        report.committed.push(view.backend.clone());
                        self.forget_tombstones(&view.backend, &settled);
                    }
                    Err(e) => {
                        warn!(backend = %view.backend, error = %e, "snapshot commit failed");
                        report
                            .failed_backends
                            .insert(view.backend.clone(), format!("snapshot commit failed: {e}"));
                    }
                }
            } else if let Some((op, error)) = outcome.failure() {
                report
                    .failed_backends
                    .insert(view.backend.clone(), format!("{op}: {error}"));
            }

            holders.insert(&view.backend, observed.into_keys().collect());
        }

        report.cancelled = outcomes.values().any(BackendOutcome::was_cancelled);

        for decision in decisions {
            match &decision.resolution {
                Resolution::Delete { at } => mappings.tombstone(decision.key.clone(), *at),
                Resolution::Upsert(_) => mappings.clear_tombstone(&decision.key),
                Resolution::ManualReview => {}
            }
        }
        // A deletion is finished once no backend holds the key.
        mappings.retain(|key, entry| {
            if entry.deleted_at.is_some() && !holders.values().any(|keys| keys.contains(key)) {
                entry.deleted_at = None;
            }
            !entry.is_empty()
        });

        if let Err(e) = self.store.commit_mappings(mappings) {
            warn!(error = %e, "mapping table commit failed");
            report.mappings_error = Some(e.to_string());
        }
    }

    fn forget_tombstones(&self, backend: &BackendId, ids: &[String]) {
        let Some(adapter) = self.adapters.get(backend).filter(|_| !ids.is_empty()) else {
            return;
        };
        match adapter.forget_tombstones(ids) {
            Ok(()) => debug!(backend = %backend, tombstones = ids.len(), "tombstones pruned"),
            Err(e) => warn!(backend = %backend, error = %e, "tombstone pruning failed"),
        }
    }

    fn finish(&self, report: &CycleReport) {
        let complete = report.is_complete();
        self.set_state(if complete {
            SyncState::Synced
        } else {
            SyncState::Error
        });

        let mut stats = self.stats.write();
        stats.cycles_completed += 1;
        stats.operations_applied += (report.applied.len() + report.converged.len()) as u64;
        stats.operations_failed += report.skipped.len() as u64;
        stats.conflicts_resolved += report.resolved_conflicts.len() as u64;
        stats.manual_reviews += report.manual_review.len() as u64;
        stats.retries += report.retries;
        stats.last_sync_time = Some(Instant::now());
        stats.last_error = if complete {
            None
        } else {
            let mut reasons: Vec<String> = report
                .failed_backends
                .iter()
                .map(|(backend, reason)| format!("{backend}: {reason}"))
                .collect();
            if let Some(error) = &report.mappings_error {
                reasons.push(format!("mapping table: {error}"));
            }
            if reasons.is_empty() {
                reasons.push("cycle cancelled".into());
            }
            Some(reasons.join("; "))
        };
        drop(stats);

        info!(
            applied = report.applied.len(),
            converged = report.converged.len(),
            skipped = report.skipped.len(),
            committed = report.committed.len(),
            manual_review = report.manual_review.len(),
            duration_ms = report.duration.as_millis() as u64,
            "sync cycle finished"
        );
    }

    fn handle_error(&self, error: &SyncError) {
        error!(error = %error, "sync cycle aborted");
        self.set_state(SyncState::Error);
        self.stats.write().last_error = Some(error.to_string());
    }
}

fn fetch_one(adapter: &dyn BackendAdapter, retry: &RetryConfig) -> AdapterResult<Fetched> {
    let (tasks, task_attempts) = with_retry(retry, None, || adapter.fetch_tasks());
    let tasks = tasks?;
    let (tombstones, tombstone_attempts) = with_retry(retry, None, || adapter.fetch_tombstones());
    Ok(Fetched {
        tasks,
        tombstones: tombstones?,
        attempts: task_attempts + tombstone_attempts.saturating_sub(1),
    })
}

fn collect_outcomes(outcome: &BackendOutcome, report: &mut CycleReport) {
    report.retries += outcome.retries();
    for result in &outcome.outcomes {
        match &result.status {
            OperationStatus::Applied { .. } => report.applied.push(result.operation.clone()),
            OperationStatus::Converged => report.converged.push(result.operation.clone()),
            OperationStatus::Failed(error) => report.skipped.push(SkippedOperation {
                operation: result.operation.clone(),
                reason: error.to_string(),
            }),
            OperationStatus::Skipped(reason) => report.skipped.push(SkippedOperation {
                operation: result.operation.clone(),
                reason: reason.as_str().into(),
            }),
        }
    }
}

/// The backend's tasks after this cycle's settled operations.
fn observed_state(view: &BackendView, outcome: &BackendOutcome) -> BTreeMap<LogicalKey, Task> {
    let mut tasks = view.current.clone();
    for result in &outcome.outcomes {
        let op = &result.operation;
        match (&result.status, op.kind) {
            (OperationStatus::Applied { remote_id: Some(id) }, OperationKind::Create) => {
                tasks.insert(op.key.clone(), op.payload.clone().with_id(id.clone()));
            }
            (OperationStatus::Applied { .. }, OperationKind::Update) => {
                tasks.insert(op.key.clone(), op.payload.clone());
            }
            (OperationStatus::Applied { .. }, OperationKind::Delete) | (OperationStatus::Converged, _) => {
                tasks.remove(&op.key);
            }
            _ => {}
        }
    }
    tasks
}

/// Ids of the backend's tombstones whose task the committed snapshot no
/// longer holds.
fn settled_tombstones(view: &BackendView, committed: &Snapshot) -> Vec<String> {
    let held: HashSet<&str> = committed.tasks.values().map(|t| t.id.as_str()).collect();
    view.tombstones
        .iter()
        .filter(|t| !held.contains(t.id.as_str()))
        .map(|t| t.id.clone())
        .collect()
}

/// Puts keys under manual review back to their previous snapshot value so
/// the conflict is detected again next cycle.
fn revert_manual(
    mut tasks: BTreeMap<LogicalKey, Task>,
    view: &BackendView,
    manual: &BTreeSet<&LogicalKey>,
) -> BTreeMap<LogicalKey, Task> {
    for key in manual {
        match view.snapshot.get(key) {
            Some(previous) => {
                tasks.insert((*key).clone(), previous.clone());
            }
            None => {
                tasks.remove(*key);
            }
        }
    }
    tasks
}
