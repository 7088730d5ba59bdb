//! Cross-backend merge and conflict resolution.
//!
//! For every logical key, the deltas of all backends are combined into a
//! single target state. Keys whose backends disagree become [`Conflict`]s
//! settled by the configured [`ConflictPolicy`].
//!
//! ## Last-writer-wins ordering
//!
//! 1. Later timestamp wins (`updated_at` for edits, `deleted_at` for deletions)
//! 2. At equal timestamps an edit beats a deletion
//! 3. Then the backend listed first in `backendPriority` wins
//!
//! A tie between two backends that are both missing from the priority list
//! cannot be ordered and aborts the cycle.

use crate::diff::BackendView;
use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use tasksync_protocol::{
    BackendId, Conflict, ConflictOutcome, ConflictPolicy, DeltaKind, LogicalKey, Proposal, Task,
};
use tasksync_store::IdMap;
use tracing::warn;

/// The state every backend should converge to for one key.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The task exists with this value.
    Upsert(Task),
    /// The task is gone; the deletion happened at `at`.
    Delete {
        /// Time of the winning deletion.
        at: DateTime<Utc>,
    },
    /// Nothing is touched until a human intervenes.
    ManualReview,
}

/// Merge result for one logical key.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Logical key.
    pub key: LogicalKey,
    /// Target state.
    pub resolution: Resolution,
    /// The conflict behind the resolution, if backends disagreed.
    pub conflict: Option<Conflict>,
}

impl Decision {
    fn agreed(key: LogicalKey, resolution: Resolution) -> Self {
        Self {
            key,
            resolution,
            conflict: None,
        }
    }
}

/// Merges per-backend views into decisions.
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'a> {
    policy: ConflictPolicy,
    priority: &'a [BackendId],
}

impl<'a> Resolver<'a> {
    /// Creates a resolver.
    pub fn new(policy: ConflictPolicy, priority: &'a [BackendId]) -> Self {
        Self { policy, priority }
    }

    /// Produces a decision for every key that needs attention, in key order.
    ///
    /// Keys on which every backend already agrees produce no decision.
    ///
    /// # Errors
    ///
    /// Returns `ConflictResolution` if last-writer-wins cannot order a
    /// conflict. Nothing has been decided for any key in that case.
    pub fn resolve(&self, views: &[BackendView], mappings: &IdMap) -> SyncResult<Vec<Decision>> {
        let keys: BTreeSet<&LogicalKey> = views
            .iter()
            .flat_map(|view| view.deltas.keys())
            .collect();

        let mut decisions = Vec::new();
        for key in keys {
            if let Some(decision) = self.resolve_key(key, views, mappings)? {
                decisions.push(decision);
            }
        }
        Ok(decisions)
    }

    fn resolve_key(
        &self,
        key: &LogicalKey,
        views: &[BackendView],
        mappings: &IdMap,
    ) -> SyncResult<Option<Decision>> {
        let mut candidates: Vec<Proposal> = views
            .iter()
            .filter_map(|view| {
                let delta = view.delta(key).filter(|d| d.is_change())?;
                match (delta.kind, &delta.new, delta.deleted_at) {
                    (DeltaKind::Deleted, _, Some(at)) => {
                        Some(Proposal::delete(view.backend.clone(), at))
                    }
                    (_, Some(task), _) => Some(Proposal::upsert(view.backend.clone(), task.clone())),
                    _ => None,
                }
            })
            .collect();

        let present: Vec<(&BackendId, &Task)> = views
            .iter()
            .filter_map(|view| view.current(key).map(|task| (&view.backend, task)))
            .collect();

        if candidates.is_empty() {
            match quiet_key(key, views.len(), &present, mappings) {
                Quiet::Settled(decision) => return Ok(Some(decision)),
                Quiet::InSync => return Ok(None),
                Quiet::Diverged => {
                    candidates = present
                        .iter()
                        .map(|(backend, task)| {
                            Proposal::upsert((*backend).clone(), (*task).clone()).carried_over()
                        })
                        .collect();
                }
            }
        } else {
            self.carry_over_newer_edits(key, views, &mut candidates);
        }

        let first = &candidates[0];
        if candidates.iter().all(|p| p.agrees_with(first)) {
            let resolution = match latest(&candidates).task() {
                Some(task) => Resolution::Upsert(task.clone()),
                None => Resolution::Delete {
                    at: candidates.iter().map(|p| p.at).max().unwrap_or(first.at),
                },
            };
            return Ok(Some(Decision::agreed(key.clone(), resolution)));
        }

        let mut conflict = Conflict::new(key.clone(), candidates);
        if !self.policy.auto_resolves() {
            warn!(key = %key, backends = conflict.proposals.len(), "conflict left for manual review");
            conflict.resolve(ConflictOutcome::ManualReview);
            return Ok(Some(Decision {
                key: key.clone(),
                resolution: Resolution::ManualReview,
                conflict: Some(conflict),
            }));
        }

        let winner = self.pick_winner(key, &conflict.proposals)?.clone();
        let (outcome, resolution) = match winner.task() {
            None => (
                ConflictOutcome::Deleted {
                    winner: winner.backend.clone(),
                },
                Resolution::Delete { at: winner.at },
            ),
            Some(task) if conflict.is_update_delete_conflict() => {
                warn!(key = %key, winner = %winner.backend, "newer edit restores a deleted task");
                (
                    ConflictOutcome::Undeleted {
                        winner: winner.backend.clone(),
                    },
                    Resolution::Upsert(task.clone()),
                )
            }
            Some(task) => (
                ConflictOutcome::Kept {
                    winner: winner.backend.clone(),
                },
                Resolution::Upsert(task.clone()),
            ),
        };
        warn!(key = %key, winner = %winner.backend, proposals = conflict.proposals.len(), "conflict resolved by last-writer-wins");
        conflict.resolve(outcome);

        Ok(Some(Decision {
            key: key.clone(),
            resolution,
            conflict: Some(conflict),
        }))
    }

    /// Adds unchanged values that are newer than every change as candidates,
    /// when some backend's snapshot does not hold that value.
    ///
    /// Such a value is an edit that won an earlier cycle but did not reach
    /// every backend before that cycle ended. A value every snapshot holds is
    /// the common base of the new changes and is never carried over.
    fn carry_over_newer_edits(
        &self,
        key: &LogicalKey,
        views: &[BackendView],
        candidates: &mut Vec<Proposal>,
    ) {
        let newest = candidates.iter().map(|p| p.at).max();
        for view in views {
            let unchanged = view.delta(key).map_or(false, |d| !d.is_change());
            let Some(task) = view.current(key).filter(|_| unchanged) else {
                continue;
            };
            let newer = newest.map_or(true, |at| task.updated_at > at);
            let known = candidates
                .iter()
                .any(|p| p.task().map_or(false, |t| t.same_content(task)));
            let unfinished = views.iter().any(|other| {
                other
                    .snapshot
                    .get(key)
                    .map_or(true, |recorded| !recorded.same_content(task))
            });
            if newer && !known && unfinished {
                candidates.push(Proposal::upsert(view.backend.clone(), task.clone()).carried_over());
            }
        }
    }

    fn rank(&self, backend: &BackendId) -> Option<usize> {
        self.priority.iter().position(|b| b == backend)
    }

    /// Returns true if `a` beats `b` under last-writer-wins.
    fn outranks(&self, key: &LogicalKey, a: &Proposal, b: &Proposal) -> SyncResult<bool> {
        if a.at != b.at {
            return Ok(a.at > b.at);
        }
        if a.is_delete() != b.is_delete() {
            return Ok(!a.is_delete());
        }
        if a.agrees_with(b) {
            return Ok(a.backend < b.backend);
        }
        match (self.rank(&a.backend), self.rank(&b.backend)) {
            (Some(ra), Some(rb)) => Ok(ra < rb),
            (Some(_), None) => Ok(true),
            (None, Some(_)) => Ok(false),
            (None, None) => Err(SyncError::ConflictResolution {
                key: key.clone(),
                reason: format!(
                    "backends {} and {} changed it at the same time ({}) and neither is in backendPriority",
                    a.backend, b.backend, a.at
                ),
            }),
        }
    }

    fn pick_winner<'p>(&self, key: &LogicalKey, proposals: &'p [Proposal]) -> SyncResult<&'p Proposal> {
        let mut best: Option<&Proposal> = None;
        for proposal in proposals {
            best = Some(match best {
                Some(current) if !self.outranks(key, proposal, current)? => current,
                _ => proposal,
            });
        }
        best.ok_or_else(|| SyncError::ConflictResolution {
            key: key.clone(),
            reason: "no competing values".into(),
        })
    }
}

/// What to do with a key that no backend changed this cycle.
enum Quiet {
    /// A pending deletion still has to reach some backends.
    Settled(Decision),
    /// Every backend holds the same value, or none holds it.
    InSync,
    /// The present values must be merged again: a create that never
    /// reached every backend, or divergence left by an earlier cycle.
    Diverged,
}

fn quiet_key(
    key: &LogicalKey,
    backends: usize,
    present: &[(&BackendId, &Task)],
    mappings: &IdMap,
) -> Quiet {
    if let Some(deleted_at) = mappings.tombstone_of(key) {
        if present.iter().all(|(_, task)| task.updated_at <= deleted_at) {
            return Quiet::Settled(Decision::agreed(
                key.clone(),
                Resolution::Delete { at: deleted_at },
            ));
        }
        return Quiet::Diverged;
    }

    if present.is_empty() {
        return Quiet::InSync;
    }
    let consistent = present
        .windows(2)
        .all(|pair| pair[0].1.same_content(pair[1].1));
    if present.len() == backends && consistent {
        Quiet::InSync
    } else {
        Quiet::Diverged
    }
}

/// Most recent of a set of agreeing proposals, for its metadata.
fn latest(proposals: &[Proposal]) -> &Proposal {
    let mut best = &proposals[0];
    for proposal in &proposals[1..] {
        if proposal.at > best.at {
            best = proposal;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tasksync_store::Snapshot;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn backend(id: &str) -> BackendId {
        BackendId::new(id).unwrap()
    }

    fn task(id: &str, key: &str, title: &str, secs: i64) -> Task {
        Task::new(id, title, at(secs)).with_logical_key(key)
    }

    fn view(name: &str, prior: &[Task], now: &[Task]) -> BackendView {
        let snapshot = if prior.is_empty() {
            Snapshot::empty()
        } else {
            Snapshot::new(
                prior
                    .iter()
                    .map(|t| (t.logical_key.clone(), t.clone()))
                    .collect(),
                at(100),
            )
        };
        BackendView::build(backend(name), now.to_vec(), &[], snapshot, &IdMap::new()).unwrap()
    }

    fn lww() -> Resolver<'static> {
        Resolver::new(ConflictPolicy::LastWriterWins, &[])
    }

    #[test]
    fn newer_update_wins() {
        let base = task("1", "T1", "todo", 10);
        let views = [
            view("a", &[base.clone()], &[task("1", "T1", "todo (a)", 20)]),
            view("b", &[base.clone()], &[task("1", "T1", "todo (b)", 30)]),
        ];

        let decisions = lww().resolve(&views, &IdMap::new()).unwrap();
        assert_eq!(decisions.len(), 1);
        let decision = &decisions[0];
        assert!(matches!(&decision.resolution, Resolution::Upsert(t) if t.title == "todo (b)"));
        let conflict = decision.conflict.as_ref().unwrap();
        assert_eq!(conflict.winner(), Some(&backend("b")));
    }

    #[test]
    fn single_sided_change_is_not_a_conflict() {
        let base = task("1", "T1", "todo", 10);
        let views = [
            view("a", &[base.clone()], &[base.clone().with_completed(true)]),
            view("b", &[base.clone()], &[base.clone()]),
        ];

        let decisions = lww().resolve(&views, &IdMap::new()).unwrap();
        assert_eq!(decisions.len(), 1);
        assert!(decisions[0].conflict.is_none());
        assert!(matches!(&decisions[0].resolution, Resolution::Upsert(t) if t.completed));
    }

    #[test]
    fn in_sync_keys_produce_nothing() {
        let base = task("1", "T1", "todo", 10);
        let views = [
            view("a", &[base.clone()], &[base.clone()]),
            view("b", &[base.clone()], &[base.clone()]),
        ];
        assert!(lww().resolve(&views, &IdMap::new()).unwrap().is_empty());
    }

    #[test]
    fn newer_edit_undeletes() {
        let base = task("3", "T3", "call", 10);
        let mut deleted = view("a", &[base.clone()], &[]);
        deleted.deltas.get_mut(&LogicalKey::from("T3")).unwrap().deleted_at = Some(at(30));
        let views = [
            deleted,
            view("b", &[base.clone()], &[task("3", "T3", "call back", 40)]),
        ];

        let decisions = lww().resolve(&views, &IdMap::new()).unwrap();
        let conflict = decisions[0].conflict.as_ref().unwrap();
        assert!(conflict.is_update_delete_conflict());
        assert_eq!(
            conflict.outcome,
            Some(ConflictOutcome::Undeleted { winner: backend("b") })
        );
        assert!(matches!(decisions[0].resolution, Resolution::Upsert(_)));
    }

    #[test]
    fn newer_delete_wins() {
        let base = task("3", "T3", "call", 10);
        // The deletion is dated to the previous sync (100).
        let views = [
            view("a", &[base.clone()], &[]),
            view("b", &[base.clone()], &[task("3", "T3", "call back", 40)]),
        ];

        let decisions = lww().resolve(&views, &IdMap::new()).unwrap();
        assert_eq!(decisions[0].resolution, Resolution::Delete { at: at(100) });
        assert_eq!(
            decisions[0].conflict.as_ref().unwrap().outcome,
            Some(ConflictOutcome::Deleted { winner: backend("a") })
        );
    }

    #[test]
    fn edit_beats_delete_at_equal_time() {
        let base = task("3", "T3", "call", 10);
        let views = [
            view("a", &[base.clone()], &[]),
            view("b", &[base.clone()], &[task("3", "T3", "call back", 100)]),
        ];

        let decisions = lww().resolve(&views, &IdMap::new()).unwrap();
        assert!(matches!(decisions[0].resolution, Resolution::Upsert(_)));
    }

    #[test]
    fn priority_breaks_timestamp_ties() {
        let views = [
            view("a", &[], &[task("1", "T1", "from a", 50)]),
            view("b", &[], &[task("9", "T1", "from b", 50)]),
        ];

        let priority = [backend("b"), backend("a")];
        let decisions = Resolver::new(ConflictPolicy::LastWriterWins, &priority)
            .resolve(&views, &IdMap::new())
            .unwrap();
        assert!(matches!(&decisions[0].resolution, Resolution::Upsert(t) if t.title == "from b"));

        let partial = [backend("a")];
        let decisions = Resolver::new(ConflictPolicy::LastWriterWins, &partial)
            .resolve(&views, &IdMap::new())
            .unwrap();
        assert!(matches!(&decisions[0].resolution, Resolution::Upsert(t) if t.title == "from a"));
    }

    #[test]
    fn unranked_tie_is_an_error() {
        let views = [
            view("a", &[], &[task("1", "T1", "from a", 50)]),
            view("b", &[], &[task("9", "T1", "from b", 50)]),
        ];

        let err = lww().resolve(&views, &IdMap::new()).unwrap_err();
        assert!(matches!(err, SyncError::ConflictResolution { ref key, .. } if key.as_str() == "T1"));
    }

    #[test]
    fn agreeing_tie_needs_no_priority() {
        let views = [
            view("a", &[], &[task("1", "T1", "same", 50)]),
            view("b", &[], &[task("9", "T1", "same", 50)]),
        ];
        let decisions = lww().resolve(&views, &IdMap::new()).unwrap();
        assert!(decisions[0].conflict.is_none());
    }

    #[test]
    fn manual_policy_leaves_conflicts_alone() {
        let base = task("1", "T1", "todo", 10);
        let views = [
            view("a", &[base.clone()], &[task("1", "T1", "todo (a)", 20)]),
            view("b", &[base.clone()], &[task("1", "T1", "todo (b)", 30)]),
        ];

        let decisions = Resolver::new(ConflictPolicy::Manual, &[])
            .resolve(&views, &IdMap::new())
            .unwrap();
        assert_eq!(decisions[0].resolution, Resolution::ManualReview);
        assert!(!decisions[0].conflict.as_ref().unwrap().is_resolved());
    }

    #[test]
    fn missing_copy_is_recreated() {
        let base = task("2", "T2", "buy milk", 10);
        let views = [
            view("a", &[base.clone()], &[base.clone()]),
            view("b", &[], &[]),
        ];

        let decisions = lww().resolve(&views, &IdMap::new()).unwrap();
        assert!(matches!(&decisions[0].resolution, Resolution::Upsert(t) if t.title == "buy milk"));
    }

    #[test]
    fn pending_deletion_is_finished() {
        let base = task("3", "T3", "call", 10);
        let views = [
            view("a", &[], &[]),
            view("b", &[base.clone()], &[base.clone()]),
        ];
        let mut mappings = IdMap::new();
        mappings.tombstone("T3".into(), at(60));

        let decisions = lww().resolve(&views, &mappings).unwrap();
        assert_eq!(decisions[0].resolution, Resolution::Delete { at: at(60) });
    }

    #[test]
    fn leftover_newer_edit_beats_older_change() {
        // b holds an edit that won last cycle but never reached a.
        let views = [
            view(
                "a",
                &[task("1", "T1", "old", 10)],
                &[task("1", "T1", "older edit", 20)],
            ),
            view(
                "b",
                &[task("9", "T1", "winner", 50)],
                &[task("9", "T1", "winner", 50)],
            ),
        ];

        let decisions = lww().resolve(&views, &IdMap::new()).unwrap();
        assert!(matches!(&decisions[0].resolution, Resolution::Upsert(t) if t.title == "winner"));
        let conflict = decisions[0].conflict.as_ref().unwrap();
        assert!(conflict.proposals.iter().any(|p| p.carried_over));
    }

    #[test]
    fn older_edit_against_agreed_value_propagates() {
        // Both snapshots hold the newer value, so it is the base of b's edit.
        let agreed = task("1", "T1", "A-final", 50);
        let views = [
            view("a", &[agreed.clone()], &[agreed.clone()]),
            view(
                "b",
                &[task("9", "T1", "A-final", 50)],
                &[task("9", "T1", "B-edit", 40)],
            ),
        ];

        let decisions = lww().resolve(&views, &IdMap::new()).unwrap();
        assert!(matches!(&decisions[0].resolution, Resolution::Upsert(t) if t.title == "B-edit"));
        assert!(decisions[0].conflict.is_none());
    }
}
