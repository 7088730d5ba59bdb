//! Conflict description and resolution policy.

use crate::ids::{BackendId, LogicalKey};
use crate::task::Task;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What a backend proposes for a logical key.
#[derive(Debug, Clone, PartialEq)]
pub enum ProposalKind {
    /// Keep the task with this value.
    Upsert(Task),
    /// Remove the task.
    Delete,
}

/// One backend's competing value for a logical key.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    /// Backend the proposal comes from.
    pub backend: BackendId,
    /// Proposed value.
    pub kind: ProposalKind,
    /// Timestamp used for last-writer-wins ordering.
    pub at: DateTime<Utc>,
    /// True if the value was not changed this cycle but is a newer edit
    /// left over from a cycle that did not fully propagate.
    pub carried_over: bool,
}

impl Proposal {
    /// Proposes keeping `task`.
    pub fn upsert(backend: BackendId, task: Task) -> Self {
        let at = task.updated_at;
        Self {
            backend,
            kind: ProposalKind::Upsert(task),
            at,
            carried_over: false,
        }
    }

    /// Proposes deleting the task, observed at `at`.
    pub fn delete(backend: BackendId, at: DateTime<Utc>) -> Self {
        Self {
            backend,
            kind: ProposalKind::Delete,
            at,
            carried_over: false,
        }
    }

    /// Marks the proposal as carried over from an earlier cycle.
    pub fn carried_over(mut self) -> Self {
        self.carried_over = true;
        self
    }

    /// Returns true if this proposal deletes the task.
    pub fn is_delete(&self) -> bool {
        matches!(self.kind, ProposalKind::Delete)
    }

    /// Returns the proposed task, if any.
    pub fn task(&self) -> Option<&Task> {
        match &self.kind {
            ProposalKind::Upsert(task) => Some(task),
            ProposalKind::Delete => None,
        }
    }

    /// Returns true if both proposals lead to the same end state.
    pub fn agrees_with(&self, other: &Proposal) -> bool {
        match (&self.kind, &other.kind) {
            (ProposalKind::Delete, ProposalKind::Delete) => true,
            (ProposalKind::Upsert(a), ProposalKind::Upsert(b)) => a.same_content(b),
            _ => false,
        }
    }
}

/// How a conflict was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictOutcome {
    /// The winning backend's value is kept everywhere.
    Kept {
        /// Winning backend.
        winner: BackendId,
    },
    /// The deletion won.
    Deleted {
        /// Backend whose deletion won.
        winner: BackendId,
    },
    /// A deletion lost to a newer update; the task is restored.
    Undeleted {
        /// Backend whose update won.
        winner: BackendId,
    },
    /// Left for a human to decide.
    ManualReview,
}

/// A logical key whose backends disagree.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    /// Logical key in conflict.
    pub key: LogicalKey,
    /// Competing proposals, ordered by backend id.
    pub proposals: Vec<Proposal>,
    /// Resolution (if any).
    pub outcome: Option<ConflictOutcome>,
}

impl Conflict {
    /// Creates an unresolved conflict.
    pub fn new(key: LogicalKey, mut proposals: Vec<Proposal>) -> Self {
        proposals.sort_by(|a, b| a.backend.cmp(&b.backend));
        Self {
            key,
            proposals,
            outcome: None,
        }
    }

    /// Returns true if one side deleted while another kept the task.
    pub fn is_update_delete_conflict(&self) -> bool {
        self.proposals.iter().any(Proposal::is_delete)
            && self.proposals.iter().any(|p| !p.is_delete())
    }

    /// Records the resolution.
    pub fn resolve(&mut self, outcome: ConflictOutcome) {
        self.outcome = Some(outcome);
    }

    /// Returns true if the conflict has been settled automatically.
    pub fn is_resolved(&self) -> bool {
        matches!(&self.outcome, Some(outcome) if *outcome != ConflictOutcome::ManualReview)
    }

    /// Returns the winning backend, if any.
    pub fn winner(&self) -> Option<&BackendId> {
        match self.outcome.as_ref()? {
            ConflictOutcome::Kept { winner }
            | ConflictOutcome::Deleted { winner }
            | ConflictOutcome::Undeleted { winner } => Some(winner),
            ConflictOutcome::ManualReview => None,
        }
    }
}

/// Policy for settling conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Latest timestamp wins, ties broken by backend priority.
    #[default]
    LastWriterWins,
    /// Conflicts are reported and left untouched.
    Manual,
}

impl ConflictPolicy {
    /// Returns true if this policy automatically resolves conflicts.
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, ConflictPolicy::Manual)
    }

    /// Returns the configuration name of the policy.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::LastWriterWins => "last-writer-wins",
            ConflictPolicy::Manual => "manual",
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last-writer-wins" | "lww" => Ok(ConflictPolicy::LastWriterWins),
            "manual" => Ok(ConflictPolicy::Manual),
            other => Err(format!("unknown conflict policy: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn backend(id: &str) -> BackendId {
        BackendId::new(id).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn proposals_sorted_by_backend() {
        let conflict = Conflict::new(
            "T1".into(),
            vec![
                Proposal::delete(backend("b"), at(5)),
                Proposal::upsert(backend("a"), Task::new("1", "x", at(4))),
            ],
        );
        assert_eq!(conflict.proposals[0].backend.as_str(), "a");
        assert!(conflict.is_update_delete_conflict());
        assert!(!conflict.is_resolved());
    }

    #[test]
    fn agreement_rules() {
        let a = Proposal::upsert(backend("a"), Task::new("1", "x", at(1)));
        let b = Proposal::upsert(backend("b"), Task::new("9", "x", at(2)));
        let c = Proposal::upsert(backend("c"), Task::new("3", "y", at(2)));
        let d = Proposal::delete(backend("d"), at(3));

        assert!(a.agrees_with(&b));
        assert!(!a.agrees_with(&c));
        assert!(!a.agrees_with(&d));
        assert!(d.agrees_with(&Proposal::delete(backend("e"), at(9))));
    }

    #[test]
    fn manual_review_is_not_resolved() {
        let mut conflict = Conflict::new("T".into(), vec![]);
        conflict.resolve(ConflictOutcome::ManualReview);
        assert!(!conflict.is_resolved());
        assert!(conflict.winner().is_none());

        conflict.resolve(ConflictOutcome::Undeleted { winner: backend("b") });
        assert!(conflict.is_resolved());
        assert_eq!(conflict.winner().map(BackendId::as_str), Some("b"));
    }

    #[test]
    fn policy_names() {
        assert_eq!("manual".parse::<ConflictPolicy>(), Ok(ConflictPolicy::Manual));
        assert_eq!(
            "last-writer-wins".parse::<ConflictPolicy>(),
            Ok(ConflictPolicy::LastWriterWins)
        );
        assert!("newest".parse::<ConflictPolicy>().is_err());
        assert!(ConflictPolicy::default().auto_resolves());
        assert!(!ConflictPolicy::Manual.auto_resolves());
    }

    #[test]
    fn policy_serde_uses_kebab_case() {
        let json = serde_json::to_string(&ConflictPolicy::LastWriterWins).unwrap();
        assert_eq!(json, "\"last-writer-wins\"");
        let policy: ConflictPolicy = serde_json::from_str("\"manual\"").unwrap();
        assert_eq!(policy, ConflictPolicy::Manual);
    }
}
