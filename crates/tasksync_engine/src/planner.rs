//! Turns merge decisions into per-backend operation lists.

use crate::diff::BackendView;
use crate::merge::{Decision, Resolution};
use std::collections::BTreeMap;
use tasksync_protocol::{BackendId, Operation};

/// Operations to run this cycle, grouped by backend.
///
/// Within a backend, creates come first, then updates, then deletes, each
/// group in logical key order. Every backend of the cycle has an entry,
/// possibly empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    operations: BTreeMap<BackendId, Vec<Operation>>,
}

impl Plan {
    /// Computes the operations that bring every backend to its decided state.
    ///
    /// A backend that already holds the target content gets no operation,
    /// which keeps the plan empty once all backends agree.
    pub fn build(decisions: &[Decision], views: &[BackendView]) -> Self {
        let mut operations: BTreeMap<BackendId, Vec<Operation>> = views
            .iter()
            .map(|view| (view.backend.clone(), Vec::new()))
            .collect();

        for decision in decisions {
            for view in views {
                let current = view.current(&decision.key);
                let op = match (&decision.resolution, current) {
                    (Resolution::Upsert(target), None) => Some(Operation::create(
                        view.backend.clone(),
                        decision.key.clone(),
                        target.clone(),
                        view.snapshot.get(&decision.key),
                    )),
                    (Resolution::Upsert(target), Some(existing))
                        if !existing.same_content(target) =>
                    {
                        Some(Operation::update(
                            view.backend.clone(),
                            decision.key.clone(),
                            existing,
                            target.clone(),
                        ))
                    }
                    (Resolution::Delete { .. }, Some(existing)) => Some(Operation::delete(
                        view.backend.clone(),
                        decision.key.clone(),
                        existing.clone(),
                    )),
                    _ => None,
                };
                if let (Some(op), Some(ops)) = (op, operations.get_mut(&view.backend)) {
                    ops.push(op);
                }
            }
        }

        for ops in operations.values_mut() {
            ops.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        }

        Self { operations }
    }

    #[cfg(test)]
    pub(crate) fn insert(&mut self, backend: BackendId, operations: Vec<Operation>) {
        self.operations.insert(backend, operations);
    }

    /// Operations for `backend`, in execution order.
    pub fn for_backend(&self, backend: &BackendId) -> &[Operation] {
        self.operations
            .get(backend)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Iterates over backends and their operations.
    pub fn iter(&self) -> impl Iterator<Item = (&BackendId, &[Operation])> {
        self.operations
            .iter()
            .map(|(backend, ops)| (backend, ops.as_slice()))
    }

    /// Iterates over every operation.
    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.operations.values().flatten()
    }

    /// Total number of operations.
    pub fn len(&self) -> usize {
        self.operations.values().map(Vec::len).sum()
    }

    /// Returns true if no backend needs changing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::Resolver;
    use chrono::{DateTime, TimeZone, Utc};
    use tasksync_protocol::{ConflictPolicy, OperationKind, Task};
    use tasksync_store::{IdMap, Snapshot};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn backend(id: &str) -> BackendId {
        BackendId::new(id).unwrap()
    }

    fn task(id: &str, key: &str, title: &str) -> Task {
        Task::new(id, title, at(10)).with_logical_key(key)
    }

    fn view(name: &str, prior: &[Task], now: &[Task]) -> BackendView {
        let snapshot = Snapshot::new(
            prior
                .iter()
                .map(|t| (t.logical_key.clone(), t.clone()))
                .collect(),
            at(100),
        );
        BackendView::build(backend(name), now.to_vec(), &[], snapshot, &IdMap::new()).unwrap()
    }

    fn plan(views: &[BackendView]) -> Plan {
        let decisions = Resolver::new(ConflictPolicy::LastWriterWins, &[])
            .resolve(views, &IdMap::new())
            .unwrap();
        Plan::build(&decisions, views)
    }

    #[test]
    fn orders_creates_updates_deletes() {
        let views = [
            view(
                "a",
                &[task("1", "K1", "x"), task("2", "K2", "y")],
                &[
                    task("1", "K1", "x!"),
                    task("3", "K3", "z"),
                    task("4", "K0", "w"),
                ],
            ),
            view(
                "b",
                &[task("b-1", "K1", "x"), task("b-2", "K2", "y")],
                &[task("b-1", "K1", "x"), task("b-2", "K2", "y")],
            ),
        ];

        let plan = plan(&views);
        let ops: Vec<(OperationKind, &str)> = plan
            .for_backend(&backend("b"))
            .iter()
            .map(|op| (op.kind, op.key.as_str()))
            .collect();
        assert_eq!(
            ops,
            vec![
                (OperationKind::Create, "K0"),
                (OperationKind::Create, "K3"),
                (OperationKind::Update, "K1"),
                (OperationKind::Delete, "K2"),
            ]
        );
        assert!(plan.for_backend(&backend("a")).is_empty());
        assert_eq!(plan.len(), 4);
    }

    #[test]
    fn update_targets_backend_local_id() {
        let views = [
            view("a", &[task("1", "K1", "x")], &[task("1", "K1", "x!")]),
            view("b", &[task("b-7", "K1", "x")], &[task("b-7", "K1", "x")]),
        ];

        let plan = plan(&views);
        let op = &plan.for_backend(&backend("b"))[0];
        assert_eq!(op.remote_id.as_deref(), Some("b-7"));
        assert_eq!(op.payload.title, "x!");
    }

    #[test]
    fn agreeing_backends_need_no_operations() {
        let views = [
            view("a", &[], &[task("1", "K1", "same")]),
            view("b", &[], &[task("b-1", "K1", "same")]),
        ];
        assert!(plan(&views).is_empty());
    }

    #[test]
    fn every_backend_has_an_entry() {
        let views = [view("a", &[], &[]), view("b", &[], &[])];
        let plan = plan(&views);
        assert_eq!(plan.iter().count(), 2);
        assert!(plan.is_empty());
    }
}
