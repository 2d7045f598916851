//! Registry of the operations live in the current iteration.
//!
//! The registry owns every `ControlledOperation`, assigns ids in creation
//! order and validates status transitions. It is rebuilt from scratch at
//! the start of each iteration.

use crate::error::SchedulerError;
use crate::operation::{ControlledOperation, OperationId, OperationStatus, NO_PARENT};
use std::collections::BTreeMap;

/// Per-iteration table of controlled operations.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    ops: BTreeMap<OperationId, ControlledOperation>,
    next_id: OperationId,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self {
            ops: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Create the root operation for a fresh iteration. Panics if the
    /// registry is not empty; the driver always clears first.
    pub fn create_root(&mut self) -> OperationId {
        assert!(self.ops.is_empty(), "root must be the first operation");
        self.create(NO_PARENT)
    }

    /// Create a new operation spawned by `parent`. Ids are monotonically
    /// assigned; the sequence id equals the creation order.
    pub fn create(&mut self, parent: OperationId) -> OperationId {
        let id = self.next_id;
        self.next_id += 1;
        let op = ControlledOperation::new(id, parent, id);
        self.ops.insert(id, op);
        id
    }

    pub fn get(&self, id: OperationId) -> Result<&ControlledOperation, SchedulerError> {
        self.ops.get(&id).ok_or(SchedulerError::UnknownOperation(id))
    }

    pub(crate) fn get_mut(
        &mut self,
        id: OperationId,
    ) -> Result<&mut ControlledOperation, SchedulerError> {
        self.ops
            .get_mut(&id)
            .ok_or(SchedulerError::UnknownOperation(id))
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// All operations, in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ControlledOperation> {
        self.ops.values()
    }

    /// Ids of the operations the scheduler may currently pick, in id order.
    pub fn enabled_ids(&self) -> Vec<OperationId> {
        self.ops
            .values()
            .filter(|op| op.is_enabled())
            .map(|op| op.id())
            .collect()
    }

    /// Ids of blocked operations, in id order.
    pub fn blocked_ids(&self) -> Vec<OperationId> {
        self.ops
            .values()
            .filter(|op| op.status() == OperationStatus::Blocked)
            .map(|op| op.id())
            .collect()
    }

    /// True once every operation has completed.
    pub fn all_completed(&self) -> bool {
        self.ops
            .values()
            .all(|op| op.status() == OperationStatus::Completed)
    }

    /// Move a freshly created operation into the enabled state.
    pub fn enable(&mut self, id: OperationId) -> Result<(), SchedulerError> {
        self.transition(id, OperationStatus::Enabled, &[OperationStatus::Created])
    }

    /// Block an enabled operation (it is waiting on a resource).
    pub fn block(&mut self, id: OperationId) -> Result<(), SchedulerError> {
        self.transition(id, OperationStatus::Blocked, &[OperationStatus::Enabled])
    }

    /// Unblock a blocked operation.
    pub fn unblock(&mut self, id: OperationId) -> Result<(), SchedulerError> {
        self.transition(id, OperationStatus::Enabled, &[OperationStatus::Blocked])
    }

    /// Complete an operation. Completed operations record no further
    /// scheduling points.
    pub fn complete(&mut self, id: OperationId) -> Result<(), SchedulerError> {
        self.transition(id, OperationStatus::Completed, &[OperationStatus::Enabled])
    }

    fn transition(
        &mut self,
        id: OperationId,
        to: OperationStatus,
        from: &[OperationStatus],
    ) -> Result<(), SchedulerError> {
        let op = self.get_mut(id)?;
        if !from.contains(&op.status()) {
            return Err(SchedulerError::InvalidTransition {
                operation: id,
                details: format!("{:?} -> {:?}", op.status(), to),
            });
        }
        op.set_status(to);
        Ok(())
    }

    /// Drop all operations; the next iteration starts with fresh ids.
    pub fn clear(&mut self) {
        self.ops.clear();
        self.next_id = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic_and_sequence_matches_creation_order() {
        let mut reg = OperationRegistry::new();
        let root = reg.create_root();
        let a = reg.create(root);
        let b = reg.create(root);

        assert_eq!((root, a, b), (0, 1, 2));
        assert_eq!(reg.get(a).unwrap().sequence_id(), 1);
        assert_eq!(reg.get(b).unwrap().sequence_id(), 2);
        assert!(reg.get(root).unwrap().is_root());
        assert!(!reg.get(a).unwrap().is_root());
    }

    #[test]
    fn test_status_transitions() {
        let mut reg = OperationRegistry::new();
        let root = reg.create_root();

        reg.enable(root).unwrap();
        reg.block(root).unwrap();
        reg.unblock(root).unwrap();
        reg.complete(root).unwrap();

        assert!(reg.all_completed());
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let mut reg = OperationRegistry::new();
        let root = reg.create_root();
        reg.enable(root).unwrap();
        reg.complete(root).unwrap();

        let err = reg.block(root).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition { .. }));
    }

    #[test]
    fn test_enabled_and_blocked_views() {
        let mut reg = OperationRegistry::new();
        let root = reg.create_root();
        let child = reg.create(root);
        reg.enable(root).unwrap();
        reg.enable(child).unwrap();
        reg.block(child).unwrap();

        assert_eq!(reg.enabled_ids(), vec![root]);
        assert_eq!(reg.blocked_ids(), vec![child]);
        assert!(!reg.all_completed());
    }

    #[test]
    fn test_unknown_operation() {
        let reg = OperationRegistry::new();
        assert_eq!(reg.get(42).unwrap_err(), SchedulerError::UnknownOperation(42));
    }

    #[test]
    fn test_clear_resets_ids() {
        let mut reg = OperationRegistry::new();
        reg.create_root();
        reg.clear();
        let root = reg.create_root();
        assert_eq!(root, 0);
    }
}
