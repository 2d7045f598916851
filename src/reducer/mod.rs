//! Schedule reduction.
//!
//! A reducer narrows the set of enabled operations the strategy picks from,
//! without losing reachable interleavings of interest. The built-in
//! shared-state reducer exploits read-only access knowledge accumulated
//! across iterations: an operation whose only visible action is a read of a
//! key never observed at a write point commutes with every other enabled
//! operation, so exploring it alone is enough for that step.

use crate::operation::ControlledOperation;
use crate::scheduling::SchedulingPointType;
use std::collections::HashSet;

/// Contract for pluggable schedule reducers.
pub trait ScheduleReducer: Send {
    /// Called between iterations. Reducers keep their accumulated
    /// knowledge; per-iteration scratch state may be reset here.
    fn initialize_next_iteration(&mut self, iteration: u32);

    /// Return a subset of `ops` that preserves the interleavings worth
    /// exploring at this step. Returning `ops` unchanged is always sound.
    fn reduce<'a>(
        &mut self,
        ops: &[&'a ControlledOperation],
        current: &ControlledOperation,
    ) -> Vec<&'a ControlledOperation>;

    fn description(&self) -> String;
}

/// Reducer keyed on shared-state read/write knowledge.
///
/// The access sets grow monotonically for the whole run: once a key has
/// been seen at a write point, no operation reading it is ever classified
/// read-only again. The classification is approximate per step; exploration
/// across iterations makes up for keys that only later turn out to be
/// written.
#[derive(Debug, Default)]
pub struct SharedStateReducer {
    read_accesses: HashSet<String>,
    write_accesses: HashSet<String>,
}

impl SharedStateReducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared-state keys ever observed at a read point.
    pub fn read_accesses(&self) -> &HashSet<String> {
        &self.read_accesses
    }

    /// Shared-state keys ever observed at a write point.
    pub fn write_accesses(&self) -> &HashSet<String> {
        &self.write_accesses
    }

    fn is_read_only(&self, op: &ControlledOperation) -> bool {
        if op.last_accessed_shared_state().is_none() {
            return false;
        }
        !self
            .write_accesses
            .iter()
            .any(|written| op.matches_shared_state(written))
    }
}

impl ScheduleReducer for SharedStateReducer {
    fn initialize_next_iteration(&mut self, _iteration: u32) {
        // Accumulated access knowledge must persist across iterations.
    }

    fn reduce<'a>(
        &mut self,
        ops: &[&'a ControlledOperation],
        _current: &ControlledOperation,
    ) -> Vec<&'a ControlledOperation> {
        // Explicit interleaving requests disable reduction for the step.
        if ops
            .iter()
            .any(|op| op.last_scheduling_point().is_interleaving())
        {
            return ops.to_vec();
        }

        // Points that are neither reads nor writes pass through untouched;
        // other reducers may compose behind this one.
        let non_read_write: Vec<&ControlledOperation> = ops
            .iter()
            .copied()
            .filter(|op| !op.last_scheduling_point().is_read_or_write())
            .collect();
        if !non_read_write.is_empty() {
            return non_read_write;
        }

        // Everything enabled is paused at a read or write: fold the
        // observed keys into the persistent access sets.
        for op in ops {
            if let Some(key) = op.last_accessed_shared_state() {
                let set = if op.last_scheduling_point() == SchedulingPointType::Read {
                    &mut self.read_accesses
                } else {
                    &mut self.write_accesses
                };
                if set.insert(key.to_string()) {
                    log::debug!(
                        "reducer: learned {:?} access of {:?}",
                        op.last_scheduling_point(),
                        key
                    );
                }
            }
        }

        let read_only: Vec<&ControlledOperation> = ops
            .iter()
            .copied()
            .filter(|op| {
                op.last_scheduling_point() == SchedulingPointType::Read && self.is_read_only(op)
            })
            .collect();
        if !read_only.is_empty() {
            log::debug!(
                "reducer: narrowed {} ops to {} read-only ops",
                ops.len(),
                read_only.len()
            );
            return read_only;
        }
        ops.to_vec()
    }

    fn description(&self) -> String {
        "shared-state".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{ControlledOperation, OperationId, NO_PARENT};
    use crate::scheduling::SchedulingPointType;

    fn op_at(
        id: OperationId,
        point: SchedulingPointType,
        key: Option<&str>,
    ) -> ControlledOperation {
        let mut op = ControlledOperation::new(id, NO_PARENT, id);
        op.record_scheduling_point(
            point,
            key.map(|k| k.to_string()),
            None,
            format!("site_{}", id),
            0,
        );
        op
    }

    fn ids(ops: &[&ControlledOperation]) -> Vec<OperationId> {
        ops.iter().map(|op| op.id()).collect()
    }

    #[test]
    fn test_reads_without_writes_stay_unreduced() {
        // S2, first half: two reads of distinct keys, no write knowledge.
        let mut reducer = SharedStateReducer::new();
        let a = op_at(0, SchedulingPointType::Read, Some("x"));
        let b = op_at(1, SchedulingPointType::Read, Some("y"));

        let reduced = reducer.reduce(&[&a, &b], &a);
        assert_eq!(ids(&reduced), vec![0, 1]);
        assert!(reducer.read_accesses().contains("x"));
        assert!(reducer.read_accesses().contains("y"));
    }

    #[test]
    fn test_written_key_disqualifies_reader() {
        // S2, second half: once "x" is known written, only the "y" reader
        // remains read-only.
        let mut reducer = SharedStateReducer::new();
        let writer = op_at(2, SchedulingPointType::Write, Some("x"));
        let reader = op_at(3, SchedulingPointType::Read, Some("z"));
        reducer.reduce(&[&writer, &reader], &writer);
        assert!(reducer.write_accesses().contains("x"));

        let a = op_at(0, SchedulingPointType::Read, Some("x"));
        let b = op_at(1, SchedulingPointType::Read, Some("y"));
        let reduced = reducer.reduce(&[&a, &b], &a);
        assert_eq!(ids(&reduced), vec![1]);
    }

    #[test]
    fn test_interleave_disables_reduction() {
        // S3: a yield in the enabled set returns everything unchanged.
        let mut reducer = SharedStateReducer::new();
        let a = op_at(0, SchedulingPointType::Read, Some("x"));
        let b = op_at(1, SchedulingPointType::Yield, None);

        let reduced = reducer.reduce(&[&a, &b], &a);
        assert_eq!(ids(&reduced), vec![0, 1]);
    }

    #[test]
    fn test_non_read_write_points_pass_through() {
        let mut reducer = SharedStateReducer::new();
        let a = op_at(0, SchedulingPointType::Read, Some("x"));
        let b = op_at(1, SchedulingPointType::Acquire, None);
        let c = op_at(2, SchedulingPointType::Write, Some("y"));

        let reduced = reducer.reduce(&[&a, &b, &c], &a);
        assert_eq!(ids(&reduced), vec![1]);
        // The early return must not have recorded the read/write keys.
        assert!(reducer.read_accesses().is_empty());
        assert!(reducer.write_accesses().is_empty());
    }

    #[test]
    fn test_write_knowledge_is_monotonic() {
        let mut reducer = SharedStateReducer::new();
        let writer = op_at(0, SchedulingPointType::Write, Some("k"));
        reducer.reduce(&[&writer], &writer);

        reducer.initialize_next_iteration(1);
        assert!(reducer.write_accesses().contains("k"));

        // A reader of "k" can never again be classified read-only.
        let reader = op_at(1, SchedulingPointType::Read, Some("k"));
        let other = op_at(2, SchedulingPointType::Read, Some("m"));
        let reduced = reducer.reduce(&[&reader, &other], &reader);
        assert_eq!(ids(&reduced), vec![2]);
    }

    #[test]
    fn test_all_readers_written_returns_full_set() {
        let mut reducer = SharedStateReducer::new();
        let writer = op_at(0, SchedulingPointType::Write, Some("k"));
        reducer.reduce(&[&writer], &writer);

        let a = op_at(1, SchedulingPointType::Read, Some("k"));
        let b = op_at(2, SchedulingPointType::Write, Some("k"));
        let reduced = reducer.reduce(&[&a, &b], &a);
        assert_eq!(ids(&reduced), vec![1, 2]);
    }

    #[test]
    fn test_reader_without_key_is_not_read_only() {
        let mut reducer = SharedStateReducer::new();
        let keyless = op_at(0, SchedulingPointType::Read, None);
        let keyed = op_at(1, SchedulingPointType::Read, Some("x"));

        let reduced = reducer.reduce(&[&keyless, &keyed], &keyless);
        assert_eq!(ids(&reduced), vec![1]);
    }
}
