//! Controlled operations.
//!
//! A controlled operation is the unit of schedulable work: one logical task
//! whose execution the driver serializes against all other operations. The
//! struct records the bookkeeping the reducer and the execution graph read
//! at every scheduling point.

pub mod registry;

use crate::scheduling::SchedulingPointType;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;

pub use registry::OperationRegistry;

/// Identifier of a controlled operation, unique within an iteration.
pub type OperationId = u64;

/// Sentinel parent id carried by the root operation.
pub const NO_PARENT: OperationId = u64::MAX;

/// Lifecycle status of a controlled operation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Created,
    Enabled,
    Blocked,
    Completed,
}

/// Equality capability over shared-state keys. Instrumentation may attach
/// one per operation when plain string equality is too coarse; the reducer
/// falls back to string equality when absent.
pub trait Equivalence: Send + Sync + Debug {
    fn equals(&self, a: &str, b: &str) -> bool;
    fn hash(&self, key: &str) -> u64;
}

/// One schedulable logical task.
///
/// All fields are read-only to the reducer, strategies and the graph;
/// mutation is confined to the driver and the instrumentation callbacks.
#[derive(Debug, Clone)]
pub struct ControlledOperation {
    id: OperationId,
    parent_id: OperationId,
    sequence_id: u64,
    is_root: bool,
    status: OperationStatus,
    last_scheduling_point: SchedulingPointType,
    last_accessed_shared_state: Option<String>,
    last_accessed_shared_state_comparer: Option<Arc<dyn Equivalence>>,
    visited_call_sites: Vec<String>,
    last_hashed_program_state: i32,
}

impl ControlledOperation {
    pub(crate) fn new(id: OperationId, parent_id: OperationId, sequence_id: u64) -> Self {
        Self {
            id,
            parent_id,
            sequence_id,
            is_root: parent_id == NO_PARENT,
            status: OperationStatus::Created,
            last_scheduling_point: SchedulingPointType::Default,
            last_accessed_shared_state: None,
            last_accessed_shared_state_comparer: None,
            visited_call_sites: Vec::new(),
            last_hashed_program_state: 0,
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn parent_id(&self) -> OperationId {
        self.parent_id
    }

    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn status(&self) -> OperationStatus {
        self.status
    }

    pub fn last_scheduling_point(&self) -> SchedulingPointType {
        self.last_scheduling_point
    }

    pub fn last_accessed_shared_state(&self) -> Option<&str> {
        self.last_accessed_shared_state.as_deref()
    }

    pub fn last_accessed_shared_state_comparer(&self) -> Option<&Arc<dyn Equivalence>> {
        self.last_accessed_shared_state_comparer.as_ref()
    }

    /// Call sites visited so far this iteration, in visitation order. The
    /// list only ever grows while the operation is live.
    pub fn visited_call_sites(&self) -> &[String] {
        &self.visited_call_sites
    }

    pub fn last_hashed_program_state(&self) -> i32 {
        self.last_hashed_program_state
    }

    /// True when the scheduler may pick this operation next.
    pub fn is_enabled(&self) -> bool {
        self.status == OperationStatus::Enabled
    }

    pub(crate) fn set_status(&mut self, status: OperationStatus) {
        self.status = status;
    }

    /// Record a scheduling point hit by this operation. Appends the call
    /// site and overwrites the last-access bookkeeping.
    pub(crate) fn record_scheduling_point(
        &mut self,
        point: SchedulingPointType,
        shared_state: Option<String>,
        comparer: Option<Arc<dyn Equivalence>>,
        call_site: String,
        hashed_program_state: i32,
    ) {
        self.last_scheduling_point = point;
        self.last_accessed_shared_state = shared_state;
        self.last_accessed_shared_state_comparer = comparer;
        self.visited_call_sites.push(call_site);
        self.last_hashed_program_state = hashed_program_state;
    }

    /// True when `key` matches this operation's last accessed shared state,
    /// using the attached comparer when present and string equality
    /// otherwise. False when the operation recorded no access.
    pub fn matches_shared_state(&self, key: &str) -> bool {
        match self.last_accessed_shared_state.as_deref() {
            Some(own) => match &self.last_accessed_shared_state_comparer {
                Some(cmp) => cmp.equals(own, key),
                None => own == key,
            },
            None => false,
        }
    }
}
