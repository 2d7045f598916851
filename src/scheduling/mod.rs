//! Scheduling point classification.
//!
//! Every callback site in instrumented user code carries one of these point
//! kinds; the reducer and the strategies only ever look at the predicates.

use serde::{Deserialize, Serialize};

/// The kind of scheduling point an operation is paused at.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulingPointType {
    /// Unclassified scheduling point.
    Default,
    /// Explicitly requested interleaving.
    Interleave,
    /// Cooperative yield of the current operation.
    Yield,
    /// Read access to a shared-state key.
    Read,
    /// Write access to a shared-state key.
    Write,
    /// Creation of a new controlled operation.
    Create,
    /// Context switch injected by the scheduler itself.
    ContextSwitch,
    /// Acquisition of a synchronization resource.
    Acquire,
    /// Release of a synchronization resource.
    Release,
    /// Send over a channel-like resource.
    Send,
    /// Receive over a channel-like resource.
    Receive,
}

impl SchedulingPointType {
    /// True when the point records a shared-state access.
    pub fn is_read_or_write(self) -> bool {
        matches!(self, SchedulingPointType::Read | SchedulingPointType::Write)
    }

    /// True when the point requests explicit interleaving, which disables
    /// shared-state reduction for the step.
    pub fn is_interleaving(self) -> bool {
        matches!(
            self,
            SchedulingPointType::Interleave | SchedulingPointType::Yield
        )
    }
}

impl Default for SchedulingPointType {
    fn default() -> Self {
        SchedulingPointType::Default
    }
}
