// Weave runtime crate root
//
// A systematic concurrency testing runtime: a cooperative scheduler that
// explores interleavings of controlled operations, pruned by a shared-state
// reducer and recorded into an execution graph for coverage analysis.

pub mod error;
pub mod graph;
pub mod operation;
pub mod reducer;
pub mod report;
pub mod runtime;
pub mod scheduling;
pub mod strategy;

pub use error::{IterationOutcome, SchedulerError};
pub use operation::{ControlledOperation, Equivalence, OperationId, OperationStatus};
pub use runtime::executor::{RuntimeHandle, Signal, TestRunner};
pub use runtime::{Configuration, SchedulerCore, SchedulingDecision};
pub use scheduling::SchedulingPointType;
