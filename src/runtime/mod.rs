//! Iteration driver.
//!
//! `SchedulerCore` is the synchronous heart of the runtime: it owns the
//! operation registry, the execution graph, the reducer and the strategy,
//! and advances one scheduling decision at a time. The cooperative thread
//! host in [`executor`] feeds it the instrumentation and lifecycle
//! callbacks; nothing in here touches a thread or a clock.

pub mod executor;

use crate::error::{IterationOutcome, SchedulerError};
use crate::graph::ExecutionGraph;
use crate::operation::{
    ControlledOperation, Equivalence, OperationId, OperationRegistry, OperationStatus,
};
use crate::reducer::{ScheduleReducer, SharedStateReducer};
use crate::scheduling::SchedulingPointType;
use crate::strategy::{SchedulingStrategy, StrategyContext, StrategyKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Knobs of a test run.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Configuration {
    /// Number of iterations to explore.
    pub iteration_count: u32,
    /// Scheduling-step budget per iteration.
    pub max_scheduling_steps: u32,
    /// Wall-clock deadline per iteration.
    pub timeout: Duration,
    /// Base seed for the strategy.
    pub seed: u64,
    /// Which strategy to build when none is supplied explicitly.
    pub strategy_kind: StrategyKind,
    /// Whether the execution graph records nodes. Coverage-guided
    /// strategies need this on.
    pub is_coverage_enabled: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            iteration_count: 10,
            max_scheduling_steps: 10_000,
            timeout: Duration::from_secs(10),
            seed: 0,
            strategy_kind: StrategyKind::Random,
            is_coverage_enabled: true,
        }
    }
}

/// One recorded scheduling decision, kept for bug reports.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScheduleStep {
    pub step: u32,
    pub operation: OperationId,
    pub point: SchedulingPointType,
    pub call_site: String,
}

/// What the driver wants to happen after a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulingDecision {
    /// Resume the given operation; the caller yields cooperatively.
    Resume(OperationId),
    /// The iteration is over.
    Finished(IterationOutcome),
}

/// The iteration driver. Owns registry and graph for the lifetime of an
/// iteration; the reducer's access sets and the graph's coverage map
/// persist across iterations.
pub struct SchedulerCore {
    config: Configuration,
    registry: OperationRegistry,
    graph: ExecutionGraph,
    reducer: Box<dyn ScheduleReducer>,
    strategy: Box<dyn SchedulingStrategy>,
    iteration: u32,
    step: u32,
    trace: Vec<ScheduleStep>,
}

impl SchedulerCore {
    /// Build a driver with the default shared-state reducer.
    pub fn new(config: Configuration, strategy: Box<dyn SchedulingStrategy>) -> Self {
        Self::with_reducer(config, strategy, Box::new(SharedStateReducer::new()))
    }

    pub fn with_reducer(
        config: Configuration,
        strategy: Box<dyn SchedulingStrategy>,
        reducer: Box<dyn ScheduleReducer>,
    ) -> Self {
        Self {
            config,
            registry: OperationRegistry::new(),
            graph: ExecutionGraph::new(),
            reducer,
            strategy,
            iteration: 0,
            step: 0,
            trace: Vec::new(),
        }
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn graph(&self) -> &ExecutionGraph {
        &self.graph
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn step(&self) -> u32 {
        self.step
    }

    /// Scheduling decisions taken so far this iteration.
    pub fn trace(&self) -> &[ScheduleStep] {
        &self.trace
    }

    pub fn strategy_description(&self) -> String {
        self.strategy.description()
    }

    /// Reset per-iteration state and create the root operation, enabled
    /// and ready to run. Returns the root id.
    pub fn start_iteration(&mut self) -> Result<OperationId, SchedulerError> {
        self.registry.clear();
        self.graph.clear();
        self.trace.clear();
        self.step = 0;
        self.strategy.initialize_next_iteration(self.iteration);
        self.reducer.initialize_next_iteration(self.iteration);

        let root = self.registry.create_root();
        self.registry.enable(root)?;
        log::debug!(
            "iteration {}: root operation {} created",
            self.iteration,
            root
        );
        Ok(root)
    }

    /// Tear down the iteration; persistent state (coverage map, reducer
    /// access sets) survives. Returns the schedule trace that was taken.
    pub fn finish_iteration(&mut self) -> Vec<ScheduleStep> {
        self.iteration += 1;
        std::mem::take(&mut self.trace)
    }

    /// Lifecycle callback: user code spawned a new operation under
    /// `parent`. The new operation starts enabled.
    pub fn create_operation(&mut self, parent: OperationId) -> Result<OperationId, SchedulerError> {
        self.registry.get(parent)?;
        let id = self.registry.create(parent);
        self.registry.enable(id)?;
        log::debug!("operation {} created by {}", id, parent);
        Ok(id)
    }

    /// Instrumentation callback: `op` reached a scheduling point. Records
    /// the point, extends the execution graph and decides which operation
    /// runs next.
    pub fn on_scheduling_point(
        &mut self,
        op: OperationId,
        point: SchedulingPointType,
        shared_state: Option<String>,
        comparer: Option<Arc<dyn Equivalence>>,
        call_site: String,
        hashed_program_state: i32,
    ) -> Result<SchedulingDecision, SchedulerError> {
        {
            let operation = self.registry.get_mut(op)?;
            if operation.status() == OperationStatus::Completed {
                return Err(SchedulerError::InvalidTransition {
                    operation: op,
                    details: "scheduling point after completion".to_string(),
                });
            }
            operation.record_scheduling_point(
                point,
                shared_state,
                comparer,
                call_site.clone(),
                hashed_program_state,
            );
        }
        if self.config.is_coverage_enabled {
            let operation = self.registry.get(op)?;
            self.graph.add(operation)?;
        }

        self.trace.push(ScheduleStep {
            step: self.step,
            operation: op,
            point,
            call_site,
        });
        self.step += 1;
        if self.step >= self.config.max_scheduling_steps {
            log::warn!(
                "iteration {}: scheduling-step budget ({}) exhausted",
                self.iteration,
                self.config.max_scheduling_steps
            );
            return Ok(SchedulingDecision::Finished(
                IterationOutcome::MaxStepsReached,
            ));
        }
        self.schedule_next(op)
    }

    /// Lifecycle callback: `op` finished its work.
    pub fn on_complete(&mut self, op: OperationId) -> Result<SchedulingDecision, SchedulerError> {
        self.registry.complete(op)?;
        log::debug!("operation {} completed", op);
        self.schedule_next(op)
    }

    /// Lifecycle callback: `op` blocked waiting on a resource.
    pub fn on_block(
        &mut self,
        op: OperationId,
        reason: &str,
    ) -> Result<SchedulingDecision, SchedulerError> {
        self.registry.block(op)?;
        log::debug!("operation {} blocked: {}", op, reason);
        self.schedule_next(op)
    }

    /// Lifecycle callback: another operation released the resource `op`
    /// was waiting on. The caller keeps running; no decision is needed.
    pub fn on_unblock(&mut self, op: OperationId) -> Result<(), SchedulerError> {
        self.registry.unblock(op)?;
        log::debug!("operation {} unblocked", op);
        Ok(())
    }

    fn schedule_next(
        &mut self,
        current: OperationId,
    ) -> Result<SchedulingDecision, SchedulerError> {
        let enabled = self.registry.enabled_ids();
        if enabled.is_empty() {
            if self.registry.all_completed() {
                log::debug!(
                    "iteration {}: all {} operations completed",
                    self.iteration,
                    self.registry.len()
                );
                return Ok(SchedulingDecision::Finished(IterationOutcome::Passed));
            }
            let blocked = self.registry.blocked_ids();
            log::warn!(
                "iteration {}: deadlock, blocked operations {:?}",
                self.iteration,
                blocked
            );
            return Ok(SchedulingDecision::Finished(IterationOutcome::Deadlock {
                blocked,
            }));
        }

        let ops: Vec<&ControlledOperation> = enabled
            .iter()
            .map(|&id| self.registry.get(id))
            .collect::<Result<_, _>>()?;
        let current_op = self.registry.get(current)?;
        let reduced = self.reducer.reduce(&ops, current_op);
        let reduced_ids: Vec<OperationId> = reduced.iter().map(|op| op.id()).collect();

        let context = StrategyContext {
            iteration: self.iteration,
            step: self.step,
            graph: &self.graph,
        };
        let next = match self.strategy.next(&reduced_ids, &context) {
            Some(id) => id,
            None => {
                return Err(SchedulerError::StrategyMisuse {
                    details: format!(
                        "no pick from a non-empty enabled set of {} operations",
                        reduced_ids.len()
                    ),
                })
            }
        };
        if !reduced_ids.contains(&next) {
            return Err(SchedulerError::StrategyMisuse {
                details: format!("picked operation {} outside the reduced set", next),
            });
        }
        log::debug!(
            "iteration {} step {}: resume operation {} (enabled {}, reduced {})",
            self.iteration,
            self.step,
            next,
            enabled.len(),
            reduced_ids.len()
        );
        Ok(SchedulingDecision::Resume(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::RandomStrategy;

    /// Always picks the lowest id; used to make driver tests deterministic.
    struct FirstStrategy;

    impl SchedulingStrategy for FirstStrategy {
        fn initialize_next_iteration(&mut self, _iteration: u32) {}

        fn next(
            &mut self,
            enabled: &[OperationId],
            _context: &StrategyContext<'_>,
        ) -> Option<OperationId> {
            enabled.first().copied()
        }

        fn description(&self) -> String {
            "first".to_string()
        }
    }

    /// Always picks an id that cannot exist.
    struct RogueStrategy;

    impl SchedulingStrategy for RogueStrategy {
        fn initialize_next_iteration(&mut self, _iteration: u32) {}

        fn next(
            &mut self,
            _enabled: &[OperationId],
            _context: &StrategyContext<'_>,
        ) -> Option<OperationId> {
            Some(9999)
        }

        fn description(&self) -> String {
            "rogue".to_string()
        }
    }

    fn core_with_first_strategy() -> SchedulerCore {
        SchedulerCore::new(Configuration::default(), Box::new(FirstStrategy))
    }

    #[test]
    fn test_single_operation_runs_to_completion() {
        let mut core = core_with_first_strategy();
        let root = core.start_iteration().unwrap();

        let decision = core
            .on_scheduling_point(
                root,
                SchedulingPointType::Default,
                None,
                None,
                "Main::run".to_string(),
                0,
            )
            .unwrap();
        assert_eq!(decision, SchedulingDecision::Resume(root));

        let decision = core.on_complete(root).unwrap();
        assert_eq!(
            decision,
            SchedulingDecision::Finished(IterationOutcome::Passed)
        );
        assert_eq!(core.graph().len(), 1);
        assert_eq!(core.trace().len(), 1);
    }

    #[test]
    fn test_deadlock_when_all_remaining_operations_block() {
        // S6: both live operations end up blocked.
        let mut core = core_with_first_strategy();
        let root = core.start_iteration().unwrap();
        let child = core.create_operation(root).unwrap();

        core.on_scheduling_point(
            root,
            SchedulingPointType::Create,
            None,
            None,
            "Main::spawn".to_string(),
            0,
        )
        .unwrap();

        let decision = core.on_block(root, "signal wait").unwrap();
        assert_eq!(decision, SchedulingDecision::Resume(child));
        let decision = core.on_block(child, "signal wait").unwrap();
        assert_eq!(
            decision,
            SchedulingDecision::Finished(IterationOutcome::Deadlock {
                blocked: vec![root, child]
            })
        );
    }

    #[test]
    fn test_unblock_restores_scheduling() {
        let mut core = core_with_first_strategy();
        let root = core.start_iteration().unwrap();
        let child = core.create_operation(root).unwrap();

        let decision = core.on_block(child, "signal wait").unwrap();
        assert_eq!(decision, SchedulingDecision::Resume(root));

        core.on_unblock(child).unwrap();
        let decision = core.on_complete(root).unwrap();
        assert_eq!(decision, SchedulingDecision::Resume(child));
        let decision = core.on_complete(child).unwrap();
        assert_eq!(
            decision,
            SchedulingDecision::Finished(IterationOutcome::Passed)
        );
    }

    #[test]
    fn test_strategy_misuse_is_fatal() {
        let mut core = SchedulerCore::new(Configuration::default(), Box::new(RogueStrategy));
        let root = core.start_iteration().unwrap();
        let err = core
            .on_scheduling_point(
                root,
                SchedulingPointType::Default,
                None,
                None,
                "Main::run".to_string(),
                0,
            )
            .unwrap_err();
        assert!(matches!(err, SchedulerError::StrategyMisuse { .. }));
    }

    #[test]
    fn test_completed_operation_records_no_further_points() {
        let mut core = core_with_first_strategy();
        let root = core.start_iteration().unwrap();
        let child = core.create_operation(root).unwrap();
        core.on_complete(root).unwrap();

        let err = core
            .on_scheduling_point(
                root,
                SchedulingPointType::Default,
                None,
                None,
                "Main::late".to_string(),
                0,
            )
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition { .. }));
        let _ = child;
    }

    #[test]
    fn test_max_steps_budget_ends_iteration() {
        let config = Configuration {
            max_scheduling_steps: 2,
            ..Configuration::default()
        };
        let mut core = SchedulerCore::new(config, Box::new(FirstStrategy));
        let root = core.start_iteration().unwrap();

        let first = core
            .on_scheduling_point(
                root,
                SchedulingPointType::Default,
                None,
                None,
                "Main::loop".to_string(),
                0,
            )
            .unwrap();
        assert_eq!(first, SchedulingDecision::Resume(root));
        let second = core
            .on_scheduling_point(
                root,
                SchedulingPointType::Default,
                None,
                None,
                "Main::loop".to_string(),
                0,
            )
            .unwrap();
        assert_eq!(
            second,
            SchedulingDecision::Finished(IterationOutcome::MaxStepsReached)
        );
    }

    #[test]
    fn test_coverage_disabled_skips_graph_recording() {
        let config = Configuration {
            is_coverage_enabled: false,
            ..Configuration::default()
        };
        let mut core = SchedulerCore::new(config, Box::new(FirstStrategy));
        let root = core.start_iteration().unwrap();
        core.on_scheduling_point(
            root,
            SchedulingPointType::Default,
            None,
            None,
            "Main::run".to_string(),
            0,
        )
        .unwrap();
        assert!(core.graph().is_empty());
    }

    #[test]
    fn test_iteration_reset_preserves_coverage() {
        let mut core = SchedulerCore::new(Configuration::default(), Box::new(RandomStrategy::new(3)));
        let root = core.start_iteration().unwrap();
        core.on_scheduling_point(
            root,
            SchedulingPointType::Default,
            None,
            None,
            "Main::first".to_string(),
            0,
        )
        .unwrap();
        core.on_scheduling_point(
            root,
            SchedulingPointType::Default,
            None,
            None,
            "Main::second".to_string(),
            0,
        )
        .unwrap();
        core.on_complete(root).unwrap();
        core.finish_iteration();
        assert!(core.graph().covers("Main::first", "Main::second"));

        let root = core.start_iteration().unwrap();
        assert_eq!(root, 0);
        assert!(core.graph().is_empty());
        assert!(core.graph().covers("Main::first", "Main::second"));
        assert_eq!(core.iteration(), 1);
    }
}
