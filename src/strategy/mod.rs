//! Scheduling strategies.
//!
//! A strategy picks the next operation to resume from the reduced enabled
//! set. Concrete search strategies are plug-ins behind the
//! `SchedulingStrategy` trait; the runtime ships a seeded random reference
//! strategy and a coverage-guided one that feeds the execution graph's
//! call-site frequencies back into exploration.

use crate::graph::ExecutionGraph;
use crate::operation::OperationId;
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

/// Read-only view handed to strategies at every pick.
pub struct StrategyContext<'a> {
    /// Current iteration, starting at 0.
    pub iteration: u32,
    /// Scheduling steps taken so far this iteration.
    pub step: u32,
    /// The execution graph recorded so far, including the persistent
    /// coverage map.
    pub graph: &'a ExecutionGraph,
}

/// Contract that pluggable search strategies must implement.
pub trait SchedulingStrategy: Send {
    /// Called before each iteration so the strategy can reset or reseed.
    fn initialize_next_iteration(&mut self, iteration: u32);

    /// Pick the next operation out of `enabled`. Returning an id outside
    /// `enabled` (or `None` for a non-empty set) is a fatal strategy error.
    fn next(&mut self, enabled: &[OperationId], context: &StrategyContext<'_>)
        -> Option<OperationId>;

    fn description(&self) -> String;
}

/// The strategy kinds the runtime can construct by name.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Random,
    Coverage,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Random => "random",
            StrategyKind::Coverage => "coverage",
        }
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "random" => Ok(StrategyKind::Random),
            "coverage" => Ok(StrategyKind::Coverage),
            other => Err(format!("unknown strategy kind: {}", other)),
        }
    }
}

/// Uniform random choice from a seeded RNG. Reseeded per iteration from
/// the base seed so any iteration can be replayed in isolation.
pub struct RandomStrategy {
    seed: u64,
    rng: StdRng,
}

impl RandomStrategy {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl SchedulingStrategy for RandomStrategy {
    fn initialize_next_iteration(&mut self, iteration: u32) {
        self.rng = StdRng::seed_from_u64(self.seed.wrapping_add(iteration as u64));
    }

    fn next(
        &mut self,
        enabled: &[OperationId],
        _context: &StrategyContext<'_>,
    ) -> Option<OperationId> {
        if enabled.is_empty() {
            return None;
        }
        let pick = self.rng.gen_range(0..enabled.len());
        Some(enabled[pick])
    }

    fn description(&self) -> String {
        format!("random(seed={})", self.seed)
    }
}

/// Coverage-guided choice: prefers the operation whose least-frequent call
/// site has been recorded the fewest times this iteration, breaking ties
/// with the seeded RNG. Operations with no recorded node rank first.
pub struct CoverageStrategy {
    seed: u64,
    rng: StdRng,
}

impl CoverageStrategy {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn rank(&self, id: OperationId, graph: &ExecutionGraph) -> u64 {
        graph
            .lowest_call_site_frequency_for_operation(id)
            .map(|site| graph.call_site_frequency(id, site))
            .unwrap_or(0)
    }
}

impl SchedulingStrategy for CoverageStrategy {
    fn initialize_next_iteration(&mut self, iteration: u32) {
        self.rng = StdRng::seed_from_u64(self.seed.wrapping_add(iteration as u64));
    }

    fn next(
        &mut self,
        enabled: &[OperationId],
        context: &StrategyContext<'_>,
    ) -> Option<OperationId> {
        if enabled.is_empty() {
            return None;
        }
        let best = enabled
            .iter()
            .map(|&id| self.rank(id, context.graph))
            .min()
            .unwrap_or(0);
        let candidates: Vec<OperationId> = enabled
            .iter()
            .copied()
            .filter(|&id| self.rank(id, context.graph) == best)
            .collect();
        let pick = self.rng.gen_range(0..candidates.len());
        Some(candidates[pick])
    }

    fn description(&self) -> String {
        format!("coverage(seed={})", self.seed)
    }
}

type StrategyFactory = dyn Fn(u64) -> Box<dyn SchedulingStrategy> + Send + Sync;

/// Registry of strategy factories keyed by kind name. The runtime and the
/// CLI build strategies through this so external plug-ins can register
/// their own kinds.
pub struct StrategyRegistry {
    factories: RwLock<HashMap<String, Arc<StrategyFactory>>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn(u64) -> Box<dyn SchedulingStrategy> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .expect("strategy registry lock poisoned")
            .insert(name.to_string(), Arc::new(factory));
    }

    /// Build a strategy by kind name, or None when unregistered.
    pub fn create(&self, name: &str, seed: u64) -> Option<Box<dyn SchedulingStrategy>> {
        let factories = self
            .factories
            .read()
            .expect("strategy registry lock poisoned");
        factories.get(name).map(|f| f(seed))
    }

    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .expect("strategy registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide strategy registry used by the CLI and test hosts.
pub static GLOBAL_STRATEGY_REGISTRY: Lazy<StrategyRegistry> = Lazy::new(StrategyRegistry::new);

/// Register the built-in strategies into the global registry. Safe to call
/// more than once.
pub fn register_defaults_to_global() {
    GLOBAL_STRATEGY_REGISTRY.register(StrategyKind::Random.as_str(), |seed| {
        Box::new(RandomStrategy::new(seed))
    });
    GLOBAL_STRATEGY_REGISTRY.register(StrategyKind::Coverage.as_str(), |seed| {
        Box::new(CoverageStrategy::new(seed))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_strategy_is_deterministic_per_seed() {
        let graph = ExecutionGraph::new();
        let context = StrategyContext {
            iteration: 0,
            step: 0,
            graph: &graph,
        };
        let enabled = [0u64, 1, 2, 3];

        let mut a = RandomStrategy::new(7);
        let mut b = RandomStrategy::new(7);
        let picks_a: Vec<_> = (0..16).map(|_| a.next(&enabled, &context).unwrap()).collect();
        let picks_b: Vec<_> = (0..16).map(|_| b.next(&enabled, &context).unwrap()).collect();
        assert_eq!(picks_a, picks_b);
        assert!(picks_a.iter().all(|id| enabled.contains(id)));
    }

    #[test]
    fn test_random_strategy_empty_set() {
        let graph = ExecutionGraph::new();
        let context = StrategyContext {
            iteration: 0,
            step: 0,
            graph: &graph,
        };
        let mut strategy = RandomStrategy::new(1);
        assert_eq!(strategy.next(&[], &context), None);
    }

    #[test]
    fn test_coverage_strategy_prefers_least_covered_operation() {
        use crate::operation::{ControlledOperation, NO_PARENT};
        use crate::scheduling::SchedulingPointType;

        let mut graph = ExecutionGraph::new();
        let mut hot = ControlledOperation::new(0, NO_PARENT, 0);
        for _ in 0..3 {
            hot.record_scheduling_point(
                SchedulingPointType::Default,
                None,
                None,
                "Worker::hot".to_string(),
                0,
            );
            graph.add(&hot).unwrap();
        }
        let mut cold = ControlledOperation::new(1, 0, 1);
        cold.record_scheduling_point(
            SchedulingPointType::Default,
            None,
            None,
            "Worker::cold".to_string(),
            0,
        );
        graph.add(&cold).unwrap();

        let context = StrategyContext {
            iteration: 0,
            step: 4,
            graph: &graph,
        };
        let mut strategy = CoverageStrategy::new(9);
        // Only one candidate has the minimal rank, so the pick is forced.
        assert_eq!(strategy.next(&[0, 1], &context), Some(1));
    }

    #[test]
    fn test_strategy_kind_parsing() {
        assert_eq!("random".parse::<StrategyKind>().unwrap(), StrategyKind::Random);
        assert_eq!(
            "Coverage".parse::<StrategyKind>().unwrap(),
            StrategyKind::Coverage
        );
        assert!("pct".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn test_registry_builds_registered_strategies() {
        register_defaults_to_global();
        let strategy = GLOBAL_STRATEGY_REGISTRY.create("random", 42).unwrap();
        assert!(strategy.description().contains("random"));
        assert!(GLOBAL_STRATEGY_REGISTRY.create("missing", 0).is_none());

        let names = GLOBAL_STRATEGY_REGISTRY.registered_names();
        assert!(names.contains(&"random".to_string()));
        assert!(names.contains(&"coverage".to_string()));
    }
}
