//! Run reports and coverage export.
//!
//! Read-only snapshots of what a run explored, taken under driver
//! quiescence, plus helpers that write them as JSON artifacts into a
//! per-run directory.

use crate::error::IterationOutcome;
use crate::graph::ExecutionGraph;
use crate::operation::OperationId;
use crate::runtime::{Configuration, ScheduleStep};
use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Outcome of one iteration plus the schedule that produced it. The trace
/// is only retained for iterations that found a bug.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IterationReport {
    pub iteration: u32,
    pub outcome: IterationOutcome,
    pub steps: u32,
    pub trace: Vec<ScheduleStep>,
}

impl IterationReport {
    pub fn new(
        iteration: u32,
        outcome: IterationOutcome,
        steps: u32,
        trace: Vec<ScheduleStep>,
    ) -> Self {
        let trace = if outcome.is_bug() { trace } else { Vec::new() };
        Self {
            iteration,
            outcome,
            steps,
            trace,
        }
    }
}

/// Snapshot of the coverage state at the end of a run. Maps are sorted so
/// the serialized artifact is stable across runs with equal coverage.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CoverageReport {
    /// Call-site transition relation accumulated across all iterations.
    pub transitions: BTreeMap<String, Vec<String>>,
    /// Per-operation call-site frequencies of the final iteration.
    pub call_site_frequencies: BTreeMap<OperationId, BTreeMap<String, u64>>,
    /// Node count of the final iteration's execution graph.
    pub node_count: usize,
    /// Edge count of the final iteration's execution graph.
    pub edge_count: usize,
}

impl CoverageReport {
    pub fn from_graph(graph: &ExecutionGraph) -> Self {
        let transitions = graph
            .coverage_map()
            .iter()
            .map(|(from, to)| {
                let mut successors: Vec<String> = to.iter().cloned().collect();
                successors.sort();
                (from.clone(), successors)
            })
            .collect();
        let call_site_frequencies = graph
            .call_site_frequencies()
            .iter()
            .map(|(&op, sites)| {
                (
                    op,
                    sites.iter().map(|(s, &c)| (s.clone(), c)).collect(),
                )
            })
            .collect();
        Self {
            transitions,
            call_site_frequencies,
            node_count: graph.len(),
            edge_count: graph.edge_count(),
        }
    }

    /// Number of distinct call-site transitions exercised.
    pub fn transition_count(&self) -> usize {
        self.transitions.values().map(|succ| succ.len()).sum()
    }
}

/// Everything a run produced: configuration echo, per-iteration outcomes
/// and the final coverage snapshot.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub created_at: String,
    pub seed: u64,
    pub strategy: String,
    pub iterations: Vec<IterationReport>,
    pub coverage: CoverageReport,
}

impl RunReport {
    pub fn new(
        config: &Configuration,
        strategy: String,
        iterations: Vec<IterationReport>,
        graph: &ExecutionGraph,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            created_at: Utc::now().to_rfc3339(),
            seed: config.seed,
            strategy,
            iterations,
            coverage: CoverageReport::from_graph(graph),
        }
    }

    /// Iterations that ended in a bug (panic or deadlock).
    pub fn bug_count(&self) -> usize {
        self.iterations
            .iter()
            .filter(|it| it.outcome.is_bug())
            .count()
    }

    /// First bug iteration, if any.
    pub fn first_bug(&self) -> Option<&IterationReport> {
        self.iterations.iter().find(|it| it.outcome.is_bug())
    }

    /// Write `report.json` and `coverage.json` into a fresh
    /// `weave_run_<id>` directory under `base_dir`. Returns the directory.
    pub fn write_artifacts(&self, base_dir: &Path) -> Result<PathBuf> {
        let out_dir = base_dir.join(format!("weave_run_{}", self.run_id));
        fs::create_dir_all(&out_dir)?;

        let report_path = out_dir.join("report.json");
        fs::write(&report_path, serde_json::to_string_pretty(self)?)?;

        let coverage_path = out_dir.join("coverage.json");
        fs::write(&coverage_path, serde_json::to_string_pretty(&self.coverage)?)?;

        log::info!("run artifacts written to {}", out_dir.display());
        Ok(out_dir)
    }
}
