//! Execution graph recorder.
//!
//! An append-only DAG over operations and call sites, rebuilt every
//! iteration. Each `add` call turns the call sites an operation visited
//! since its previous scheduling point into a burst of nodes, wires the
//! burst into the causal structure (creation, invocation and step edges)
//! and feeds the persistent coverage map. Nodes live in a flat arena and
//! refer to each other by index, so the graph owns no cyclic references
//! and serializes as-is.

use crate::error::SchedulerError;
use crate::operation::{ControlledOperation, OperationId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Index of a node in the graph arena; doubles as the total order of
/// scheduling events within an iteration.
pub type NodeIndex = u32;

/// Call site recorded for the root operation before user code visited any.
pub const ROOT_CALL_SITE: &str = "Test";

/// Causal category of an edge.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeCategory {
    /// From the spawner's last node to the first node of a new operation.
    Creation,
    /// Between consecutive nodes of one operation within a single burst.
    Invocation,
    /// From an operation's previous last node to its next burst.
    Step,
}

/// A directed edge between two arena nodes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub source: NodeIndex,
    pub target: NodeIndex,
    pub category: EdgeCategory,
}

/// One recorded scheduling event of an operation at a call site.
///
/// `in_edge` is advisory (last writer wins); causal reconstruction should
/// use `out_edges`, which are authoritative.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Node {
    pub index: NodeIndex,
    pub operation: OperationId,
    pub sequence_id: u64,
    pub call_site: String,
    pub hashed_program_state: i32,
    pub in_edge: Option<Edge>,
    pub out_edges: Vec<Edge>,
}

/// The execution graph of one iteration plus the coverage knowledge that
/// survives across iterations.
#[derive(Debug, Default)]
pub struct ExecutionGraph {
    nodes: Vec<Node>,
    first_node_for_op: HashMap<OperationId, NodeIndex>,
    last_node_for_op: HashMap<OperationId, NodeIndex>,
    last_visited_call_site_index: HashMap<OperationId, usize>,
    call_site_frequencies: HashMap<OperationId, HashMap<String, u64>>,
    coverage_map: HashMap<String, HashSet<String>>,
}

impl ExecutionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the scheduling point `op` just reached.
    ///
    /// Produces one node per call site visited since the previous `add` for
    /// this operation, connected in visitation order by invocation edges.
    /// When nothing new was visited a single node is synthesized from the
    /// most recent call site, the root sentinel, or the parent's last node.
    /// The burst is then attached to the prior graph with a creation edge
    /// (first sighting) or a step edge.
    pub fn add(&mut self, op: &ControlledOperation) -> Result<(), SchedulerError> {
        let consumed = self
            .last_visited_call_site_index
            .get(&op.id())
            .copied()
            .unwrap_or(0);
        let fresh = &op.visited_call_sites()[consumed..];

        let known = self.last_node_for_op.contains_key(&op.id());
        // Resolve the attachment before appending so the source is the
        // prior last node, not a burst member.
        let attach = if self.nodes.is_empty() {
            None
        } else if known {
            Some((self.last_node_for_op[&op.id()], EdgeCategory::Step))
        } else {
            let parent_last = self.parent_last_node(op)?;
            Some((parent_last, EdgeCategory::Creation))
        };

        let first_new = self.nodes.len() as NodeIndex;
        if fresh.is_empty() {
            let call_site = match op.visited_call_sites().last() {
                Some(site) => site.clone(),
                None if op.is_root() => ROOT_CALL_SITE.to_string(),
                None => {
                    let parent_last = self.parent_last_node(op)?;
                    self.nodes[parent_last as usize].call_site.clone()
                }
            };
            self.push_node(op, call_site);
        } else {
            for site in fresh {
                self.push_node(op, site.clone());
            }
            for offset in 1..fresh.len() as NodeIndex {
                self.add_edge(
                    first_new + offset - 1,
                    first_new + offset,
                    EdgeCategory::Invocation,
                );
            }
        }
        let last_new = (self.nodes.len() - 1) as NodeIndex;

        if let Some((source, category)) = attach {
            self.add_edge(source, first_new, category);
        }

        if !known {
            self.first_node_for_op.insert(op.id(), first_new);
        }
        self.last_node_for_op.insert(op.id(), last_new);

        let frequencies = self.call_site_frequencies.entry(op.id()).or_default();
        if !fresh.is_empty() {
            self.last_visited_call_site_index
                .insert(op.id(), op.visited_call_sites().len());
            for site in fresh {
                *frequencies.entry(site.clone()).or_insert(0) += 1;
            }
        }

        log::trace!(
            "graph: op {} burst [{}..={}] ({} nodes, {} fresh call sites)",
            op.id(),
            first_new,
            last_new,
            last_new - first_new + 1,
            fresh.len()
        );
        Ok(())
    }

    fn parent_last_node(&self, op: &ControlledOperation) -> Result<NodeIndex, SchedulerError> {
        self.last_node_for_op
            .get(&op.parent_id())
            .copied()
            .ok_or(SchedulerError::MissingParentNode {
                child: op.id(),
                parent: op.parent_id(),
            })
    }

    fn push_node(&mut self, op: &ControlledOperation, call_site: String) {
        let index = self.nodes.len() as NodeIndex;
        self.nodes.push(Node {
            index,
            operation: op.id(),
            sequence_id: op.sequence_id(),
            call_site,
            hashed_program_state: op.last_hashed_program_state(),
            in_edge: None,
            out_edges: Vec::new(),
        });
    }

    fn add_edge(&mut self, source: NodeIndex, target: NodeIndex, category: EdgeCategory) {
        let edge = Edge {
            source,
            target,
            category,
        };
        self.nodes[source as usize].out_edges.push(edge);
        self.nodes[target as usize].in_edge = Some(edge);

        let source_site = &self.nodes[source as usize].call_site;
        let target_site = &self.nodes[target as usize].call_site;
        let covered = matches!(category, EdgeCategory::Creation | EdgeCategory::Invocation)
            || source_site != target_site;
        if covered {
            let (source_site, target_site) = (source_site.clone(), target_site.clone());
            self.coverage_map
                .entry(source_site)
                .or_default()
                .insert(target_site);
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, index: NodeIndex) -> Option<&Node> {
        self.nodes.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of edges in the graph, counted over the authoritative
    /// out-edge lists.
    pub fn edge_count(&self) -> usize {
        self.nodes.iter().map(|n| n.out_edges.len()).sum()
    }

    pub fn first_node_for_op(&self, op: OperationId) -> Option<&Node> {
        self.first_node_for_op
            .get(&op)
            .map(|&i| &self.nodes[i as usize])
    }

    pub fn last_node_for_op(&self, op: OperationId) -> Option<&Node> {
        self.last_node_for_op
            .get(&op)
            .map(|&i| &self.nodes[i as usize])
    }

    /// How often `call_site` appeared in this operation's bursts this
    /// iteration; 0 when never recorded.
    pub fn call_site_frequency(&self, op: OperationId, call_site: &str) -> u64 {
        self.call_site_frequencies
            .get(&op)
            .and_then(|m| m.get(call_site))
            .copied()
            .unwrap_or(0)
    }

    /// The least frequently recorded call site of an operation. Ties break
    /// to the lexicographically smallest call site.
    pub fn lowest_call_site_frequency_for_operation(&self, op: OperationId) -> Option<&str> {
        self.call_site_frequencies.get(&op).and_then(|m| {
            m.iter()
                .min_by(|(site_a, count_a), (site_b, count_b)| {
                    count_a.cmp(count_b).then_with(|| site_a.cmp(site_b))
                })
                .map(|(site, _)| site.as_str())
        })
    }

    /// The most frequently recorded call site of an operation. Ties break
    /// to the lexicographically smallest call site.
    pub fn highest_call_site_frequency_for_operation(&self, op: OperationId) -> Option<&str> {
        self.call_site_frequencies.get(&op).and_then(|m| {
            m.iter()
                .max_by(|(site_a, count_a), (site_b, count_b)| {
                    count_a.cmp(count_b).then_with(|| site_b.cmp(site_a))
                })
                .map(|(site, _)| site.as_str())
        })
    }

    /// The call-site transition relation accumulated across all iterations.
    pub fn coverage_map(&self) -> &HashMap<String, HashSet<String>> {
        &self.coverage_map
    }

    /// True when the transition `from -> to` has been exercised.
    pub fn covers(&self, from: &str, to: &str) -> bool {
        self.coverage_map
            .get(from)
            .map(|succ| succ.contains(to))
            .unwrap_or(false)
    }

    /// Per-operation call-site frequencies of the current iteration.
    pub fn call_site_frequencies(&self) -> &HashMap<OperationId, HashMap<String, u64>> {
        &self.call_site_frequencies
    }

    /// Reset all per-iteration state. The coverage map persists for the
    /// lifetime of the test run.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.first_node_for_op.clear();
        self.last_node_for_op.clear();
        self.last_visited_call_site_index.clear();
        self.call_site_frequencies.clear();
    }
}
