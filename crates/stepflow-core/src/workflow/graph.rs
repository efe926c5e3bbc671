//! Execution graph construction.
//!
//! Turns an ordered step list plus an optional `ParallelExecutionConfig` into a
//! `petgraph` DAG. Two shapes exist: a plain chain, or a chain with one
//! contiguous fork-join block. A parallel group that starts at the first step
//! hangs off a virtual `Start` node. Every graph ends in a single `End` node.

use std::collections::BTreeSet;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use stepflow_types::step::{ParallelExecutionConfig, StepDescriptor};
use thiserror::Error;

const START_LABEL: &str = "START";
const END_LABEL: &str = "END";

// ---------------------------------------------------------------------------
// Nodes and errors
// ---------------------------------------------------------------------------

/// A vertex of the execution graph.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphNode {
    /// Virtual entry feeding a parallel group that begins at index 0.
    Start,
    Step(StepDescriptor),
    /// Terminal sink.
    End,
}

impl GraphNode {
    pub fn label(&self) -> &str {
        match self {
            GraphNode::Start => START_LABEL,
            GraphNode::Step(step) => &step.id,
            GraphNode::End => END_LABEL,
        }
    }

    pub fn as_step(&self) -> Option<&StepDescriptor> {
        match self {
            GraphNode::Step(step) => Some(step),
            _ => None,
        }
    }
}

/// Why a parallel config could not be honoured.
///
/// Never returned to callers: the builder logs it and degrades to a
/// sequential graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphConstructionError {
    #[error("parallel step '{0}' is not part of the workflow")]
    UnknownParallelStep(String),

    #[error("parallel steps must be contiguous in declaration order")]
    NonContiguousParallelGroup,

    #[error("parallel group is enabled but names no steps")]
    EmptyParallelGroup,
}

/// Which shape the builder produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphMode {
    Sequential,
    ForkJoin {
        /// Step the branches hang off; `None` when the virtual `Start` is used.
        fork: Option<String>,
        branches: Vec<String>,
        /// Step waiting on every branch; `None` when the group ends the workflow.
        join: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// A built execution graph.
#[derive(Debug, Clone)]
pub struct Graph {
    inner: DiGraph<GraphNode, ()>,
    entry: NodeIndex,
    end: NodeIndex,
    mode: GraphMode,
}

impl Graph {
    /// The node execution starts from. `End` for an empty workflow.
    pub fn entry(&self) -> NodeIndex {
        self.entry
    }

    pub fn end(&self) -> NodeIndex {
        self.end
    }

    pub fn mode(&self) -> &GraphMode {
        &self.mode
    }

    pub fn node(&self, idx: NodeIndex) -> &GraphNode {
        &self.inner[idx]
    }

    pub fn step(&self, idx: NodeIndex) -> Option<&StepDescriptor> {
        self.inner[idx].as_step()
    }

    /// Look up the node of a step by ID.
    pub fn find(&self, step_id: &str) -> Option<NodeIndex> {
        self.inner
            .node_indices()
            .find(|&idx| self.inner[idx].as_step().is_some_and(|s| s.id == step_id))
    }

    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.inner.node_indices()
    }

    /// Direct predecessors, in insertion order.
    pub fn predecessors(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.neighbors(idx, Direction::Incoming)
    }

    /// Direct successors, in insertion order.
    pub fn successors(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.neighbors(idx, Direction::Outgoing)
    }

    fn neighbors(&self, idx: NodeIndex, dir: Direction) -> Vec<NodeIndex> {
        let mut out: Vec<NodeIndex> = self.inner.neighbors_directed(idx, dir).collect();
        out.sort();
        out
    }

    /// All edges as `(from, to)` labels, using `START` / `END` for the virtual nodes.
    pub fn edges(&self) -> Vec<(String, String)> {
        self.inner
            .raw_edges()
            .iter()
            .map(|e| {
                (
                    self.inner[e.source()].label().to_string(),
                    self.inner[e.target()].label().to_string(),
                )
            })
            .collect()
    }

    /// Number of real (non-virtual) step nodes.
    pub fn step_count(&self) -> usize {
        self.inner
            .node_weights()
            .filter(|n| matches!(n, GraphNode::Step(_)))
            .count()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct GraphBuilder;

impl GraphBuilder {
    /// Build the execution graph for `steps`.
    ///
    /// An absent or disabled parallel config, or one naming a single step,
    /// yields the sequential chain. An unusable config is logged and also
    /// yields the sequential chain.
    pub fn build(steps: &[StepDescriptor], parallel: Option<&ParallelExecutionConfig>) -> Graph {
        let Some(parallel) = parallel.filter(|p| p.enabled) else {
            return Self::sequential(steps);
        };

        match Self::resolve_group(steps, parallel) {
            Ok((lo, hi)) if lo == hi => {
                tracing::debug!(step_id = %steps[lo].id, "single-step parallel group, building chain");
                Self::sequential(steps)
            }
            Ok((lo, hi)) => Self::fork_join(steps, lo, hi),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring parallel config, falling back to sequential");
                Self::sequential(steps)
            }
        }
    }

    /// Resolve the group to an inclusive index range of `steps`.
    fn resolve_group(
        steps: &[StepDescriptor],
        parallel: &ParallelExecutionConfig,
    ) -> Result<(usize, usize), GraphConstructionError> {
        let mut indices = BTreeSet::new();
        for id in &parallel.steps {
            let idx = steps
                .iter()
                .position(|s| &s.id == id)
                .ok_or_else(|| GraphConstructionError::UnknownParallelStep(id.clone()))?;
            indices.insert(idx);
        }

        let (Some(&lo), Some(&hi)) = (indices.first(), indices.last()) else {
            return Err(GraphConstructionError::EmptyParallelGroup);
        };
        if hi - lo + 1 != indices.len() {
            return Err(GraphConstructionError::NonContiguousParallelGroup);
        }
        Ok((lo, hi))
    }

    fn sequential(steps: &[StepDescriptor]) -> Graph {
        let mut inner = DiGraph::new();
        let nodes: Vec<NodeIndex> = steps
            .iter()
            .map(|s| inner.add_node(GraphNode::Step(s.clone())))
            .collect();
        let end = inner.add_node(GraphNode::End);

        for pair in nodes.windows(2) {
            inner.add_edge(pair[0], pair[1], ());
        }
        if let Some(&last) = nodes.last() {
            inner.add_edge(last, end, ());
        }

        Graph {
            entry: nodes.first().copied().unwrap_or(end),
            inner,
            end,
            mode: GraphMode::Sequential,
        }
    }

    fn fork_join(steps: &[StepDescriptor], lo: usize, hi: usize) -> Graph {
        let mut inner = DiGraph::new();
        let start = (lo == 0).then(|| inner.add_node(GraphNode::Start));
        let nodes: Vec<NodeIndex> = steps
            .iter()
            .map(|s| inner.add_node(GraphNode::Step(s.clone())))
            .collect();
        let end = inner.add_node(GraphNode::End);

        // Chain up to and including the fork.
        for i in 1..lo {
            inner.add_edge(nodes[i - 1], nodes[i], ());
        }
        let fork = match start {
            Some(start) => start,
            None => nodes[lo - 1],
        };
        let join = nodes.get(hi + 1).copied().unwrap_or(end);

        for &branch in &nodes[lo..=hi] {
            inner.add_edge(fork, branch, ());
        }
        for &branch in &nodes[lo..=hi] {
            inner.add_edge(branch, join, ());
        }

        // Chain after the join.
        if hi + 1 < nodes.len() {
            for i in hi + 2..nodes.len() {
                inner.add_edge(nodes[i - 1], nodes[i], ());
            }
            inner.add_edge(nodes[nodes.len() - 1], end, ());
        }

        let mode = GraphMode::ForkJoin {
            fork: lo.checked_sub(1).map(|i| steps[i].id.clone()),
            branches: steps[lo..=hi].iter().map(|s| s.id.clone()).collect(),
            join: steps.get(hi + 1).map(|s| s.id.clone()),
        };

        Graph {
            entry: start.unwrap_or(nodes[0]),
            inner,
            end,
            mode,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
