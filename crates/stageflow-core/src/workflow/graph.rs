//! Stage dependency graph: cycle detection and batch computation.
//!
//! Stages live in a flat `petgraph::DiGraph` with edges pointing from a
//! dependency to its dependent. Batches are computed with iterative Kahn
//! leveling: batch 0 holds the zero-indegree stages, batch *n* the stages
//! whose dependencies all sit in earlier batches. Stages left unassigned
//! after leveling participate in (or hang off) a cycle.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use stageflow_types::workflow::StageDefinition;

use super::loader::SchemaError;

// ---------------------------------------------------------------------------
// StageGraph
// ---------------------------------------------------------------------------

/// Adjacency structure over a workflow's stages.
#[derive(Debug)]
pub struct StageGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl StageGraph {
    /// Build the graph from stage definitions.
    ///
    /// Fails with `UnknownDependency` when a `depends_on` entry references a
    /// stage id that does not exist.
    pub fn build(stages: &[StageDefinition]) -> Result<Self, SchemaError> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for stage in stages {
            let node = graph.add_node(stage.id.clone());
            index.insert(stage.id.clone(), node);
        }
        for stage in stages {
            let to = index[&stage.id];
            for dep in &stage.depends_on {
                let from = index
                    .get(dep.as_str())
                    .ok_or_else(|| SchemaError::UnknownDependency {
                        stage: stage.id.clone(),
                        dependency: dep.clone(),
                    })?;
                graph.add_edge(*from, to, ());
            }
        }
        Ok(Self { graph, index })
    }

    /// Compute execution batches via iterative Kahn leveling.
    ///
    /// All stages in one batch are mutually independent. Document order is
    /// preserved within a batch. Fails with `CircularDependency` naming every
    /// stage on a cycle.
    pub fn batches(&self) -> Result<Vec<Vec<String>>, SchemaError> {
        let mut indegree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| {
                (
                    n,
                    self.graph.neighbors_directed(n, Direction::Incoming).count(),
                )
            })
            .collect();

        let mut frontier: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|n| indegree[n] == 0)
            .collect();

        let mut assigned: HashSet<NodeIndex> = HashSet::new();
        let mut batches = Vec::new();

        while !frontier.is_empty() {
            // Node indices follow document order, so sorting keeps batches stable.
            frontier.sort();
            let mut next = Vec::new();
            let mut batch = Vec::with_capacity(frontier.len());
            for &node in &frontier {
                batch.push(self.graph[node].clone());
                assigned.insert(node);
                for succ in self.graph.neighbors_directed(node, Direction::Outgoing) {
                    if let Some(remaining) = indegree.get_mut(&succ) {
                        *remaining -= 1;
                        if *remaining == 0 {
                            next.push(succ);
                        }
                    }
                }
            }
            batches.push(batch);
            frontier = next;
        }

        if assigned.len() != self.graph.node_count() {
            let leftover: HashSet<NodeIndex> = self
                .graph
                .node_indices()
                .filter(|n| !assigned.contains(n))
                .collect();
            let mut members: Vec<String> = self
                .cycle_members(&leftover)
                .into_iter()
                .map(|n| self.graph[n].clone())
                .collect();
            members.sort();
            return Err(SchemaError::CircularDependency { members });
        }

        Ok(batches)
    }

    /// Narrow the unassigned leftover down to the stages actually on a cycle.
    ///
    /// Stages that merely depend on a cycle are trapped but not part of it;
    /// peeling leftover nodes with no leftover successors strips them away.
    fn cycle_members(&self, leftover: &HashSet<NodeIndex>) -> Vec<NodeIndex> {
        let mut outdegree: HashMap<NodeIndex, usize> = leftover
            .iter()
            .map(|&n| {
                (
                    n,
                    self.graph
                        .neighbors_directed(n, Direction::Outgoing)
                        .filter(|s| leftover.contains(s))
                        .count(),
                )
            })
            .collect();

        let mut queue: VecDeque<NodeIndex> = outdegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut peeled: HashSet<NodeIndex> = HashSet::new();

        while let Some(node) = queue.pop_front() {
            peeled.insert(node);
            for pred in self.graph.neighbors_directed(node, Direction::Incoming) {
                if !leftover.contains(&pred) || peeled.contains(&pred) {
                    continue;
                }
                if let Some(remaining) = outdegree.get_mut(&pred) {
                    *remaining -= 1;
                    if *remaining == 0 {
                        queue.push_back(pred);
                    }
                }
            }
        }

        leftover
            .iter()
            .filter(|n| !peeled.contains(n))
            .copied()
            .collect()
    }

    /// Transitive dependents of a stage (BFS over outgoing edges).
    pub fn downstream_of(&self, id: &str) -> HashSet<String> {
        let mut result = HashSet::new();
        let Some(&start) = self.index.get(id) else {
            return result;
        };
        let mut queue = VecDeque::from([start]);
        let mut visited = HashSet::from([start]);
        while let Some(node) = queue.pop_front() {
            for succ in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if visited.insert(succ) {
                    result.insert(self.graph[succ].clone());
                    queue.push_back(succ);
                }
            }
        }
        result
    }

    /// Direct dependencies of a stage.
    pub fn dependencies_of(&self, id: &str) -> Vec<String> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(node, Direction::Incoming)
            .map(|n| self.graph[n].clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
