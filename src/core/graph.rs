//! Task dependency graph

use crate::core::error::{PipelineError, Result};
use crate::core::pipeline::TaskSpec;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, VecDeque};

/// Why an edge exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Declared with `runAfter`
    RunAfter,
    /// Implied by a `$(tasks.X.results.Y)` reference
    ResultData,
}

/// Directed acyclic graph of tasks; edges point from predecessor to successor
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<String, EdgeKind>,
    index: HashMap<String, NodeIndex>,
    order: Vec<String>,
}

impl DependencyGraph {
    /// Build the graph and verify it is acyclic
    pub fn build(tasks: &[TaskSpec]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for task in tasks {
            if index.contains_key(&task.name) {
                return Err(PipelineError::DuplicateTask(task.name.clone()));
            }
            let idx = graph.add_node(task.name.clone());
            index.insert(task.name.clone(), idx);
        }

        for task in tasks {
            let to = index[&task.name];

            let run_after = task
                .run_after
                .iter()
                .map(|p| (p.clone(), EdgeKind::RunAfter));
            let data = task
                .result_dependencies()
                .into_iter()
                .map(|(p, _)| (p, EdgeKind::ResultData));

            for (predecessor, kind) in run_after.chain(data) {
                let from = *index.get(&predecessor).ok_or_else(|| {
                    PipelineError::UnknownPredecessor {
                        task: task.name.clone(),
                        predecessor: predecessor.clone(),
                    }
                })?;
                if graph.find_edge(from, to).is_none() {
                    graph.add_edge(from, to, kind);
                }
            }
        }

        let order = Self::topological_order(&graph)?;

        Ok(Self {
            graph,
            index,
            order,
        })
    }

    /// Kahn's algorithm; ties are broken by declaration order.
    /// Nodes left unvisited are on (or behind) a cycle.
    fn topological_order(graph: &DiGraph<String, EdgeKind>) -> Result<Vec<String>> {
        let mut in_degree: Vec<usize> = graph
            .node_indices()
            .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();

        let mut queue: VecDeque<NodeIndex> = graph
            .node_indices()
            .filter(|n| in_degree[n.index()] == 0)
            .collect();

        let mut order = Vec::with_capacity(graph.node_count());
        while let Some(node) = queue.pop_front() {
            order.push(graph[node].clone());

            let mut successors: Vec<NodeIndex> =
                graph.neighbors_directed(node, Direction::Outgoing).collect();
            successors.sort();
            for succ in successors {
                in_degree[succ.index()] -= 1;
                if in_degree[succ.index()] == 0 {
                    queue.push_back(succ);
                }
            }
        }

        if order.len() < graph.node_count() {
            let tasks = graph
                .node_indices()
                .filter(|n| in_degree[n.index()] > 0)
                .map(|n| graph[n].clone())
                .collect();
            return Err(PipelineError::CycleDetected { tasks });
        }

        Ok(order)
    }

    /// Task names in a valid execution order
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn contains(&self, task: &str) -> bool {
        self.index.contains_key(task)
    }

    /// Direct predecessors of `task`, in declaration order
    pub fn predecessors(&self, task: &str) -> Vec<&str> {
        self.neighbors(task, Direction::Incoming)
    }

    /// Direct successors of `task`, in declaration order
    pub fn successors(&self, task: &str) -> Vec<&str> {
        self.neighbors(task, Direction::Outgoing)
    }

    fn neighbors(&self, task: &str, direction: Direction) -> Vec<&str> {
        let Some(&idx) = self.index.get(task) else {
            return Vec::new();
        };
        let mut nodes: Vec<NodeIndex> = self.graph.neighbors_directed(idx, direction).collect();
        nodes.sort();
        nodes.into_iter().map(|n| self.graph[n].as_str()).collect()
    }

    /// How `from` relates to `to`, if they are directly connected
    pub fn edge_kind(&self, from: &str, to: &str) -> Option<EdgeKind> {
        let from = *self.index.get(from)?;
        let to = *self.index.get(to)?;
        self.graph
            .find_edge(from, to)
            .and_then(|e| self.graph.edge_weight(e))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}
