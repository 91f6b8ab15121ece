use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::stable_graph::{NodeIndex, StableDiGraph};

use crate::definition::WorkflowDefinition;
use crate::error::{GraphValidationKind, WorkflowError};

/// Validated dependency graph for one workflow definition.
///
/// Edges point from a dependency to its dependents, so `Outgoing` neighbors
/// are the tasks unblocked by a completion.
#[derive(Debug)]
pub struct TaskGraph {
    graph: StableDiGraph<String, ()>,
    index_map: HashMap<String, NodeIndex>,
    topo_order: Vec<String>,
}

/// Build and validate the dependency graph of a definition.
///
/// Fails with a [`WorkflowError::GraphValidation`] on duplicate task ids,
/// `depends_on` references that resolve to no task, or cycles. Acyclicity is
/// established here once and never re-checked at runtime.
pub fn build_graph(definition: &WorkflowDefinition) -> Result<TaskGraph, WorkflowError> {
    let mut graph = StableDiGraph::new();
    let mut index_map: HashMap<String, NodeIndex> = HashMap::new();

    for task in &definition.tasks {
        if index_map.contains_key(&task.id) {
            return Err(WorkflowError::GraphValidation {
                kind: GraphValidationKind::DuplicateTaskId,
                detail: task.id.clone(),
            });
        }
        let idx = graph.add_node(task.id.clone());
        index_map.insert(task.id.clone(), idx);
    }

    for task in &definition.tasks {
        let target = index_map[&task.id];
        for dep in &task.depends_on {
            let source = index_map.get(dep).ok_or_else(|| WorkflowError::GraphValidation {
                kind: GraphValidationKind::DanglingReference,
                detail: format!("task '{}' depends on unknown task '{}'", task.id, dep),
            })?;
            graph.add_edge(*source, target, ());
        }
    }

    let topo_order = kahn_order(&graph)?;

    Ok(TaskGraph {
        graph,
        index_map,
        topo_order,
    })
}

/// Kahn's algorithm: yields a topological ordering or reports the cycle.
fn kahn_order(graph: &StableDiGraph<String, ()>) -> Result<Vec<String>, WorkflowError> {
    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|idx| {
            (
                idx,
                graph
                    .neighbors_directed(idx, petgraph::Direction::Incoming)
                    .count(),
            )
        })
        .collect();

    let mut queue: VecDeque<NodeIndex> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(idx, _)| *idx)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(idx) = queue.pop_front() {
        if let Some(id) = graph.node_weight(idx) {
            order.push(id.clone());
        }
        for next in graph.neighbors_directed(idx, petgraph::Direction::Outgoing) {
            if let Some(deg) = in_degree.get_mut(&next) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    if order.len() < graph.node_count() {
        let stuck: Vec<String> = graph
            .node_indices()
            .filter(|idx| in_degree.get(idx).copied().unwrap_or(0) > 0)
            .filter_map(|idx| graph.node_weight(idx).cloned())
            .collect();
        return Err(WorkflowError::GraphValidation {
            kind: GraphValidationKind::Cycle,
            detail: format!("tasks in cycle: {}", stuck.join(", ")),
        });
    }

    Ok(order)
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Topological ordering computed at build time.
    pub fn topological_order(&self) -> &[String] {
        &self.topo_order
    }

    /// Direct dependencies of a task.
    pub fn dependencies(&self, task_id: &str) -> Vec<String> {
        self.neighbors(task_id, petgraph::Direction::Incoming)
    }

    /// Direct dependents of a task.
    pub fn dependents(&self, task_id: &str) -> Vec<String> {
        self.neighbors(task_id, petgraph::Direction::Outgoing)
    }

    fn neighbors(&self, task_id: &str, dir: petgraph::Direction) -> Vec<String> {
        let Some(idx) = self.index_map.get(task_id) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(*idx, dir)
            .filter_map(|n| self.graph.node_weight(n).cloned())
            .collect()
    }

    /// Every task reachable through dependent edges from `task_id`,
    /// excluding the task itself. Used to propagate skips when a branch
    /// fails under `ContinueIndependentBranches`.
    pub fn transitive_dependents(&self, task_id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let Some(start) = self.index_map.get(task_id) else {
            return seen;
        };
        let mut queue: VecDeque<NodeIndex> = VecDeque::new();
        queue.push_back(*start);
        while let Some(idx) = queue.pop_front() {
            for next in self
                .graph
                .neighbors_directed(idx, petgraph::Direction::Outgoing)
            {
                if let Some(id) = self.graph.node_weight(next) {
                    if seen.insert(id.clone()) {
                        queue.push_back(next);
                    }
                }
            }
        }
        seen
    }

    /// Tasks whose dependencies are all contained in `satisfied`. The caller
    /// filters out tasks that already left the `Pending` state.
    pub fn ready_set(&self, satisfied: &HashSet<String>) -> Vec<String> {
        self.topo_order
            .iter()
            .filter(|id| !satisfied.contains(*id))
            .filter(|id| {
                let idx = self.index_map[*id];
                self.graph
                    .neighbors_directed(idx, petgraph::Direction::Incoming)
                    .all(|dep| {
                        self.graph
                            .node_weight(dep)
                            .is_some_and(|dep_id| satisfied.contains(dep_id))
                    })
            })
            .cloned()
            .collect()
    }
}
