//! Dependency resolution shared by processes, the task manager and the
//! process scheduler.
//!
//! Everything here is pure: functions take a slice of nodes and return
//! indices into that slice. Ties between simultaneously ready nodes are broken
//! by descending priority, then by position in the slice.

use crate::task::types::{SkipReason, TaskEntry, TaskStatus};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Coarse state of a node as far as dependency resolution is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    Running,
    Completed,
    /// Failed or skipped; dependents can never run
    Unavailable,
}

/// Anything that can sit in a dependency graph
pub trait DependencyNode {
    fn node_id(&self) -> &str;
    fn node_dependencies(&self) -> &[String];
    fn node_priority(&self) -> i32;
    fn node_state(&self) -> NodeState;
}

impl DependencyNode for TaskEntry {
    fn node_id(&self) -> &str {
        &self.id
    }

    fn node_dependencies(&self) -> &[String] {
        &self.dependencies
    }

    fn node_priority(&self) -> i32 {
        self.priority
    }

    fn node_state(&self) -> NodeState {
        match self.status {
            TaskStatus::Pending => NodeState::Pending,
            TaskStatus::Running { .. } => NodeState::Running,
            TaskStatus::Completed { .. } => NodeState::Completed,
            TaskStatus::Failed { .. } | TaskStatus::Skipped { .. } => NodeState::Unavailable,
        }
    }
}

/// Output of a full topological resolution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Indices in execution order
    pub order: Vec<usize>,
    /// Indices that can never become ready, with the reason
    pub unresolvable: Vec<(usize, SkipReason)>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.unresolvable.is_empty()
    }
}

/// Topological ordering and ready-set computation
pub struct DependencyResolver;

impl DependencyResolver {
    /// Kahn's algorithm with a priority heap.
    ///
    /// Missing references and cycles never block the caller: affected nodes
    /// and everything downstream of them land in `unresolvable`.
    pub fn resolve<N: DependencyNode>(nodes: &[N]) -> Resolution {
        let index = Self::index(nodes);
        let n = nodes.len();

        let mut unsatisfied = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut missing: Vec<Option<String>> = vec![None; n];

        for (i, node) in nodes.iter().enumerate() {
            for dep in node.node_dependencies() {
                unsatisfied[i] += 1;
                match index.get(dep.as_str()) {
                    Some(&j) => dependents[j].push(i),
                    None => {
                        missing[i].get_or_insert_with(|| dep.clone());
                    }
                }
            }
        }

        let mut heap: BinaryHeap<(i32, Reverse<usize>)> = (0..n)
            .filter(|&i| unsatisfied[i] == 0)
            .map(|i| (nodes[i].node_priority(), Reverse(i)))
            .collect();

        let mut placed = vec![false; n];
        let mut order = Vec::with_capacity(n);

        while let Some((_, Reverse(i))) = heap.pop() {
            placed[i] = true;
            order.push(i);
            for &d in &dependents[i] {
                unsatisfied[d] -= 1;
                if unsatisfied[d] == 0 {
                    heap.push((nodes[d].node_priority(), Reverse(d)));
                }
            }
        }

        let unresolvable = (0..n)
            .filter(|&i| !placed[i])
            .map(|i| {
                let reason = if let Some(dependency) = missing[i].clone() {
                    SkipReason::MissingDependency { dependency }
                } else if Self::on_cycle(i, nodes, &index, &placed) {
                    SkipReason::DependencyCycle
                } else {
                    let dependency = nodes[i]
                        .node_dependencies()
                        .iter()
                        .find(|dep| index.get(dep.as_str()).is_some_and(|&j| !placed[j]))
                        .cloned()
                        .unwrap_or_default();
                    SkipReason::DependencyUnavailable { dependency }
                };
                (i, reason)
            })
            .collect();

        Resolution {
            order,
            unresolvable,
        }
    }

    /// Pending nodes whose dependencies have all completed
    pub fn ready_set<N: DependencyNode>(nodes: &[N]) -> Vec<usize> {
        let index = Self::index(nodes);
        let mut ready: Vec<usize> = nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.node_state() == NodeState::Pending)
            .filter(|(_, node)| {
                node.node_dependencies().iter().all(|dep| {
                    index
                        .get(dep.as_str())
                        .is_some_and(|&j| nodes[j].node_state() == NodeState::Completed)
                })
            })
            .map(|(i, _)| i)
            .collect();

        ready.sort_by_key(|&i| (Reverse(nodes[i].node_priority()), i));
        ready
    }

    /// Pending nodes with at least one dependency that can no longer complete
    pub fn blocked<N: DependencyNode>(nodes: &[N]) -> Vec<(usize, SkipReason)> {
        let index = Self::index(nodes);
        nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.node_state() == NodeState::Pending)
            .filter_map(|(i, node)| {
                node.node_dependencies().iter().find_map(|dep| {
                    match index.get(dep.as_str()) {
                        None => Some(SkipReason::MissingDependency {
                            dependency: dep.clone(),
                        }),
                        Some(&j) if nodes[j].node_state() == NodeState::Unavailable => {
                            Some(SkipReason::DependencyUnavailable {
                                dependency: dep.clone(),
                            })
                        }
                        Some(_) => None,
                    }
                })
                .map(|reason| (i, reason))
            })
            .collect()
    }

    /// First dependency of `nodes[i]` that is not completed, if any
    pub fn first_unmet<N: DependencyNode>(nodes: &[N], i: usize) -> Option<SkipReason> {
        let index = Self::index(nodes);
        nodes[i].node_dependencies().iter().find_map(|dep| {
            match index.get(dep.as_str()) {
                None => Some(SkipReason::MissingDependency {
                    dependency: dep.clone(),
                }),
                Some(&j) if nodes[j].node_state() != NodeState::Completed => {
                    Some(SkipReason::DependencyUnavailable {
                        dependency: dep.clone(),
                    })
                }
                Some(_) => None,
            }
        })
    }

    /// Ids of every node that sits on a dependency cycle
    pub fn cycle_members<N: DependencyNode>(nodes: &[N]) -> Vec<String> {
        let index = Self::index(nodes);
        let unplaced = vec![false; nodes.len()];
        (0..nodes.len())
            .filter(|&i| Self::on_cycle(i, nodes, &index, &unplaced))
            .map(|i| nodes[i].node_id().to_string())
            .collect()
    }

    /// Ids in resolved order; convenience for reporting
    pub fn order_ids<N: DependencyNode>(nodes: &[N]) -> Vec<String> {
        Self::resolve(nodes)
            .order
            .into_iter()
            .map(|i| nodes[i].node_id().to_string())
            .collect()
    }

    fn index<N: DependencyNode>(nodes: &[N]) -> HashMap<&str, usize> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            index.entry(node.node_id()).or_insert(i);
        }
        index
    }

    /// Whether `start` can reach itself through nodes not yet placed
    fn on_cycle<N: DependencyNode>(
        start: usize,
        nodes: &[N],
        index: &HashMap<&str, usize>,
        placed: &[bool],
    ) -> bool {
        let mut visited = HashSet::new();
        let mut stack: Vec<usize> = Vec::new();

        let push_deps = |i: usize, stack: &mut Vec<usize>| {
            for dep in nodes[i].node_dependencies() {
                if let Some(&j) = index.get(dep.as_str()) {
                    if !placed[j] {
                        stack.push(j);
                    }
                }
            }
        };

        push_deps(start, &mut stack);
        while let Some(i) = stack.pop() {
            if i == start {
                return true;
            }
            if visited.insert(i) {
                push_deps(i, &mut stack);
            }
        }
        false
    }
}
