//! Dependency graph over action instances.
//!
//! Every action contributes one instance per listed node, or a single
//! untargeted instance when its node list is empty. An edge runs from each
//! instance of a dependency to each instance of the dependent.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::action::{Action, ActionId};
use crate::error::{CastleError, Result};

/// One schedulable unit: an action, optionally bound to a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InstanceKey {
    pub action: ActionId,
    pub node: Option<String>,
}

impl InstanceKey {
    pub fn new(action: ActionId, node: Option<String>) -> Self {
        Self { action, node }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node {
            Some(node) => write!(f, "{} on {}", self.action, node),
            None => write!(f, "{}", self.action),
        }
    }
}

#[derive(Debug)]
pub struct ActionGraph {
    /// Instances grouped by catalog position, then by node-list order.
    pub(crate) instances: Vec<InstanceKey>,
    /// Catalog index of the action each instance belongs to.
    pub(crate) action_of: Vec<usize>,
    pub(crate) dependents: Vec<Vec<usize>>,
    pub(crate) in_degree: Vec<usize>,
}

impl ActionGraph {
    /// Expand `actions` against `node_names` and validate the result.
    ///
    /// Fails on a duplicate `ActionId`, a node that is not in `node_names`,
    /// a target that matches no action, or a dependency cycle.
    pub fn build(actions: &[Arc<dyn Action>], node_names: &[String]) -> Result<Self> {
        let known: HashSet<&str> = node_names.iter().map(String::as_str).collect();
        let mut seen = HashSet::new();
        let mut instances = Vec::new();
        let mut action_of = Vec::new();
        let mut by_action: Vec<Vec<usize>> = Vec::with_capacity(actions.len());

        for (ai, action) in actions.iter().enumerate() {
            let spec = action.spec();
            if !seen.insert(&spec.id) {
                return Err(CastleError::DuplicateAction(spec.id.clone()));
            }
            let mut own = Vec::new();
            if spec.nodes.is_empty() {
                own.push(instances.len());
                instances.push(InstanceKey::new(spec.id.clone(), None));
                action_of.push(ai);
            } else {
                let mut listed = HashSet::new();
                for node in &spec.nodes {
                    if !listed.insert(node.as_str()) {
                        continue;
                    }
                    if !known.contains(node.as_str()) {
                        return Err(CastleError::UnknownNode {
                            action: spec.id.clone(),
                            node: node.clone(),
                        });
                    }
                    own.push(instances.len());
                    instances.push(InstanceKey::new(spec.id.clone(), Some(node.clone())));
                    action_of.push(ai);
                }
            }
            by_action.push(own);
        }

        let mut dependents = vec![Vec::new(); instances.len()];
        let mut in_degree = vec![0usize; instances.len()];
        let mut edges = HashSet::new();
        for (ai, action) in actions.iter().enumerate() {
            let spec = action.spec();
            for target in &spec.targets {
                let matched: Vec<usize> = actions
                    .iter()
                    .enumerate()
                    .filter(|(_, dep)| dep.id().matches(target))
                    .map(|(i, _)| i)
                    .collect();
                if matched.is_empty() {
                    return Err(CastleError::UnresolvedDependency {
                        action: spec.id.clone(),
                        target: target.clone(),
                    });
                }
                for dep in matched {
                    for &from in &by_action[dep] {
                        for &to in &by_action[ai] {
                            if edges.insert((from, to)) {
                                dependents[from].push(to);
                                in_degree[to] += 1;
                            }
                        }
                    }
                }
            }
        }

        let graph = Self {
            instances,
            action_of,
            dependents,
            in_degree,
        };
        if let Some(cycle) = graph.find_cycle() {
            return Err(CastleError::DependencyCycle { cycle });
        }
        tracing::debug!(
            actions = actions.len(),
            instances = graph.instances.len(),
            edges = edges.len(),
            "built action graph"
        );
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instances(&self) -> &[InstanceKey] {
        &self.instances
    }

    /// Instances that directly depend on `key`.
    pub fn dependents_of(&self, key: &InstanceKey) -> Vec<&InstanceKey> {
        self.instances
            .iter()
            .position(|k| k == key)
            .map(|i| self.dependents[i].iter().map(|&d| &self.instances[d]).collect())
            .unwrap_or_default()
    }

    /// Run Kahn's algorithm to completion. Anything left over sits on or
    /// behind a cycle; walk predecessors from there until one repeats.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut remaining = self.in_degree.clone();
        let mut queue: VecDeque<usize> = (0..self.len()).filter(|&i| remaining[i] == 0).collect();
        let mut visited = 0;
        while let Some(i) = queue.pop_front() {
            visited += 1;
            for &d in &self.dependents[i] {
                remaining[d] -= 1;
                if remaining[d] == 0 {
                    queue.push_back(d);
                }
            }
        }
        if visited == self.len() {
            return None;
        }

        let mut predecessors = vec![Vec::new(); self.len()];
        for (from, tos) in self.dependents.iter().enumerate() {
            for &to in tos {
                predecessors[to].push(from);
            }
        }
        // Every leftover instance has a leftover predecessor.
        let mut current = (0..self.len()).find(|&i| remaining[i] > 0)?;
        let mut path = Vec::new();
        let mut position = HashMap::new();
        while !position.contains_key(&current) {
            position.insert(current, path.len());
            path.push(current);
            current = *predecessors[current].iter().find(|&&p| remaining[p] > 0)?;
        }
        let mut cycle: Vec<usize> = path[position[&current]..].to_vec();
        cycle.reverse();
        cycle.push(cycle[0]);
        Some(cycle.into_iter().map(|i| self.instances[i].to_string()).collect())
    }
}
