//! Dependency ordering of objects.
//!
//! An edge `A -> B` means "A requires B": some non-nullable relationship field
//! on A points at B, so B's records must exist first. Ordering is Kahn's
//! algorithm with a sorted ready set; when the sort stalls on a cycle, one
//! edge inside a strongly connected component is deferred (the
//! lexicographically smallest) and the sort continues.

use crate::schema::ObjectDescribe;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.target)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    nodes: BTreeSet<String>,
    edges: BTreeSet<Edge>,
}

impl DependencyGraph {
    pub fn new<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            nodes: nodes.into_iter().map(Into::into).collect(),
            edges: BTreeSet::new(),
        }
    }

    /// Graph over `objects` using the required relationships in `describes`.
    ///
    /// Self-references and references leaving the set add no edge.
    pub fn from_describes(
        objects: &[String],
        describes: &HashMap<String, Arc<ObjectDescribe>>,
    ) -> Result<Self> {
        let mut graph = Self::new(objects.iter().cloned());
        for object in objects {
            let describe = describes
                .get(object)
                .ok_or_else(|| EngineError::Describe(object.clone()))?;
            for rel in describe.relationships().filter(|r| r.required) {
                if rel.target != object.as_str() && graph.nodes.contains(rel.target) {
                    graph.add_edge(Edge::new(object.as_str(), rel.target));
                }
            }
        }
        Ok(graph)
    }

    pub fn add_edge(&mut self, edge: Edge) {
        self.edges.insert(edge);
    }

    pub fn nodes(&self) -> &BTreeSet<String> {
        &self.nodes
    }

    pub fn edges(&self) -> &BTreeSet<Edge> {
        &self.edges
    }

    /// Order the nodes so every prerequisite precedes its dependents,
    /// deferring cycle edges as needed.
    pub fn resolve(mut self) -> Result<Resolution> {
        let mut deferred = BTreeSet::new();
        let mut order = Vec::with_capacity(self.nodes.len());

        loop {
            let remaining: BTreeSet<&String> = self
                .nodes
                .iter()
                .filter(|n| !order.contains(*n))
                .collect();
            if remaining.is_empty() {
                break;
            }

            let sorted = self.kahn(&remaining);
            let stalled = sorted.len() < remaining.len();
            order.extend(sorted);
            if !stalled {
                break;
            }

            let placed: BTreeSet<&String> = order.iter().collect();
            let left: BTreeSet<&String> = remaining.difference(&placed).copied().collect();
            let edge = self.cycle_edge(&left).ok_or_else(|| {
                EngineError::UnresolvableDependency(left.iter().map(|s| s.to_string()).collect())
            })?;

            warn!(edge = %edge, "Dependency cycle detected, deferring edge");
            self.edges.remove(&edge);
            deferred.insert(edge);
        }

        debug!(order = ?order, deferred = deferred.len(), "Resolved processing order");
        Ok(Resolution { order, deferred })
    }

    /// Kahn's algorithm over `remaining`; stops when nothing is ready.
    fn kahn(&self, remaining: &BTreeSet<&String>) -> Vec<String> {
        let mut in_degree: BTreeMap<&str, usize> =
            remaining.iter().map(|n| (n.as_str(), 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for edge in &self.edges {
            if !remaining.contains(&edge.source) {
                continue;
            }
            // An edge into an already placed node is satisfied; into an
            // unknown node it can never be.
            match in_degree.get(edge.target.as_str()) {
                Some(_) => {
                    *in_degree.entry(edge.source.as_str()).or_default() += 1;
                    dependents
                        .entry(edge.target.as_str())
                        .or_default()
                        .push(edge.source.as_str());
                }
                None if !self.nodes.contains(&edge.target) => {
                    *in_degree.entry(edge.source.as_str()).or_default() += 1;
                }
                None => {}
            }
        }

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut out = Vec::new();

        while let Some(node) = ready.pop_first() {
            out.push(node.to_string());
            for &dependent in dependents.get(node).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }
        out
    }

    /// Smallest edge whose endpoints share a non-trivial strongly connected
    /// component of the subgraph induced by `left`.
    fn cycle_edge(&self, left: &BTreeSet<&String>) -> Option<Edge> {
        let inner: Vec<&Edge> = self
            .edges
            .iter()
            .filter(|e| left.contains(&e.source) && left.contains(&e.target))
            .collect();
        let components = tarjan(left, &inner);
        inner
            .into_iter()
            .find(|e| {
                let component = components[e.source.as_str()];
                component == components[e.target.as_str()]
            })
            .cloned()
    }
}

/// Component index per node (Tarjan's algorithm, iterative).
fn tarjan<'a>(nodes: &BTreeSet<&'a String>, edges: &[&'a Edge]) -> HashMap<&'a str, usize> {
    let mut adjacency: BTreeMap<&str, Vec<&str>> =
        nodes.iter().map(|&n| (n.as_str(), Vec::new())).collect();
    for edge in edges {
        if let Some(out) = adjacency.get_mut(edge.source.as_str()) {
            out.push(edge.target.as_str());
        }
    }

    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut low: HashMap<&str, usize> = HashMap::new();
    let mut on_stack: BTreeSet<&str> = BTreeSet::new();
    let mut stack: Vec<&str> = Vec::new();
    let mut component: HashMap<&str, usize> = HashMap::new();
    let mut next_index = 0;
    let mut next_component = 0;

    for &root in adjacency.keys() {
        if index.contains_key(root) {
            continue;
        }
        // (node, position of the next neighbour to visit)
        let mut call: Vec<(&str, usize)> = vec![(root, 0)];
        index.insert(root, next_index);
        low.insert(root, next_index);
        next_index += 1;
        stack.push(root);
        on_stack.insert(root);

        while let Some(frame) = call.last_mut() {
            let node = frame.0;
            let neighbours = &adjacency[node];
            if frame.1 < neighbours.len() {
                let next = neighbours[frame.1];
                frame.1 += 1;
                if !index.contains_key(next) {
                    index.insert(next, next_index);
                    low.insert(next, next_index);
                    next_index += 1;
                    stack.push(next);
                    on_stack.insert(next);
                    call.push((next, 0));
                } else if on_stack.contains(next) {
                    let l = low[node].min(index[next]);
                    low.insert(node, l);
                }
                continue;
            }

            call.pop();
            if let Some(&(parent, _)) = call.last() {
                let l = low[parent].min(low[node]);
                low.insert(parent, l);
            }
            if low[node] == index[node] {
                while let Some(member) = stack.pop() {
                    on_stack.remove(member);
                    component.insert(member, next_component);
                    if member == node {
                        break;
                    }
                }
                next_component += 1;
            }
        }
    }
    component
}

/// Processing order plus the edges that must be patched afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub order: Vec<String>,
    pub deferred: BTreeSet<Edge>,
}

impl Resolution {
    /// Whether references from `source` to `target` are patched after import.
    pub fn is_deferred(&self, source: &str, target: &str) -> bool {
        self.deferred
            .iter()
            .any(|e| e.source == source && e.target == target)
    }

    pub fn position(&self, object: &str) -> Option<usize> {
        self.order.iter().position(|o| o == object)
    }
}

/// Resolve the processing order of `objects` from their describes.
pub fn resolve(
    objects: &[String],
    describes: &HashMap<String, Arc<ObjectDescribe>>,
) -> Result<Resolution> {
    DependencyGraph::from_describes(objects, describes)?.resolve()
}
