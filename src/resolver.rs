//! Dependency graph resolution.
//!
//! Edges point from a component to what it depends on (`from -> to` means
//! `from` needs `to` first). All iteration is over sorted collections so that
//! cycle reports, broken edges and orderings are reproducible.

use crate::error::{OrchestratorError, Result};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, error, info, warn};

/// A directed dependency edge: `from` depends on `to`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
}

/// A cycle as the ordered list of nodes on it; the last node depends on the first
pub type Cycle = Vec<String>;

/// A cycle together with the edge removed to break it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokenCycle {
    pub cycle: Cycle,
    pub removed_edge: DependencyEdge,
}

#[derive(Debug, Clone)]
struct Node {
    dependencies: BTreeSet<String>,
    priority: i32,
}

/// Dependency graph with cycle detection, cycle breaking and topological ordering
#[derive(Debug, Clone, Default)]
pub struct DependencyResolver {
    nodes: BTreeMap<String, Node>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a node
    pub fn add_component<I, S>(&mut self, id: &str, dependencies: I, priority: i32)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let dependencies: BTreeSet<String> = dependencies
            .into_iter()
            .map(Into::into)
            .collect();
        if dependencies.contains(id) {
            warn!("{} depends on itself, the edge will be broken as a cycle", id);
        }

        debug!("Adding {} to dependency graph: {:?}", id, dependencies);
        self.nodes.insert(
            id.to_string(),
            Node {
                dependencies,
                priority,
            },
        );
    }

    /// Remove a node and strip it from every other node's dependency set
    pub fn remove_component(&mut self, id: &str) -> bool {
        let removed = self.nodes.remove(id).is_some();
        for node in self.nodes.values_mut() {
            node.dependencies.remove(id);
        }
        removed
    }

    /// Add a single edge at runtime; both endpoints must already exist
    pub fn add_dependency(&mut self, from: &str, to: &str) -> bool {
        if !self.nodes.contains_key(to) {
            return false;
        }
        match self.nodes.get_mut(from) {
            Some(node) => node.dependencies.insert(to.to_string()),
            None => false,
        }
    }

    pub fn remove_dependency(&mut self, from: &str, to: &str) -> bool {
        self.nodes
            .get_mut(from)
            .map(|node| node.dependencies.remove(to))
            .unwrap_or(false)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn priority_of(&self, id: &str) -> i32 {
        self.nodes.get(id).map(|n| n.priority).unwrap_or(0)
    }

    /// Current (possibly pruned) dependencies of a node
    pub fn dependencies_of(&self, id: &str) -> Vec<String> {
        self.nodes
            .get(id)
            .map(|n| n.dependencies.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Nodes that directly depend on `id`
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.dependencies.contains(id))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn edges(&self) -> Vec<DependencyEdge> {
        self.nodes
            .iter()
            .flat_map(|(from, node)| {
                node.dependencies.iter().map(move |to| DependencyEdge {
                    from: from.clone(),
                    to: to.clone(),
                })
            })
            .collect()
    }

    /// Report every cycle reachable by depth-first search.
    ///
    /// Whenever a node already on the active path is reached again, the path
    /// from its first occurrence up to the revisiting node is reported.
    pub fn detect_cycles(&self) -> Vec<Cycle> {
        let mut visited = HashSet::new();
        let mut on_path = HashSet::new();
        let mut path = Vec::new();
        let mut cycles = Vec::new();

        for id in self.nodes.keys() {
            if !visited.contains(id.as_str()) {
                self.dfs(id, &mut visited, &mut on_path, &mut path, &mut cycles);
            }
        }

        cycles
    }

    fn dfs<'a>(
        &'a self,
        id: &'a str,
        visited: &mut HashSet<&'a str>,
        on_path: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
        cycles: &mut Vec<Cycle>,
    ) {
        visited.insert(id);
        on_path.insert(id);
        path.push(id);

        if let Some(node) = self.nodes.get(id) {
            for dep in &node.dependencies {
                let dep = dep.as_str();
                if !self.nodes.contains_key(dep) {
                    continue;
                }
                if on_path.contains(dep) {
                    let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                    cycles.push(path[start..].iter().map(|n| n.to_string()).collect());
                } else if !visited.contains(dep) {
                    self.dfs(dep, visited, on_path, path, cycles);
                }
            }
        }

        on_path.remove(id);
        path.pop();
    }

    /// Break every detected cycle by removing its cheapest edge.
    ///
    /// The cost of an edge is the sum of its endpoints' priorities; ties go to
    /// the first minimal edge in cycle order. Returns the cycles that were broken.
    pub fn resolve_cycles(&mut self) -> Result<Vec<BrokenCycle>> {
        let mut broken = Vec::new();
        // Each pass removes at least one edge, so the edge count bounds the passes
        let max_passes = self.edges().len() + 1;

        for _ in 0..max_passes {
            let cycles = self.detect_cycles();
            if cycles.is_empty() {
                return Ok(broken);
            }

            for cycle in cycles {
                let edges = cycle_edges(&cycle);
                if edges.iter().any(|e| !self.has_edge(e)) {
                    // An earlier break in this pass already opened the cycle
                    continue;
                }

                let Some(edge) = self.cheapest_edge(&edges) else {
                    continue;
                };

                info!(
                    "Breaking dependency cycle {:?} by removing {} -> {}",
                    cycle, edge.from, edge.to
                );
                self.remove_dependency(&edge.from, &edge.to);
                broken.push(BrokenCycle {
                    cycle,
                    removed_edge: edge,
                });
            }
        }

        let residual = self.detect_cycles();
        match residual.into_iter().next() {
            Some(cycle) => {
                error!("Dependency cycle survived resolution: {:?}", cycle);
                Err(OrchestratorError::CycleUnresolvable { cycle })
            }
            None => Ok(broken),
        }
    }

    fn has_edge(&self, edge: &DependencyEdge) -> bool {
        self.nodes
            .get(&edge.from)
            .map(|n| n.dependencies.contains(&edge.to))
            .unwrap_or(false)
    }

    fn cheapest_edge(&self, edges: &[DependencyEdge]) -> Option<DependencyEdge> {
        let mut best: Option<(i64, &DependencyEdge)> = None;
        for edge in edges {
            let cost = self.priority_of(&edge.from) as i64 + self.priority_of(&edge.to) as i64;
            match best {
                Some((best_cost, _)) if best_cost <= cost => {}
                _ => best = Some((cost, edge)),
            }
        }
        best.map(|(_, edge)| edge.clone())
    }

    /// Break cycles, then order nodes so every dependency precedes its dependents.
    ///
    /// Returns the order and whether any cycle had to be broken.
    pub fn resolve_dependencies(&mut self) -> (Vec<String>, bool) {
        let had_cycles = match self.resolve_cycles() {
            Ok(broken) => !broken.is_empty(),
            Err(e) => {
                warn!("Ordering with unresolved cycles: {}", e);
                true
            }
        };

        (self.topological_order(), had_cycles)
    }

    /// Kahn's algorithm over the current edges.
    ///
    /// Nodes left over (only possible if a cycle remains) are appended in sorted order.
    pub fn topological_order(&self) -> Vec<String> {
        // in-degree here counts unresolved dependencies that are themselves nodes
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for (id, node) in &self.nodes {
            let known: Vec<&str> = node
                .dependencies
                .iter()
                .map(String::as_str)
                .filter(|dep| self.nodes.contains_key(*dep))
                .collect();
            in_degree.insert(id.as_str(), known.len());
            for dep in known {
                dependents.entry(dep).or_default().push(id.as_str());
            }
        }

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = ready.pop_first() {
            order.push(id.to_string());
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if order.len() < self.nodes.len() {
            let placed: HashSet<String> = order.iter().cloned().collect();
            let residual: Vec<String> = self
                .nodes
                .keys()
                .filter(|id| !placed.contains(*id))
                .cloned()
                .collect();
            warn!("Appending unordered components: {:?}", residual);
            order.extend(residual);
        }

        order
    }
}

/// Edges along a cycle, in cycle order, closing back to the first node
fn cycle_edges(cycle: &[String]) -> Vec<DependencyEdge> {
    (0..cycle.len())
        .map(|i| DependencyEdge {
            from: cycle[i].clone(),
            to: cycle[(i + 1) % cycle.len()].clone(),
        })
        .collect()
}

/// Whether every dependency is in the running set; missing ones are returned sorted
pub fn check_dependencies_satisfied<S: AsRef<str>>(
    id: &str,
    dependencies: &[S],
    running: &HashSet<String>,
) -> (bool, Vec<String>) {
    let mut missing: Vec<String> = dependencies
        .iter()
        .map(|d| d.as_ref())
        .filter(|d| !running.contains(*d))
        .map(str::to_string)
        .collect();
    missing.sort();
    missing.dedup();

    if !missing.is_empty() {
        debug!("{} waiting on {:?}", id, missing);
    }
    (missing.is_empty(), missing)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(spec: &[(&str, &[&str], i32)]) -> DependencyResolver {
        let mut resolver = DependencyResolver::new();
        for (id, deps, priority) in spec {
            resolver.add_component(id, deps.iter().copied(), *priority);
        }
        resolver
    }

    fn position(order: &[String], id: &str) -> usize {
        order.iter().position(|n| n == id).unwrap()
    }

    #[test]
    fn test_simple_order() {
        let mut resolver = graph(&[("Harmonia", &["Hermes"], 0), ("Hermes", &[], 0)]);
        let (order, had_cycles) = resolver.resolve_dependencies();
        assert_eq!(order, vec!["Hermes", "Harmonia"]);
        assert!(!had_cycles);
    }

    #[test]
    fn test_chain_order() {
        let mut resolver = graph(&[("C", &["B"], 0), ("A", &[], 0), ("B", &["A"], 0)]);
        let (order, _) = resolver.resolve_dependencies();
        assert_eq!(order, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_diamond_is_deterministic_permutation() {
        let mut resolver = graph(&[
            ("app", &["db", "cache"], 0),
            ("db", &["net"], 0),
            ("cache", &["net"], 0),
            ("net", &[], 0),
        ]);
        let (order, _) = resolver.resolve_dependencies();

        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["app", "cache", "db", "net"]);

        for edge in resolver.edges() {
            assert!(position(&order, &edge.to) < position(&order, &edge.from));
        }
        assert_eq!(order, vec!["net", "cache", "db", "app"]);
    }

    #[test]
    fn test_detect_two_node_cycle() {
        let resolver = graph(&[("A", &["B"], 0), ("B", &["A"], 0)]);
        let cycles = resolver.detect_cycles();
        assert_eq!(cycles, vec![vec!["A".to_string(), "B".to_string()]]);
    }

    #[test]
    fn test_detect_disjoint_cycles() {
        let resolver = graph(&[
            ("A", &["B"], 0),
            ("B", &["A"], 0),
            ("X", &["Y"], 0),
            ("Y", &["Z"], 0),
            ("Z", &["X"], 0),
        ]);
        let cycles = resolver.detect_cycles();
        assert_eq!(cycles.len(), 2);
        assert!(cycles.contains(&vec!["X".to_string(), "Y".to_string(), "Z".to_string()]));
    }

    #[test]
    fn test_resolve_cycles_clears_all_cycles() {
        let mut resolver = graph(&[
            ("A", &["B"], 0),
            ("B", &["C"], 0),
            ("C", &["A"], 0),
            ("D", &["D2"], 0),
            ("D2", &["D"], 0),
        ]);
        assert!(!resolver.detect_cycles().is_empty());

        let broken = resolver.resolve_cycles().unwrap();
        assert_eq!(broken.len(), 2);
        assert!(resolver.detect_cycles().is_empty());
    }

    #[test]
    fn test_cycle_breaks_lowest_priority_edge() {
        // A(10) -> B(0) -> C(0) -> A(10): B->C costs 0, the others cost 10
        let mut resolver = graph(&[("A", &["B"], 10), ("B", &["C"], 0), ("C", &["A"], 0)]);
        resolver.resolve_cycles().unwrap();

        assert!(resolver.dependencies_of("B").is_empty());
        assert_eq!(resolver.dependencies_of("A"), vec!["B"]);
        assert_eq!(resolver.dependencies_of("C"), vec!["A"]);
    }

    #[test]
    fn test_cycle_tie_break_is_first_edge_in_cycle_order() {
        let mut resolver = graph(&[("A", &["B"], 0), ("B", &["A"], 0)]);
        let broken = resolver.resolve_cycles().unwrap();

        // Cycle is reported as [A, B]; the first edge is A -> B
        assert_eq!(broken.len(), 1);
        assert_eq!(
            broken[0].removed_edge,
            DependencyEdge {
                from: "A".to_string(),
                to: "B".to_string(),
            }
        );
        assert!(resolver.dependencies_of("A").is_empty());
        assert_eq!(resolver.dependencies_of("B"), vec!["A"]);

        // Nothing left to break
        assert!(resolver.resolve_cycles().unwrap().is_empty());
    }

    #[test]
    fn test_overlapping_cycles_resolved() {
        let mut resolver = graph(&[("A", &["B", "C"], 0), ("B", &["A"], 0), ("C", &["A"], 0)]);
        let (order, had_cycles) = resolver.resolve_dependencies();
        assert!(had_cycles);
        assert_eq!(order.len(), 3);
        assert!(resolver.detect_cycles().is_empty());
        for edge in resolver.edges() {
            assert!(position(&order, &edge.to) < position(&order, &edge.from));
        }
    }

    #[test]
    fn test_unknown_dependencies_do_not_block_order() {
        let mut resolver = graph(&[("A", &["external"], 0), ("B", &["A"], 0)]);
        let (order, _) = resolver.resolve_dependencies();
        assert_eq!(order, vec!["A", "B"]);
    }

    #[test]
    fn test_remove_component_strips_edges() {
        let mut resolver = graph(&[("A", &[], 0), ("B", &["A"], 0), ("C", &["A", "B"], 0)]);
        assert!(resolver.remove_component("A"));
        assert!(resolver.dependencies_of("B").is_empty());
        assert_eq!(resolver.dependencies_of("C"), vec!["B"]);
        assert_eq!(resolver.dependents_of("B"), vec!["C"]);
        assert!(!resolver.remove_component("A"));
    }

    #[test]
    fn test_self_dependency_is_reported_and_broken() {
        let mut resolver = graph(&[("A", &["A"], 0), ("B", &["A"], 0)]);
        assert_eq!(resolver.detect_cycles(), vec![vec!["A".to_string()]]);

        let (order, had_cycles) = resolver.resolve_dependencies();
        assert!(had_cycles);
        assert_eq!(order, vec!["A", "B"]);
        assert!(resolver.dependencies_of("A").is_empty());

        assert!(resolver.add_dependency("B", "B"));
        let broken = resolver.resolve_cycles().unwrap();
        assert_eq!(
            broken[0].removed_edge,
            DependencyEdge {
                from: "B".to_string(),
                to: "B".to_string()
            }
        );
    }

    #[test]
    fn test_dynamic_dependency_creates_cycle() {
        let mut resolver = graph(&[("A", &[], 0), ("B", &["A"], 0)]);
        assert!(resolver.detect_cycles().is_empty());
        assert!(resolver.add_dependency("A", "B"));
        assert_eq!(resolver.detect_cycles().len(), 1);
    }

    #[test]
    fn test_check_dependencies_satisfied() {
        let running: HashSet<String> = ["A".to_string()].into_iter().collect();

        let (ok, missing) = check_dependencies_satisfied("C", &["A"], &running);
        assert!(ok);
        assert!(missing.is_empty());

        let (ok, missing) = check_dependencies_satisfied("C", &["B", "A", "D"], &running);
        assert!(!ok);
        assert_eq!(missing, vec!["B", "D"]);
    }
}
