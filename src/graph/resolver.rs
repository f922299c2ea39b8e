//! Dependency graph resolution
//!
//! Kahn's algorithm peeled in rounds: every node whose dependencies have all
//! been emitted is eligible in the current round, and eligible nodes are
//! emitted in declaration order so the result is reproducible across runs.

use crate::error::{KeelError, Result};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Dependency graph over named nodes in declaration order
#[derive(Debug, Clone, Default)]
pub struct DependencyResolver {
    /// Node names in declaration order
    names: Vec<String>,
    /// Dependencies per node, restricted to declared nodes
    deps: HashMap<String, Vec<String>>,
}

impl DependencyResolver {
    /// Build from `(name, dependencies)` pairs in declaration order
    ///
    /// Edges to undeclared names are dropped; reporting them is the
    /// validator's job.
    pub fn new<I, N, D>(nodes: I) -> Self
    where
        I: IntoIterator<Item = (N, D)>,
        N: Into<String>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        let raw: Vec<(String, Vec<String>)> = nodes
            .into_iter()
            .map(|(name, deps)| {
                (
                    name.into(),
                    deps.into_iter().map(|d| d.as_ref().to_string()).collect(),
                )
            })
            .collect();

        let declared: HashSet<&str> = raw.iter().map(|(n, _)| n.as_str()).collect();
        let mut deps = HashMap::new();
        for (name, node_deps) in &raw {
            let mut kept: Vec<String> = Vec::new();
            for dep in node_deps {
                if declared.contains(dep.as_str()) && !kept.contains(dep) {
                    kept.push(dep.clone());
                }
            }
            deps.insert(name.clone(), kept);
        }

        Self {
            names: raw.into_iter().map(|(n, _)| n).collect(),
            deps,
        }
    }

    /// Node names in declaration order
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Direct dependencies of a node
    pub fn dependencies(&self, name: &str) -> &[String] {
        self.deps.get(name).map(|d| d.as_slice()).unwrap_or(&[])
    }

    /// Topological order, dependencies first
    pub fn resolve(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> = self
            .names
            .iter()
            .map(|n| (n.as_str(), self.dependencies(n).len()))
            .collect();
        let dependents = self.dependents_index();

        let mut order: Vec<String> = Vec::with_capacity(self.names.len());
        let mut emitted: HashSet<&str> = HashSet::new();

        loop {
            let round: Vec<&str> = self
                .names
                .iter()
                .map(|n| n.as_str())
                .filter(|n| !emitted.contains(n) && in_degree.get(n).copied() == Some(0))
                .collect();

            if round.is_empty() {
                break;
            }

            for name in round {
                emitted.insert(name);
                order.push(name.to_string());
                for dependent in dependents.get(name).into_iter().flatten() {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree = degree.saturating_sub(1);
                    }
                }
            }
        }

        if order.len() < self.names.len() {
            let remaining: Vec<String> = self
                .names
                .iter()
                .filter(|n| !emitted.contains(n.as_str()))
                .cloned()
                .collect();
            let cycle = self.extract_cycle(&remaining);
            return Err(KeelError::Cycle { remaining, cycle });
        }

        Ok(order)
    }

    /// Direct and indirect dependencies of `name`, de-duplicated
    pub fn transitive_dependencies(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = self.dependencies(name).iter().map(|d| d.as_str()).collect();

        while let Some(dep) = stack.pop() {
            if seen.insert(dep.to_string()) {
                stack.extend(self.dependencies(dep).iter().map(|d| d.as_str()));
            }
        }
        seen.remove(name);
        seen
    }

    /// Nodes that depend directly on `name`, in declaration order
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.names
            .iter()
            .filter(|n| self.dependencies(n).iter().any(|d| d == name))
            .cloned()
            .collect()
    }

    fn dependents_index(&self) -> HashMap<&str, Vec<&str>> {
        let mut index: HashMap<&str, Vec<&str>> = HashMap::new();
        for name in &self.names {
            for dep in self.dependencies(name) {
                index.entry(dep.as_str()).or_default().push(name.as_str());
            }
        }
        index
    }

    /// Walk dependency edges inside the stuck set until a node repeats
    ///
    /// Every stuck node has at least one stuck dependency, so the walk always
    /// closes a loop.
    fn extract_cycle(&self, remaining: &[String]) -> Vec<String> {
        let stuck: HashSet<&str> = remaining.iter().map(|n| n.as_str()).collect();
        let Some(start) = remaining.first() else {
            return Vec::new();
        };

        let mut path: Vec<&str> = Vec::new();
        let mut current = start.as_str();
        loop {
            if let Some(pos) = path.iter().position(|n| *n == current) {
                let mut cycle: Vec<String> = path[pos..].iter().map(|n| n.to_string()).collect();
                cycle.push(current.to_string());
                return cycle;
            }
            path.push(current);
            match self
                .dependencies(current)
                .iter()
                .find(|d| stuck.contains(d.as_str()))
            {
                Some(next) => current = next.as_str(),
                None => return path.iter().map(|n| n.to_string()).collect(),
            }
        }
    }
}
