//! Dependency graph report for visualization

use crate::error::Result;
use crate::manifest::ValidatedManifest;
use crate::plan::ExecutionPlan;
use serde::{Deserialize, Serialize};

/// A service in the graph report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub name: String,
    pub enabled: bool,
    pub category: String,
    pub ip: String,
    pub hostname: String,
    /// Phase the service runs in, when a plan is available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

/// `from` depends on `to`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
}

/// Nodes and edges of the service dependency graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl DependencyGraph {
    /// Build the report, annotating phases from `plan` when given
    pub fn build(validated: &ValidatedManifest, plan: Option<&ExecutionPlan>) -> Self {
        let nodes = validated
            .services()
            .iter()
            .map(|s| GraphNode {
                name: s.name.clone(),
                enabled: s.enabled(),
                category: s.category.clone(),
                ip: s.ip.clone(),
                hostname: s.hostname.clone(),
                phase: plan
                    .and_then(|p| p.phase_of(&s.name).map(|i| p.phases[i].name.clone())),
            })
            .collect();

        let edges = validated
            .services()
            .iter()
            .flat_map(|s| {
                s.depends_on().iter().map(move |dep| GraphEdge {
                    from: s.name.clone(),
                    to: dep.clone(),
                })
            })
            .collect();

        Self { nodes, edges }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Graphviz DOT; disabled services are drawn dashed
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph keel {\n    rankdir=LR;\n    node [shape=box];\n");

        for node in &self.nodes {
            let mut label = format!("{}\\n{}", node.name, node.ip);
            if let Some(ref phase) = node.phase {
                label.push_str(&format!("\\n[{}]", phase));
            }
            let style = if node.enabled { "" } else { ", style=dashed" };
            out.push_str(&format!(
                "    \"{}\" [label=\"{}\"{}];\n",
                node.name, label, style
            ));
        }
        for edge in &self.edges {
            out.push_str(&format!("    \"{}\" -> \"{}\";\n", edge.from, edge.to));
        }

        out.push_str("}\n");
        out
    }
}
