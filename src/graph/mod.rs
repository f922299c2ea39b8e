//! Service dependency graph
//!
//! Cycle detection and topological ordering, plus the graph report used
//! for visualization.

pub mod report;
pub mod resolver;

pub use report::{DependencyGraph, GraphEdge, GraphNode};
pub use resolver::DependencyResolver;
