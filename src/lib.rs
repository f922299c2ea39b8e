//! Keel - a manifest-driven deployment orchestrator
//!
//! Keel reads a declarative manifest of services, their network identities
//! and dependencies, and deploys them in dependency-respecting phases:
//!
//! - Manifest validation (all violations reported in one pass)
//! - Dependency resolution with deterministic ordering
//! - Explicit or derived deployment phases
//! - Startup, liveness and readiness health checks with retries
//! - Incremental deploys against persisted state
//! - Best-effort rollback of applied phases

pub mod deploy;
pub mod error;
pub mod graph;
pub mod health;
pub mod manifest;
pub mod plan;
pub mod rollback;
pub mod settings;
pub mod state;

pub use error::{KeelError, Result};
