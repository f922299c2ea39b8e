//! Error types for Keel

use crate::manifest::Violation;
use crate::plan::PlanViolation;
use thiserror::Error;

/// Result type for Keel operations
pub type Result<T> = std::result::Result<T, KeelError>;

/// Keel error types
#[derive(Error, Debug)]
pub enum KeelError {
    #[error("Manifest validation failed with {} violation(s):\n{}", .violations.len(), bullet_list(.violations))]
    Validation { violations: Vec<Violation> },

    #[error("Dependency cycle detected among services: {} (cycle: {})", .remaining.join(", "), .cycle.join(" -> "))]
    Cycle {
        /// Services that could never reach zero in-degree, in declaration order
        remaining: Vec<String>,
        /// One concrete cycle through the stuck set, first node repeated at the end
        cycle: Vec<String>,
    },

    #[error("Invalid deployment phases with {} violation(s):\n{}", .violations.len(), bullet_list(.violations))]
    Plan { violations: Vec<PlanViolation> },

    #[error("Health check timed out for service '{service}' during {stage} after {elapsed_secs}s")]
    HealthCheckTimeout {
        service: String,
        stage: String,
        elapsed_secs: u64,
    },

    #[error("Health check failed for service '{service}' during {stage} after {attempts} attempt(s): {reason}")]
    HealthCheckFailed {
        service: String,
        stage: String,
        attempts: u32,
        reason: String,
    },

    #[error("Deployment of service '{service}' failed during {step}: {message}")]
    DeploymentFailed {
        service: String,
        step: String,
        message: String,
    },

    #[error("Rollback finished with {} failed step(s):\n{}", .failures.len(), .failures.join("\n"))]
    Rollback { failures: Vec<String> },

    #[error("Manifest parse error: {0}")]
    ManifestParse(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Invalid state transition for '{subject}': {from} -> {to}")]
    InvalidTransition {
        subject: String,
        from: String,
        to: String,
    },

    #[error("State file error: {0}")]
    State(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(String),
}

impl KeelError {
    /// Process exit code for this error, one per top-level taxonomy entry
    pub fn exit_code(&self) -> i32 {
        match self {
            KeelError::Validation { .. } => 2,
            KeelError::Cycle { .. } => 3,
            KeelError::Plan { .. } => 4,
            KeelError::HealthCheckTimeout { .. } => 5,
            KeelError::HealthCheckFailed { .. } => 6,
            KeelError::DeploymentFailed { .. } => 7,
            KeelError::Rollback { .. } => 8,
            _ => 1,
        }
    }

    /// Whether the error is raised before any side effect happens
    pub fn is_pre_execution(&self) -> bool {
        matches!(
            self,
            KeelError::Validation { .. }
                | KeelError::Cycle { .. }
                | KeelError::Plan { .. }
                | KeelError::ManifestParse(_)
        )
    }
}

impl From<serde_yaml::Error> for KeelError {
    fn from(err: serde_yaml::Error) -> Self {
        KeelError::Yaml(err.to_string())
    }
}

fn bullet_list<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| format!("  - {}", item))
        .collect::<Vec<_>>()
        .join("\n")
}
