//! Per-service and per-phase deployment states, and the run report

use crate::error::{KeelError, Result};
use crate::health::{AggregateResult, CheckResult, UnhealthyCause};
use crate::rollback::RollbackReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Service state during a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    #[default]
    Pending,
    /// Waiting for dependencies to become healthy
    AwaitingDependencies,
    /// Collaborators are being called
    Deploying,
    HealthChecking,
    Healthy,
    Failed,
}

impl ServiceState {
    /// Whether `self -> to` is a legal transition
    pub fn can_transition_to(self, to: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, to),
            (Pending, AwaitingDependencies)
                | (Pending, Healthy)
                | (Pending, Failed)
                | (AwaitingDependencies, Deploying)
                | (AwaitingDependencies, Failed)
                | (Deploying, HealthChecking)
                | (Deploying, Failed)
                | (HealthChecking, Healthy)
                | (HealthChecking, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ServiceState::Healthy | ServiceState::Failed)
    }

    /// Reached `Deploying` or a later state
    pub fn reached_deploying(self) -> bool {
        matches!(
            self,
            ServiceState::Deploying | ServiceState::HealthChecking | ServiceState::Healthy
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Pending => write!(f, "pending"),
            ServiceState::AwaitingDependencies => write!(f, "awaiting_dependencies"),
            ServiceState::Deploying => write!(f, "deploying"),
            ServiceState::HealthChecking => write!(f, "health_checking"),
            ServiceState::Healthy => write!(f, "healthy"),
            ServiceState::Failed => write!(f, "failed"),
        }
    }
}

/// Phase state during a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
}

impl PhaseState {
    pub fn can_transition_to(self, to: PhaseState) -> bool {
        use PhaseState::*;
        matches!(
            (self, to),
            (Pending, Running) | (Running, Complete) | (Running, Failed)
        )
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseState::Pending => write!(f, "pending"),
            PhaseState::Running => write!(f, "running"),
            PhaseState::Complete => write!(f, "complete"),
            PhaseState::Failed => write!(f, "failed"),
        }
    }
}

/// What the run did with a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceAction {
    /// Provisioned, configured and checked
    Deployed,
    /// Reconfigured and checked on an existing compute unit
    Updated,
    /// Matched persisted state; no collaborator calls
    Unchanged,
    /// Not attempted because the run stopped earlier
    Skipped,
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceAction::Deployed => write!(f, "deployed"),
            ServiceAction::Updated => write!(f, "updated"),
            ServiceAction::Unchanged => write!(f, "unchanged"),
            ServiceAction::Skipped => write!(f, "skipped"),
        }
    }
}

/// Why a service failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// A collaborator call failed after all retries
    Deployment { step: String },
    HealthCheckFailed { stage: String, attempts: u32 },
    HealthCheckTimeout { stage: String, elapsed_secs: u64 },
    /// Stopped because a sibling failed
    Cancelled,
}

/// Failure of a single service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceFailure {
    pub service: String,
    #[serde(flatten)]
    pub kind: FailureKind,
    pub message: String,
}

impl ServiceFailure {
    /// Map onto the error taxonomy
    pub fn to_error(&self) -> KeelError {
        match &self.kind {
            FailureKind::Deployment { step } => KeelError::DeploymentFailed {
                service: self.service.clone(),
                step: step.clone(),
                message: self.message.clone(),
            },
            FailureKind::HealthCheckFailed { stage, attempts } => KeelError::HealthCheckFailed {
                service: self.service.clone(),
                stage: stage.clone(),
                attempts: *attempts,
                reason: self.message.clone(),
            },
            FailureKind::HealthCheckTimeout {
                stage,
                elapsed_secs,
            } => KeelError::HealthCheckTimeout {
                service: self.service.clone(),
                stage: stage.clone(),
                elapsed_secs: *elapsed_secs,
            },
            FailureKind::Cancelled => KeelError::DeploymentFailed {
                service: self.service.clone(),
                step: "cancelled".to_string(),
                message: self.message.clone(),
            },
        }
    }

    /// Failure from a health run that did not pass
    pub fn from_health(result: &AggregateResult) -> Option<Self> {
        let failed = result.failed_stage()?;
        let CheckResult::Unhealthy {
            reason,
            attempts,
            cause,
        } = &failed.result
        else {
            return None;
        };

        let stage = failed.stage.to_string();
        let kind = match cause {
            UnhealthyCause::Cancelled => FailureKind::Cancelled,
            UnhealthyCause::TimedOut => FailureKind::HealthCheckTimeout {
                stage,
                elapsed_secs: failed.elapsed_ms / 1000,
            },
            UnhealthyCause::RetriesExhausted => FailureKind::HealthCheckFailed {
                stage,
                attempts: *attempts,
            },
        };

        Some(Self {
            service: result.service.clone(),
            kind,
            message: reason.clone(),
        })
    }
}

impl fmt::Display for ServiceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_error())
    }
}

/// Service line in the run report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceReport {
    pub name: String,
    pub state: ServiceState,
    pub action: ServiceAction,
    /// Collaborator and probe attempts spent
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Phase line in the run report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub name: String,
    pub status: PhaseState,
    pub services: Vec<ServiceReport>,
}

/// Report of one deploy run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dry_run: bool,
    pub phases: Vec<PhaseReport>,
    /// First failure that halted the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ServiceFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackReport>,
}

impl DeploymentReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    pub fn service(&self, name: &str) -> Option<&ServiceReport> {
        self.phases
            .iter()
            .flat_map(|p| p.services.iter())
            .find(|s| s.name == name)
    }

    /// Error for the run; the original failure wins over rollback failures
    pub fn failure_error(&self) -> Option<KeelError> {
        self.failure.as_ref().map(|f| f.to_error())
    }

    pub fn to_text(&self) -> String {
        let mut out = format!("Run {}\n", self.run_id);
        for phase in &self.phases {
            out.push_str(&format!("  {} [{}]\n", phase.name, phase.status));
            for service in &phase.services {
                out.push_str(&format!(
                    "    {:<20} {:<16} {}",
                    service.name,
                    service.state.to_string(),
                    service.action
                ));
                if let Some(ref error) = service.error {
                    out.push_str(&format!(" ({})", error));
                }
                out.push('\n');
            }
        }
        if let Some(ref failure) = self.failure {
            out.push_str(&format!("Failed: {}\n", failure));
        }
        if let Some(ref rollback) = self.rollback {
            let failed = rollback.entries.iter().filter(|e| !e.succeeded()).count();
            out.push_str(&format!(
                "Rolled back {} service(s), {} with errors\n",
                rollback.entries.len(),
                failed
            ));
        }
        out
    }
}

/// Apply a service transition, rejecting illegal ones
pub fn transition(service: &str, from: &mut ServiceState, to: ServiceState) -> Result<()> {
    if !from.can_transition_to(to) {
        return Err(KeelError::InvalidTransition {
            subject: service.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    *from = to;
    Ok(())
}

/// Apply a phase transition, rejecting illegal ones
pub fn transition_phase(phase: &str, from: &mut PhaseState, to: PhaseState) -> Result<()> {
    if !from.can_transition_to(to) {
        return Err(KeelError::InvalidTransition {
            subject: phase.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    *from = to;
    Ok(())
}
