//! Health check engine
//!
//! Runs a service's stages in order (startup, liveness, then readiness) and
//! stops at the first failing stage. Each stage polls its probe every
//! `interval` and fails once `max_retries` probes have failed or the stage
//! timeout elapses, whichever comes first.

use super::cancel::Cancellation;
use super::check::{CheckDescriptor, HealthPlan, Stage, StagePolicy};
use super::probe::Probe;
use crate::error::KeelError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Why a check ended unhealthy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnhealthyCause {
    RetriesExhausted,
    TimedOut,
    Cancelled,
}

/// Result of running one check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckResult {
    Healthy {
        attempts: u32,
    },
    Unhealthy {
        reason: String,
        attempts: u32,
        cause: UnhealthyCause,
    },
}

impl CheckResult {
    pub fn is_healthy(&self) -> bool {
        matches!(self, CheckResult::Healthy { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            CheckResult::Healthy { attempts } | CheckResult::Unhealthy { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Outcome of one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: Stage,
    pub check: String,
    pub result: CheckResult,
    pub elapsed_ms: u64,
}

/// Outcome of a full startup/liveness/readiness run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateResult {
    pub service: String,
    pub stages: Vec<StageOutcome>,
}

impl AggregateResult {
    pub fn is_healthy(&self) -> bool {
        self.stages.iter().all(|s| s.result.is_healthy())
    }

    /// The stage that failed, if any
    pub fn failed_stage(&self) -> Option<&StageOutcome> {
        self.stages.iter().find(|s| !s.result.is_healthy())
    }

    /// Total probe attempts across stages
    pub fn attempts(&self) -> u32 {
        self.stages.iter().map(|s| s.result.attempts()).sum()
    }

    /// Error describing the failed stage
    pub fn to_error(&self) -> Option<KeelError> {
        let failed = self.failed_stage()?;
        match &failed.result {
            CheckResult::Healthy { .. } => None,
            CheckResult::Unhealthy {
                cause: UnhealthyCause::TimedOut,
                ..
            } => Some(KeelError::HealthCheckTimeout {
                service: self.service.clone(),
                stage: failed.stage.to_string(),
                elapsed_secs: Duration::from_millis(failed.elapsed_ms).as_secs(),
            }),
            CheckResult::Unhealthy {
                reason, attempts, ..
            } => Some(KeelError::HealthCheckFailed {
                service: self.service.clone(),
                stage: failed.stage.to_string(),
                attempts: *attempts,
                reason: reason.clone(),
            }),
        }
    }
}

/// Health check engine
#[derive(Clone)]
pub struct HealthCheckEngine {
    probe: Arc<dyn Probe>,
}

impl HealthCheckEngine {
    pub fn new(probe: Arc<dyn Probe>) -> Self {
        Self { probe }
    }

    /// Run one check with retry semantics
    pub async fn run_check(
        &self,
        check: &CheckDescriptor,
        policy: &StagePolicy,
        cancel: &mut Cancellation,
    ) -> CheckResult {
        let deadline = Instant::now() + policy.timeout;
        self.run_until(check, policy, deadline, cancel).await
    }

    async fn run_until(
        &self,
        check: &CheckDescriptor,
        policy: &StagePolicy,
        deadline: Instant,
        cancel: &mut Cancellation,
    ) -> CheckResult {
        let max_retries = policy.max_retries.max(1);
        let mut attempts = 0;

        loop {
            if cancel.is_cancelled() {
                return cancelled(attempts);
            }
            if Instant::now() >= deadline {
                return timed_out(check, attempts);
            }

            attempts += 1;
            tracing::debug!("Probing {} (attempt {}/{})", check, attempts, max_retries);

            let healthy = tokio::select! {
                _ = cancel.cancelled() => return cancelled(attempts),
                _ = sleep_until(deadline) => return timed_out(check, attempts),
                healthy = self.probe.probe(check) => healthy,
            };

            if healthy {
                return CheckResult::Healthy { attempts };
            }

            if attempts >= max_retries {
                return CheckResult::Unhealthy {
                    reason: format!("{} unhealthy after {} attempt(s)", check, attempts),
                    attempts,
                    cause: UnhealthyCause::RetriesExhausted,
                };
            }

            tokio::select! {
                _ = cancel.cancelled() => return cancelled(attempts),
                _ = sleep_until(deadline) => return timed_out(check, attempts),
                _ = tokio::time::sleep(policy.interval) => {}
            }
        }
    }

    /// Run startup, liveness and readiness in order, stopping at the first failure
    ///
    /// `overall` bounds the whole run; a stage gets whatever is left of it
    /// when that is shorter than the stage's own timeout.
    pub async fn run_comprehensive(
        &self,
        service: &str,
        plan: &HealthPlan,
        overall: Duration,
        cancel: &mut Cancellation,
    ) -> AggregateResult {
        let overall_deadline = Instant::now() + overall;
        let mut stages = Vec::new();

        for stage_check in plan.stages() {
            let started = Instant::now();
            let deadline = (started + plan.policy.timeout).min(overall_deadline);
            let result = self
                .run_until(&stage_check.check, &plan.policy, deadline, cancel)
                .await;
            let healthy = result.is_healthy();

            tracing::debug!(
                "Service {} {} check {}",
                service,
                stage_check.stage,
                if healthy { "passed" } else { "failed" }
            );

            stages.push(StageOutcome {
                stage: stage_check.stage,
                check: stage_check.check.to_string(),
                result,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });

            if !healthy {
                break;
            }
        }

        AggregateResult {
            service: service.to_string(),
            stages,
        }
    }
}

fn cancelled(attempts: u32) -> CheckResult {
    CheckResult::Unhealthy {
        reason: "cancelled".to_string(),
        attempts,
        cause: UnhealthyCause::Cancelled,
    }
}

fn timed_out(check: &CheckDescriptor, attempts: u32) -> CheckResult {
    CheckResult::Unhealthy {
        reason: format!("{} timed out after {} attempt(s)", check, attempts),
        attempts,
        cause: UnhealthyCause::TimedOut,
    }
}
