//! Per-service status
//!
//! Compares the persisted state with the current manifest and, on request,
//! probes the live health of deployed services.

use super::document::DeploymentState;
use super::tracker::StateTracker;
use crate::error::Result;
use crate::health::{Cancellation, HealthCheckEngine};
use crate::manifest::ValidatedManifest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::task::JoinSet;

/// How a service's recorded deployment relates to the manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Drift {
    UpToDate,
    /// Recorded, but the next deploy would touch it
    Drifted,
    NotDeployed,
    Disabled,
}

impl fmt::Display for Drift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Drift::UpToDate => write!(f, "up-to-date"),
            Drift::Drifted => write!(f, "drifted"),
            Drift::NotDeployed => write!(f, "not-deployed"),
            Drift::Disabled => write!(f, "disabled"),
        }
    }
}

/// Live health observed by a status probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveHealth {
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub enabled: bool,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_hash: Option<String>,
    pub current_hash: String,
    pub drift: Drift,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<LiveHealth>,
}

/// Status of every declared service, plus recorded services no longer enabled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub services: Vec<ServiceStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub orphaned: Vec<String>,
}

impl StatusReport {
    pub fn build(validated: &ValidatedManifest, state: &DeploymentState) -> Self {
        let diff = StateTracker::diff(validated, state);

        let services = validated
            .services()
            .iter()
            .map(|service| {
                let record = state.services.get(&service.name);
                let drift = match record {
                    _ if !service.enabled() => Drift::Disabled,
                    None => Drift::NotDeployed,
                    Some(_) if diff.to_deploy.contains(&service.name) => Drift::Drifted,
                    Some(_) => Drift::UpToDate,
                };
                ServiceStatus {
                    name: service.name.clone(),
                    enabled: service.enabled(),
                    category: service.category.clone(),
                    deployed_at: record.map(|r| r.deployed_at),
                    recorded_hash: record.map(|r| r.config_hash.clone()),
                    current_hash: service.config_hash.clone(),
                    drift,
                    health: None,
                }
            })
            .collect();

        Self {
            generation: state.generation,
            updated_at: state.updated_at,
            services,
            orphaned: diff.orphaned.into_iter().collect(),
        }
    }

    /// Run the health plan of every deployed, enabled service concurrently
    pub async fn probe(mut self, validated: &ValidatedManifest, engine: &HealthCheckEngine) -> Self {
        let timeout = validated.config().health_check_timeout;
        let mut tasks = JoinSet::new();

        for status in &self.services {
            if !status.enabled || status.drift == Drift::NotDeployed {
                continue;
            }
            let Some(plan) = validated.service(&status.name).and_then(|s| s.health.clone()) else {
                continue;
            };
            let engine = engine.clone();
            let name = status.name.clone();
            tasks.spawn(async move {
                let mut cancel = Cancellation::never();
                engine.run_comprehensive(&name, &plan, timeout, &mut cancel).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!("Status probe task failed: {}", e);
                    continue;
                }
            };
            let failed = result.failed_stage();
            let health = LiveHealth {
                healthy: result.is_healthy(),
                failed_stage: failed.map(|s| s.stage.to_string()),
                reason: failed.and_then(|s| match &s.result {
                    crate::health::CheckResult::Unhealthy { reason, .. } => Some(reason.clone()),
                    _ => None,
                }),
            };
            if let Some(status) = self.services.iter_mut().find(|s| s.name == result.service) {
                status.health = Some(health);
            }
        }

        self
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_text(&self) -> String {
        let mut out = match self.updated_at {
            Some(at) => format!("State generation {} (updated {})\n", self.generation, at),
            None => "No deployment recorded yet\n".to_string(),
        };
        for status in &self.services {
            out.push_str(&format!("  {:<20} {:<13}", status.name, status.drift.to_string()));
            if let Some(at) = status.deployed_at {
                out.push_str(&format!(" deployed {}", at.format("%Y-%m-%d %H:%M:%S")));
            }
            match status.health {
                Some(ref h) if h.healthy => out.push_str(" [healthy]"),
                Some(ref h) => out.push_str(&format!(
                    " [unhealthy: {}]",
                    h.reason.as_deref().unwrap_or("unknown")
                )),
                None => {}
            }
            out.push('\n');
        }
        if !self.orphaned.is_empty() {
            out.push_str(&format!(
                "Recorded but no longer enabled: {}\n",
                self.orphaned.join(", ")
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{CheckDescriptor, Probe};
    use crate::manifest::{validate, ManifestParser};
    use crate::settings::DeploymentConfig;
    use crate::state::{ServiceRecord, StateEntry};
    use async_trait::async_trait;
    use std::sync::Arc;

    fn validated() -> ValidatedManifest {
        let manifest = ManifestParser::parse_str(
            r#"
network:
  dns: 10.0.0.1
  gateway: 10.0.0.1
  cidr: 10.0.0.0/24
services:
  resolver:
    ip: 10.0.0.5
    hostname: resolver.lan
  database:
    ip: 10.0.0.6
    hostname: database.lan
    version: "16"
  webapp:
    ip: 10.0.0.7
    hostname: webapp.lan
  legacy:
    enabled: false
    ip: 10.0.0.9
    hostname: legacy.lan
"#,
        )
        .unwrap();
        validate(manifest, DeploymentConfig::defaults()).unwrap()
    }

    fn deployed(validated: &ValidatedManifest) -> DeploymentState {
        let mut state = DeploymentState::new();
        for name in ["resolver", "database"] {
            let mut record = ServiceRecord::for_service(validated.service(name).unwrap(), Utc::now());
            if name == "database" {
                record.version = Some("15".to_string());
            }
            state = StateTracker::update(&state, name, StateEntry::Service(record));
            state = StateTracker::update(
                &state,
                name,
                StateEntry::Container(StateTracker::container_record(
                    validated.service(name).unwrap(),
                    name,
                    Utc::now(),
                )),
            );
        }
        state
    }

    #[test]
    fn test_drift_classification() {
        let validated = validated();
        let report = StatusReport::build(&validated, &deployed(&validated));

        let drift: Vec<(&str, Drift)> = report
            .services
            .iter()
            .map(|s| (s.name.as_str(), s.drift))
            .collect();
        assert_eq!(
            drift,
            vec![
                ("resolver", Drift::UpToDate),
                ("database", Drift::Drifted),
                ("webapp", Drift::NotDeployed),
                ("legacy", Drift::Disabled),
            ]
        );
        assert!(report.to_text().contains("not-deployed"));
    }

    struct DownProbe;

    #[async_trait]
    impl Probe for DownProbe {
        async fn probe(&self, check: &CheckDescriptor) -> bool {
            !check.to_string().contains("database")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_fills_live_health() {
        let validated = validated();
        let engine = HealthCheckEngine::new(Arc::new(DownProbe));
        let report = StatusReport::build(&validated, &deployed(&validated))
            .probe(&validated, &engine)
            .await;

        let health = |name: &str| {
            report
                .services
                .iter()
                .find(|s| s.name == name)
                .and_then(|s| s.health.clone())
        };
        assert!(health("resolver").unwrap().healthy);
        let database = health("database").unwrap();
        assert!(!database.healthy);
        assert_eq!(database.failed_stage.as_deref(), Some("startup"));
        // never deployed, never probed
        assert!(health("webapp").is_none());
    }
}
