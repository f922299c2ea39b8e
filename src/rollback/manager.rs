//! Rollback sequencing
//!
//! Phases are undone last-first and, inside a phase, services are undone in
//! reverse dependency order. Every step is attempted; failures are recorded
//! in the report instead of aborting the rollback.

use crate::deploy::backend::{Collaborators, NotifyHook, ServiceRef, TeardownHook};
use crate::error::KeelError;
use crate::manifest::ValidatedManifest;
use crate::plan::ExecutionPlan;
use crate::settings::DEFAULT_HOOK_TIMEOUT;
use crate::state::DeploymentState;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Phase name used for recorded services the manifest no longer declares
pub const ORPHANED_PHASE: &str = "orphaned";

/// A service to undo, with the services that depend on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackTarget {
    pub service: ServiceRef,
    pub dependents: Vec<String>,
}

/// A phase whose services were applied, members in deploy order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedPhase {
    pub name: String,
    pub services: Vec<RollbackTarget>,
}

/// Outcome of undoing one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackEntry {
    pub service: String,
    pub phase: String,
    pub torn_down: bool,
    pub notified: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl RollbackEntry {
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Per-service rollback outcomes, in the order they were attempted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub entries: Vec<RollbackEntry>,
}

impl RollbackReport {
    /// One line per failed step
    pub fn failures(&self) -> Vec<String> {
        self.entries
            .iter()
            .flat_map(|e| {
                e.errors
                    .iter()
                    .map(move |err| format!("{}: {}", e.service, err))
            })
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.entries.iter().all(|e| e.succeeded())
    }

    /// Services whose teardown succeeded
    pub fn torn_down(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|e| e.torn_down)
            .map(|e| e.service.as_str())
    }

    /// `Rollback` error when any step failed
    pub fn into_error(self) -> Option<KeelError> {
        if self.is_clean() {
            None
        } else {
            Some(KeelError::Rollback {
                failures: self.failures(),
            })
        }
    }
}

/// Rollback manager
pub struct RollbackManager {
    teardown: Arc<dyn TeardownHook>,
    notify: Arc<dyn NotifyHook>,
    hook_timeout: Duration,
}

impl RollbackManager {
    pub fn new(teardown: Arc<dyn TeardownHook>, notify: Arc<dyn NotifyHook>) -> Self {
        Self {
            teardown,
            notify,
            hook_timeout: Duration::from_secs(DEFAULT_HOOK_TIMEOUT),
        }
    }

    /// Limit for each teardown and notify call
    pub fn with_hook_timeout(mut self, timeout: Duration) -> Self {
        self.hook_timeout = timeout;
        self
    }

    pub fn from_collaborators(collaborators: &Collaborators) -> Self {
        Self::new(collaborators.teardown.clone(), collaborators.notify.clone())
    }

    /// Undo `applied` (given in deploy order); always runs to completion
    pub async fn rollback(&self, applied: &[AppliedPhase]) -> RollbackReport {
        let mut report = RollbackReport::default();

        for phase in applied.iter().rev() {
            tracing::info!("Rolling back phase {}", phase.name);

            for target in phase.services.iter().rev() {
                let name = &target.service.name;
                let mut entry = RollbackEntry {
                    service: name.clone(),
                    phase: phase.name.clone(),
                    torn_down: false,
                    notified: false,
                    errors: Vec::new(),
                };

                match self.bounded("teardown", self.teardown.teardown(&target.service)).await {
                    Ok(()) => {
                        entry.torn_down = true;
                        tracing::info!("Tore down {}", name);
                    }
                    Err(e) => {
                        tracing::warn!("Teardown of {} failed: {:#}", name, e);
                        entry.errors.push(format!("teardown: {:#}", e));
                    }
                }

                let notify = self
                    .notify
                    .notify_dependents(&target.service, &target.dependents);
                match self.bounded("notify", notify).await {
                    Ok(()) => entry.notified = true,
                    Err(e) => {
                        tracing::warn!("Notifying dependents of {} failed: {:#}", name, e);
                        entry.errors.push(format!("notify: {:#}", e));
                    }
                }

                report.entries.push(entry);
            }
        }

        report
    }

    async fn bounded<F>(&self, step: &str, call: F) -> anyhow::Result<()>
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        match tokio::time::timeout(self.hook_timeout, call).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("{} timed out after {:?}", step, self.hook_timeout),
        }
    }
}

/// Rollback targets for services recorded in `state`, in plan order
///
/// With `only` non-empty, just those services are included. Recorded
/// services that the manifest no longer enables go into a trailing
/// [`ORPHANED_PHASE`] so they are undone first.
pub fn targets_from_state(
    validated: &ValidatedManifest,
    plan: &ExecutionPlan,
    state: &DeploymentState,
    only: &[String],
) -> Vec<AppliedPhase> {
    let wanted = |name: &str| only.is_empty() || only.iter().any(|o| o == name);
    let resolver = validated.resolver();

    let mut phases: Vec<AppliedPhase> = plan
        .phases
        .iter()
        .map(|phase| AppliedPhase {
            name: phase.name.clone(),
            services: phase
                .members
                .iter()
                .filter(|m| state.is_recorded(m) && wanted(m))
                .filter_map(|m| validated.service(m))
                .map(|s| RollbackTarget {
                    service: ServiceRef::from(s),
                    dependents: resolver.dependents(&s.name),
                })
                .collect(),
        })
        .filter(|p| !p.services.is_empty())
        .collect();

    let orphaned: Vec<RollbackTarget> = state
        .recorded()
        .into_iter()
        .filter(|name| plan.phase_of(name).is_none() && wanted(name))
        .map(|name| RollbackTarget {
            service: recorded_ref(validated, state, name),
            dependents: Vec::new(),
        })
        .collect();
    if !orphaned.is_empty() {
        phases.push(AppliedPhase {
            name: ORPHANED_PHASE.to_string(),
            services: orphaned,
        });
    }

    phases
}

/// Identity of a recorded service the plan no longer covers
fn recorded_ref(validated: &ValidatedManifest, state: &DeploymentState, name: &str) -> ServiceRef {
    let container = state.containers.get(name);
    let field = |key: &str| container.and_then(|c| c.field(key)).map(String::from);
    let (ip, hostname) = match state.services.get(name) {
        Some(record) => (record.ip.clone(), record.hostname.clone()),
        None => (
            field("ip").unwrap_or_default(),
            field("hostname").unwrap_or_default(),
        ),
    };
    ServiceRef {
        name: name.to_string(),
        ip,
        hostname,
        category: validated
            .service(name)
            .map(|s| s.category.clone())
            .unwrap_or_else(|| name.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{validate, ManifestParser};
    use crate::settings::DeploymentConfig;
    use crate::state::{ServiceRecord, StateTracker, StateEntry};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    /// Records calls; fails teardown for `failing`, never returns for `hanging`
    #[derive(Default)]
    struct RecordingHooks {
        calls: Mutex<Vec<String>>,
        failing: Vec<String>,
        hanging: Vec<String>,
    }

    #[async_trait]
    impl TeardownHook for RecordingHooks {
        async fn teardown(&self, service: &ServiceRef) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("teardown {}", service.name));
            if self.failing.contains(&service.name) {
                anyhow::bail!("{} is busy", service.name);
            }
            if self.hanging.contains(&service.name) {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl NotifyHook for RecordingHooks {
        async fn notify_dependents(
            &self,
            service: &ServiceRef,
            dependents: &[String],
        ) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!(
                "notify {} [{}]",
                service.name,
                dependents.join(",")
            ));
            Ok(())
        }
    }

    fn target(name: &str, dependents: &[&str]) -> RollbackTarget {
        RollbackTarget {
            service: ServiceRef {
                name: name.to_string(),
                ip: "10.0.0.2".to_string(),
                hostname: format!("{}.lan", name),
                category: name.to_string(),
            },
            dependents: dependents.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn applied() -> Vec<AppliedPhase> {
        vec![
            AppliedPhase {
                name: "phase-0".to_string(),
                services: vec![target("dns", &["postgresql", "caddy"])],
            },
            AppliedPhase {
                name: "phase-1".to_string(),
                services: vec![target("postgresql", &[]), target("caddy", &[])],
            },
        ]
    }

    #[tokio::test]
    async fn test_reverse_order() {
        let hooks = Arc::new(RecordingHooks::default());
        let manager = RollbackManager::new(hooks.clone(), hooks.clone());

        let report = manager.rollback(&applied()).await;
        assert!(report.is_clean());
        assert_eq!(
            *hooks.calls.lock().unwrap(),
            vec![
                "teardown caddy",
                "notify caddy []",
                "teardown postgresql",
                "notify postgresql []",
                "teardown dns",
                "notify dns [postgresql,caddy]",
            ]
        );
        assert_eq!(report.torn_down().collect::<Vec<_>>(), vec!["caddy", "postgresql", "dns"]);
    }

    #[tokio::test]
    async fn test_failures_are_collected_not_raised() {
        let hooks = Arc::new(RecordingHooks {
            failing: vec!["postgresql".to_string()],
            ..Default::default()
        });
        let manager = RollbackManager::new(hooks.clone(), hooks.clone());

        let report = manager.rollback(&applied()).await;
        // every service was still attempted
        assert_eq!(report.entries.len(), 3);
        assert!(!report.entries[1].torn_down);
        assert!(report.entries[1].notified);
        assert!(report.entries[2].torn_down);

        match report.into_error() {
            Some(KeelError::Rollback { failures }) => {
                assert_eq!(failures, vec!["postgresql: teardown: postgresql is busy"]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_teardown_times_out() {
        let hooks = Arc::new(RecordingHooks {
            hanging: vec!["postgresql".to_string()],
            ..Default::default()
        });
        let manager = RollbackManager::new(hooks.clone(), hooks.clone())
            .with_hook_timeout(Duration::from_secs(30));

        let report = manager.rollback(&applied()).await;
        assert_eq!(report.entries.len(), 3);
        assert!(!report.entries[1].torn_down);
        assert!(report.entries[1].errors[0].contains("timed out"));
        assert_eq!(report.torn_down().collect::<Vec<_>>(), vec!["caddy", "dns"]);
    }

    #[tokio::test]
    async fn test_missing_teardown_hook_is_not_torn_down() {
        let collaborators = Collaborators::from_hooks(&Default::default());
        let report = RollbackManager::from_collaborators(&collaborators)
            .rollback(&applied())
            .await;
        assert_eq!(report.torn_down().count(), 0);
        assert!(report.entries.iter().all(|e| e.notified));
        assert!(!report.is_clean());
    }

    #[test]
    fn test_targets_from_state() {
        let manifest = ManifestParser::parse_str(
            r#"
network:
  dns: 10.0.0.1
  gateway: 10.0.0.1
  cidr: 10.0.0.0/24
services:
  dns:
    ip: 10.0.0.5
    hostname: dns.lan
  postgresql:
    ip: 10.0.0.6
    hostname: db.lan
    depends_on: [dns]
  caddy:
    ip: 10.0.0.7
    hostname: proxy.lan
    depends_on: [dns]
"#,
        )
        .unwrap();
        let validated = validate(manifest, DeploymentConfig::defaults()).unwrap();
        let plan = crate::plan::plan(&validated).unwrap();

        let mut state = DeploymentState::new();
        for name in ["dns", "caddy"] {
            let service = validated.service(name).unwrap();
            state = StateTracker::update(
                &state,
                name,
                StateEntry::Service(ServiceRecord::for_service(service, Utc::now())),
            );
        }
        let mut gone = ServiceRecord::for_service(validated.service("dns").unwrap(), Utc::now());
        gone.ip = "10.0.0.99".to_string();
        state = StateTracker::update(&state, "legacy", StateEntry::Service(gone));
        // provisioned, but failed before it was recorded as deployed
        state = StateTracker::update(
            &state,
            "postgresql",
            StateEntry::Container(StateTracker::container_record(
                validated.service("postgresql").unwrap(),
                "ct-postgresql",
                Utc::now(),
            )),
        );

        let phases = targets_from_state(&validated, &plan, &state, &[]);
        let names: Vec<(String, Vec<String>)> = phases
            .iter()
            .map(|p| {
                (
                    p.name.clone(),
                    p.services.iter().map(|t| t.service.name.clone()).collect(),
                )
            })
            .collect();
        assert_eq!(
            names,
            vec![
                ("phase-0".to_string(), vec!["dns".to_string()]),
                (
                    "phase-1".to_string(),
                    vec!["postgresql".to_string(), "caddy".to_string()]
                ),
                (ORPHANED_PHASE.to_string(), vec!["legacy".to_string()]),
            ]
        );
        assert_eq!(phases[0].services[0].dependents, vec!["postgresql", "caddy"]);
        assert_eq!(phases[2].services[0].service.ip, "10.0.0.99");

        let only = targets_from_state(&validated, &plan, &state, &["caddy".to_string()]);
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].services[0].service.name, "caddy");
    }
}
