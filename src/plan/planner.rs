//! Phase planning
//!
//! Turns a validated manifest into an ordered list of phases. Declared
//! phase groups are checked and emitted as written; otherwise phases are
//! derived from the dependency graph, each service landing in the first
//! phase after all of its enabled dependencies.

use crate::error::{KeelError, Result};
use crate::manifest::ValidatedManifest;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// How the phases were obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanMode {
    Explicit,
    Derived,
}

impl fmt::Display for PlanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanMode::Explicit => write!(f, "explicit"),
            PlanMode::Derived => write!(f, "derived"),
        }
    }
}

/// Barrier-separated group of services
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub members: Vec<String>,
}

/// Ordered phases
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub mode: PlanMode,
    pub phases: Vec<Phase>,
}

impl ExecutionPlan {
    /// Index of the phase containing `service`
    pub fn phase_of(&self, service: &str) -> Option<usize> {
        self.phases
            .iter()
            .position(|p| p.members.iter().any(|m| m == service))
    }

    /// All members in plan order
    pub fn services(&self) -> impl Iterator<Item = &String> {
        self.phases.iter().flat_map(|p| p.members.iter())
    }

    pub fn service_count(&self) -> usize {
        self.phases.iter().map(|p| p.members.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_text(&self) -> String {
        let mut out = format!(
            "Execution plan ({}, {} phase(s), {} service(s))\n",
            self.mode,
            self.phases.len(),
            self.service_count()
        );
        for (i, phase) in self.phases.iter().enumerate() {
            out.push_str(&format!(
                "  {}. {}: {}\n",
                i + 1,
                phase.name,
                phase.members.join(", ")
            ));
        }
        out
    }
}

/// Problem with declared phase groups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanViolation {
    DisabledMember {
        phase: String,
        service: String,
    },
    DuplicateMember {
        service: String,
        phases: Vec<String>,
    },
    ConflictingPhase {
        service: String,
        listed: String,
        declared: String,
    },
    Unassigned {
        service: String,
    },
    OrderViolation {
        service: String,
        phase: String,
        dependency: String,
        dependency_phase: String,
    },
}

impl fmt::Display for PlanViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanViolation::DisabledMember { phase, service } => write!(
                f,
                "phase '{}' lists disabled service '{}'",
                phase, service
            ),
            PlanViolation::DuplicateMember { service, phases } => write!(
                f,
                "service '{}' is listed in more than one phase: {}",
                service,
                phases.join(", ")
            ),
            PlanViolation::ConflictingPhase {
                service,
                listed,
                declared,
            } => write!(
                f,
                "service '{}' is listed in phase '{}' but declares phase '{}'",
                service, listed, declared
            ),
            PlanViolation::Unassigned { service } => {
                write!(f, "enabled service '{}' is not assigned to any phase", service)
            }
            PlanViolation::OrderViolation {
                service,
                phase,
                dependency,
                dependency_phase,
            } => write!(
                f,
                "service '{}' (phase '{}') depends on '{}' (phase '{}'), which does not run earlier",
                service, phase, dependency, dependency_phase
            ),
        }
    }
}

/// Build the execution plan for a validated manifest
pub fn plan(validated: &ValidatedManifest) -> Result<ExecutionPlan> {
    let plan = if validated.explicit_phases().is_some() {
        explicit_plan(validated)?
    } else {
        derived_plan(validated)
    };

    tracing::debug!(
        "Planned {} phase(s) for {} service(s) ({})",
        plan.phases.len(),
        plan.service_count(),
        plan.mode
    );
    Ok(plan)
}

/// Bucket the topological order into the fewest phases
fn derived_plan(validated: &ValidatedManifest) -> ExecutionPlan {
    let mut depth: HashMap<&str, usize> = HashMap::new();

    for name in validated.topo_order() {
        let Some(service) = validated.service(name).filter(|s| s.enabled()) else {
            continue;
        };
        let level = service
            .depends_on()
            .iter()
            .filter_map(|dep| depth.get(dep.as_str()))
            .map(|d| d + 1)
            .max()
            .unwrap_or(0);
        depth.insert(name.as_str(), level);
    }

    let count = depth.values().max().map(|m| m + 1).unwrap_or(0);
    let mut phases: Vec<Phase> = (0..count)
        .map(|i| Phase {
            name: format!("phase-{}", i),
            members: Vec::new(),
        })
        .collect();

    // members in declaration order
    for service in validated.enabled_services() {
        if let Some(&level) = depth.get(service.name.as_str()) {
            phases[level].members.push(service.name.clone());
        }
    }

    ExecutionPlan {
        mode: PlanMode::Derived,
        phases,
    }
}

/// Check declared phase groups and emit them in declared order
fn explicit_plan(validated: &ValidatedManifest) -> Result<ExecutionPlan> {
    let Some(groups) = validated.explicit_phases() else {
        return Ok(derived_plan(validated));
    };
    let group_names: Vec<&String> = groups.keys().collect();
    let mut violations = Vec::new();
    let mut assigned: HashMap<&str, usize> = HashMap::new();
    let mut members: Vec<Vec<String>> = vec![Vec::new(); groups.len()];

    for (index, (phase, listed)) in groups.iter().enumerate() {
        for service in listed {
            let enabled = validated.is_enabled(service);
            if validated.service(service).is_some() && !enabled {
                violations.push(PlanViolation::DisabledMember {
                    phase: phase.clone(),
                    service: service.clone(),
                });
                continue;
            }
            if !enabled {
                continue;
            }
            match assigned.get(service.as_str()) {
                Some(&first) => violations.push(PlanViolation::DuplicateMember {
                    service: service.clone(),
                    phases: vec![group_names[first].clone(), phase.clone()],
                }),
                None => {
                    assigned.insert(service.as_str(), index);
                    members[index].push(service.clone());
                }
            }
        }
    }

    for service in validated.enabled_services() {
        let Some(declared) = service.node.phase.as_deref() else {
            continue;
        };
        let Some(declared_index) = groups.position(declared) else {
            continue;
        };
        match assigned.get(service.name.as_str()) {
            Some(&listed) if listed != declared_index => {
                violations.push(PlanViolation::ConflictingPhase {
                    service: service.name.clone(),
                    listed: group_names[listed].clone(),
                    declared: declared.to_string(),
                })
            }
            Some(_) => {}
            None => {
                assigned.insert(service.name.as_str(), declared_index);
                members[declared_index].push(service.name.clone());
            }
        }
    }

    for service in validated.enabled_services() {
        let Some(&own) = assigned.get(service.name.as_str()) else {
            violations.push(PlanViolation::Unassigned {
                service: service.name.clone(),
            });
            continue;
        };
        for dep in service.depends_on() {
            if let Some(&dep_index) = assigned.get(dep.as_str()) {
                if dep_index >= own {
                    violations.push(PlanViolation::OrderViolation {
                        service: service.name.clone(),
                        phase: group_names[own].clone(),
                        dependency: dep.clone(),
                        dependency_phase: group_names[dep_index].clone(),
                    });
                }
            }
        }
    }

    if !violations.is_empty() {
        return Err(KeelError::Plan { violations });
    }

    let phases = group_names
        .into_iter()
        .zip(members)
        .filter(|(_, m)| !m.is_empty())
        .map(|(name, members)| Phase {
            name: name.clone(),
            members,
        })
        .collect();

    Ok(ExecutionPlan {
        mode: PlanMode::Explicit,
        phases,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{validate, ManifestParser};
    use crate::settings::DeploymentConfig;

    fn validated(yaml: &str) -> ValidatedManifest {
        let manifest = ManifestParser::parse_str(&format!(
            "network:\n  dns: 10.0.0.1\n  gateway: 10.0.0.1\n  cidr: 10.0.0.0/24\n{}",
            yaml
        ))
        .unwrap();
        validate(manifest, DeploymentConfig::defaults()).unwrap()
    }

    fn names(plan: &ExecutionPlan) -> Vec<(String, Vec<String>)> {
        plan.phases
            .iter()
            .map(|p| (p.name.clone(), p.members.clone()))
            .collect()
    }

    const FLEET: &str = r#"
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
"#;

    #[test]
    fn test_derived_phases() {
        let plan = plan(&validated(FLEET)).unwrap();
        assert_eq!(plan.mode, PlanMode::Derived);
        assert_eq!(
            names(&plan),
            vec![
                ("phase-0".to_string(), vec!["dns".to_string()]),
                (
                    "phase-1".to_string(),
                    vec!["postgresql".to_string(), "caddy".to_string()]
                ),
            ]
        );
    }

    #[test]
    fn test_plan_is_deterministic() {
        let manifest = validated(FLEET);
        let first = plan(&manifest).unwrap().to_json().unwrap();
        let second = plan(&manifest).unwrap().to_json().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_dependencies_precede_dependents() {
        let manifest = validated(
            r#"
services:
  grafana:
    ip: 10.0.0.9
    hostname: grafana.lan
    depends_on: [prometheus, authentik]
  authentik:
    ip: 10.0.0.8
    hostname: auth.lan
    depends_on: [postgresql]
  prometheus:
    ip: 10.0.0.10
    hostname: prom.lan
  postgresql:
    ip: 10.0.0.6
    hostname: db.lan
"#,
        );
        let plan = plan(&manifest).unwrap();
        for service in manifest.enabled_services() {
            let own = plan.phase_of(&service.name).unwrap();
            for dep in service.depends_on() {
                assert!(plan.phase_of(dep).unwrap() < own, "{} before {}", dep, service.name);
            }
        }
        assert_eq!(plan.service_count(), 4);
        assert_eq!(plan.phases[0].members, vec!["prometheus", "postgresql"]);
    }

    #[test]
    fn test_disabled_services_excluded_and_unconstraining() {
        let manifest = validated(
            r#"
services:
  dns:
    enabled: false
    ip: 10.0.0.5
    hostname: dns.lan
  caddy:
    ip: 10.0.0.7
    hostname: proxy.lan
    depends_on: [dns]
"#,
        );
        let plan = plan(&manifest).unwrap();
        assert_eq!(
            names(&plan),
            vec![("phase-0".to_string(), vec!["caddy".to_string()])]
        );
    }

    #[test]
    fn test_explicit_phases_verbatim() {
        let manifest = validated(&format!(
            "{}{}",
            FLEET,
            r#"
deployment_phases:
  infrastructure: [dns]
  unused: []
  data: [caddy, postgresql]
"#
        ));
        let plan = plan(&manifest).unwrap();
        assert_eq!(plan.mode, PlanMode::Explicit);
        assert_eq!(
            names(&plan),
            vec![
                ("infrastructure".to_string(), vec!["dns".to_string()]),
                (
                    "data".to_string(),
                    vec!["caddy".to_string(), "postgresql".to_string()]
                ),
            ]
        );
        assert!(plan.to_text().contains("infrastructure: dns"));
    }

    #[test]
    fn test_explicit_phase_violations() {
        let manifest = validated(
            r#"
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
  legacy:
    enabled: false
    ip: 10.0.0.8
    hostname: legacy.lan
deployment_phases:
  first: [postgresql, legacy]
  second: [dns, postgresql]
"#,
        );
        let violations = match plan(&manifest).unwrap_err() {
            KeelError::Plan { violations } => violations,
            other => panic!("unexpected error: {}", other),
        };

        assert!(violations.contains(&PlanViolation::DisabledMember {
            phase: "first".to_string(),
            service: "legacy".to_string()
        }));
        assert!(violations.contains(&PlanViolation::DuplicateMember {
            service: "postgresql".to_string(),
            phases: vec!["first".to_string(), "second".to_string()]
        }));
        assert!(violations.contains(&PlanViolation::Unassigned {
            service: "caddy".to_string()
        }));
        assert!(violations.contains(&PlanViolation::OrderViolation {
            service: "postgresql".to_string(),
            phase: "first".to_string(),
            dependency: "dns".to_string(),
            dependency_phase: "second".to_string()
        }));
    }

    #[test]
    fn test_node_phase_field_assigns_and_conflicts() {
        let manifest = validated(
            r#"
services:
  dns:
    ip: 10.0.0.5
    hostname: dns.lan
    phase: base
  caddy:
    ip: 10.0.0.7
    hostname: proxy.lan
    depends_on: [dns]
    phase: edge
deployment_phases:
  base: []
  edge: []
"#,
        );
        let plan = plan(&manifest).unwrap();
        assert_eq!(plan.phase_of("dns"), Some(0));
        assert_eq!(plan.phase_of("caddy"), Some(1));

        let conflicting = validated(
            r#"
services:
  dns:
    ip: 10.0.0.5
    hostname: dns.lan
    phase: edge
deployment_phases:
  base: [dns]
  edge: []
"#,
        );
        match super::plan(&conflicting).unwrap_err() {
            KeelError::Plan { violations } => assert_eq!(
                violations,
                vec![PlanViolation::ConflictingPhase {
                    service: "dns".to_string(),
                    listed: "base".to_string(),
                    declared: "edge".to_string()
                }]
            ),
            other => panic!("unexpected error: {}", other),
        }
    }
}
