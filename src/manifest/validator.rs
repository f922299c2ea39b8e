//! Manifest validation
//!
//! Every check runs over the whole manifest and all violations are reported
//! together. Only a manifest with no violations is checked for cycles and
//! turned into a [`ValidatedManifest`].

use super::config::{Manifest, PhaseMap, ServiceNode};
use crate::error::{KeelError, Result};
use crate::graph::DependencyResolver;
use crate::health::{CheckTarget, HealthPlan, PatternRegistry, Stage};
use crate::settings::DeploymentConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::OnceLock;

/// A single validation failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    MissingSection {
        section: String,
    },
    NoServices,
    IncompleteNetwork {
        field: String,
    },
    MissingIdentity {
        service: String,
        field: String,
    },
    InvalidIp {
        service: String,
        ip: String,
    },
    OutsideSubnet {
        service: String,
        ip: String,
        cidr: String,
    },
    InvalidHostname {
        service: String,
        hostname: String,
    },
    DanglingDependency {
        service: String,
        dependency: String,
    },
    SelfDependency {
        service: String,
    },
    DuplicateIp {
        ip: String,
        services: Vec<String>,
    },
    DuplicateHostname {
        hostname: String,
        services: Vec<String>,
    },
    CoreServiceDisabled {
        service: String,
    },
    UnknownPhase {
        service: String,
        phase: String,
    },
    UnknownPhaseMember {
        phase: String,
        service: String,
    },
    PhaseOrder {
        service: String,
        phase: String,
        dependency: String,
        dependency_phase: String,
    },
    HealthCheck {
        service: String,
        stage: Stage,
        message: String,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::MissingSection { section } => {
                write!(f, "missing required section '{}'", section)
            }
            Violation::NoServices => write!(f, "section 'services' declares no services"),
            Violation::IncompleteNetwork { field } => {
                write!(f, "network config is missing '{}'", field)
            }
            Violation::MissingIdentity { service, field } => {
                write!(f, "service '{}' has no {}", service, field)
            }
            Violation::InvalidIp { service, ip } => {
                write!(f, "service '{}' has invalid ip '{}'", service, ip)
            }
            Violation::OutsideSubnet { service, ip, cidr } => write!(
                f,
                "service '{}' ip {} is outside network {}",
                service, ip, cidr
            ),
            Violation::InvalidHostname { service, hostname } => {
                write!(f, "service '{}' has invalid hostname '{}'", service, hostname)
            }
            Violation::DanglingDependency {
                service,
                dependency,
            } => write!(
                f,
                "service '{}' depends on undeclared service '{}'",
                service, dependency
            ),
            Violation::SelfDependency { service } => {
                write!(f, "service '{}' depends on itself", service)
            }
            Violation::DuplicateIp { ip, services } => write!(
                f,
                "ip {} is used by multiple services: {}",
                ip,
                services.join(", ")
            ),
            Violation::DuplicateHostname { hostname, services } => write!(
                f,
                "hostname {} is used by multiple services: {}",
                hostname,
                services.join(", ")
            ),
            Violation::CoreServiceDisabled { service } => {
                write!(f, "core service '{}' cannot be disabled", service)
            }
            Violation::UnknownPhase { service, phase } => write!(
                f,
                "service '{}' is assigned to undeclared phase '{}'",
                service, phase
            ),
            Violation::UnknownPhaseMember { phase, service } => write!(
                f,
                "phase '{}' lists undeclared service '{}'",
                phase, service
            ),
            Violation::PhaseOrder {
                service,
                phase,
                dependency,
                dependency_phase,
            } => write!(
                f,
                "service '{}' in phase '{}' must come after its dependency '{}' in phase '{}'",
                service, phase, dependency, dependency_phase
            ),
            Violation::HealthCheck {
                service,
                stage,
                message,
            } => write!(
                f,
                "service '{}' {} health check: {}",
                service, stage, message
            ),
        }
    }
}

/// A service after validation, with everything the later stages need
#[derive(Debug, Clone)]
pub struct ResolvedService {
    pub name: String,
    pub node: ServiceNode,
    pub ip: String,
    pub hostname: String,
    /// Pattern registry category
    pub category: String,
    /// Resolved health checks; `None` for disabled services
    pub health: Option<HealthPlan>,
    pub config_hash: String,
}

impl ResolvedService {
    pub fn enabled(&self) -> bool {
        self.node.enabled
    }

    pub fn depends_on(&self) -> &[String] {
        &self.node.depends_on
    }

    pub fn target(&self) -> CheckTarget {
        CheckTarget::new(&self.name, &self.ip, &self.hostname)
    }
}

/// A manifest that passed validation and cycle detection
#[derive(Debug, Clone)]
pub struct ValidatedManifest {
    manifest: Manifest,
    services: Vec<ResolvedService>,
    config: DeploymentConfig,
    topo_order: Vec<String>,
    warnings: Vec<String>,
}

impl ValidatedManifest {
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// All services in declaration order
    pub fn services(&self) -> &[ResolvedService] {
        &self.services
    }

    pub fn service(&self, name: &str) -> Option<&ResolvedService> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Enabled services in declaration order
    pub fn enabled_services(&self) -> impl Iterator<Item = &ResolvedService> {
        self.services.iter().filter(|s| s.enabled())
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.service(name).map(|s| s.enabled()).unwrap_or(false)
    }

    /// Effective deployment configuration
    pub fn config(&self) -> &DeploymentConfig {
        &self.config
    }

    /// Topological order over all declared services, dependencies first
    pub fn topo_order(&self) -> &[String] {
        &self.topo_order
    }

    /// Non-fatal findings
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Explicit phase groups, when declared and non-empty
    pub fn explicit_phases(&self) -> Option<&PhaseMap> {
        self.manifest
            .deployment_phases
            .as_ref()
            .filter(|p| !p.is_empty())
    }

    /// Dependency graph over all declared services
    pub fn resolver(&self) -> DependencyResolver {
        DependencyResolver::new(
            self.services
                .iter()
                .map(|s| (s.name.clone(), s.depends_on().iter())),
        )
    }

    /// Dependency graph restricted to enabled services
    pub fn enabled_resolver(&self) -> DependencyResolver {
        DependencyResolver::new(
            self.enabled_services()
                .map(|s| (s.name.clone(), s.depends_on().iter())),
        )
    }
}

/// Manifest validator
pub struct ManifestValidator<'a> {
    registry: &'a PatternRegistry,
}

impl<'a> ManifestValidator<'a> {
    pub fn new(registry: &'a PatternRegistry) -> Self {
        Self { registry }
    }

    /// Validate a manifest under the given effective configuration
    pub fn validate(&self, manifest: Manifest, config: DeploymentConfig) -> Result<ValidatedManifest> {
        let mut violations = Vec::new();
        let mut warnings = Vec::new();

        check_sections(&manifest, &mut violations);
        let services = self.check_services(&manifest, &config, &mut violations, &mut warnings);
        check_duplicates(&services, &mut violations);
        check_phases(&manifest, &mut violations);

        if !violations.is_empty() {
            return Err(KeelError::Validation { violations });
        }

        let topo_order = DependencyResolver::new(
            services
                .iter()
                .map(|s| (s.name.clone(), s.depends_on().iter())),
        )
        .resolve()?;

        for warning in &warnings {
            tracing::warn!("{}", warning);
        }

        Ok(ValidatedManifest {
            manifest,
            services,
            config,
            topo_order,
            warnings,
        })
    }

    fn check_services(
        &self,
        manifest: &Manifest,
        config: &DeploymentConfig,
        violations: &mut Vec<Violation>,
        warnings: &mut Vec<String>,
    ) -> Vec<ResolvedService> {
        let subnet = manifest
            .network
            .as_ref()
            .and_then(|n| n.cidr.as_deref())
            .and_then(Subnet::parse);
        let mut resolved = Vec::new();

        for (name, node) in manifest.service_entries() {
            if node.core && !node.enabled {
                violations.push(Violation::CoreServiceDisabled {
                    service: name.clone(),
                });
            }

            for dep in &node.depends_on {
                if dep == name {
                    violations.push(Violation::SelfDependency {
                        service: name.clone(),
                    });
                    continue;
                }
                match manifest.service(dep) {
                    None => violations.push(Violation::DanglingDependency {
                        service: name.clone(),
                        dependency: dep.clone(),
                    }),
                    Some(target) if node.enabled && !target.enabled => warnings.push(format!(
                        "service '{}' depends on disabled service '{}'; treating it as satisfied",
                        name, dep
                    )),
                    Some(_) => {}
                }
            }

            let ip = match node.ip.as_deref() {
                Some(ip) => {
                    check_ip(name, node, ip, subnet.as_ref(), violations);
                    Some(ip)
                }
                None => {
                    violations.push(Violation::MissingIdentity {
                        service: name.clone(),
                        field: "ip".to_string(),
                    });
                    None
                }
            };

            let hostname = match node.hostname.as_deref() {
                Some(hostname) => {
                    if !is_valid_hostname(hostname) {
                        violations.push(Violation::InvalidHostname {
                            service: name.clone(),
                            hostname: hostname.to_string(),
                        });
                    }
                    Some(hostname)
                }
                None => {
                    violations.push(Violation::MissingIdentity {
                        service: name.clone(),
                        field: "hostname".to_string(),
                    });
                    None
                }
            };

            let (Some(ip), Some(hostname)) = (ip, hostname) else {
                continue;
            };

            let category = node.category_or(name).to_string();
            let target = CheckTarget::new(name, ip, hostname);
            let health = if node.enabled {
                match self.registry.resolve_plan(
                    &category,
                    node.health.as_ref(),
                    &target,
                    config.default_stage_policy(),
                ) {
                    Ok(plan) => Some(plan),
                    Err(unresolved) => {
                        violations.push(Violation::HealthCheck {
                            service: name.clone(),
                            stage: unresolved.stage,
                            message: unresolved.message,
                        });
                        None
                    }
                }
            } else {
                None
            };

            resolved.push(ResolvedService {
                name: name.clone(),
                node: node.clone(),
                ip: ip.to_string(),
                hostname: hostname.to_string(),
                category,
                health,
                config_hash: node.config_hash(),
            });
        }

        resolved
    }
}

/// Validate with the built-in pattern registry
pub fn validate(manifest: Manifest, config: DeploymentConfig) -> Result<ValidatedManifest> {
    ManifestValidator::new(PatternRegistry::builtin()).validate(manifest, config)
}

fn check_sections(manifest: &Manifest, violations: &mut Vec<Violation>) {
    match &manifest.network {
        None => violations.push(Violation::MissingSection {
            section: "network".to_string(),
        }),
        Some(network) => {
            let fields = [
                ("dns", &network.dns),
                ("gateway", &network.gateway),
                ("cidr", &network.cidr),
            ];
            for (field, value) in fields {
                if value.as_deref().map(str::trim).unwrap_or("").is_empty() {
                    violations.push(Violation::IncompleteNetwork {
                        field: field.to_string(),
                    });
                }
            }
        }
    }

    match &manifest.services {
        None => violations.push(Violation::MissingSection {
            section: "services".to_string(),
        }),
        Some(services) if services.is_empty() => violations.push(Violation::NoServices),
        Some(_) => {}
    }
}

fn check_ip(
    name: &str,
    node: &ServiceNode,
    ip: &str,
    subnet: Option<&Subnet>,
    violations: &mut Vec<Violation>,
) {
    match ip.parse::<IpAddr>() {
        Err(_) => violations.push(Violation::InvalidIp {
            service: name.to_string(),
            ip: ip.to_string(),
        }),
        Ok(IpAddr::V4(addr)) if node.enabled => {
            if let Some(subnet) = subnet {
                if !subnet.contains(addr) {
                    violations.push(Violation::OutsideSubnet {
                        service: name.to_string(),
                        ip: ip.to_string(),
                        cidr: subnet.cidr.clone(),
                    });
                }
            }
        }
        Ok(_) => {}
    }
}

/// Report every ip/hostname claimed by more than one enabled service
fn check_duplicates(services: &[ResolvedService], violations: &mut Vec<Violation>) {
    let mut by_ip: Vec<(String, Vec<String>)> = Vec::new();
    let mut by_hostname: Vec<(String, Vec<String>)> = Vec::new();

    for service in services.iter().filter(|s| s.enabled()) {
        group(&mut by_ip, &service.ip, &service.name);
        group(&mut by_hostname, &service.hostname.to_lowercase(), &service.name);
    }

    for (ip, names) in by_ip.into_iter().filter(|(_, n)| n.len() > 1) {
        violations.push(Violation::DuplicateIp { ip, services: names });
    }
    for (hostname, names) in by_hostname.into_iter().filter(|(_, n)| n.len() > 1) {
        violations.push(Violation::DuplicateHostname {
            hostname,
            services: names,
        });
    }
}

fn group(groups: &mut Vec<(String, Vec<String>)>, key: &str, name: &str) {
    match groups.iter_mut().find(|(k, _)| k == key) {
        Some((_, names)) => names.push(name.to_string()),
        None => groups.push((key.to_string(), vec![name.to_string()])),
    }
}

/// Phase references and node-level phase ordering
fn check_phases(manifest: &Manifest, violations: &mut Vec<Violation>) {
    let empty = PhaseMap::new();
    let phases = manifest.deployment_phases.as_ref().unwrap_or(&empty);

    for (phase, members) in phases.iter() {
        for member in members {
            if manifest.service(member).is_none() {
                violations.push(Violation::UnknownPhaseMember {
                    phase: phase.clone(),
                    service: member.clone(),
                });
            }
        }
    }

    let mut index: HashMap<&str, usize> = HashMap::new();
    for (name, node) in manifest.service_entries() {
        let Some(phase) = node.phase.as_deref() else {
            continue;
        };
        match phases.position(phase) {
            Some(pos) => {
                index.insert(name.as_str(), pos);
            }
            None => violations.push(Violation::UnknownPhase {
                service: name.clone(),
                phase: phase.to_string(),
            }),
        }
    }

    for (name, node) in manifest.service_entries() {
        if !node.enabled {
            continue;
        }
        let Some(&own) = index.get(name.as_str()) else {
            continue;
        };
        for dep in &node.depends_on {
            let dep_enabled = manifest.service(dep).map(|d| d.enabled).unwrap_or(false);
            if !dep_enabled {
                continue;
            }
            if let Some(&dep_index) = index.get(dep.as_str()) {
                if dep_index >= own {
                    violations.push(Violation::PhaseOrder {
                        service: name.clone(),
                        phase: node.phase.clone().unwrap_or_default(),
                        dependency: dep.clone(),
                        dependency_phase: manifest
                            .service(dep)
                            .and_then(|d| d.phase.clone())
                            .unwrap_or_default(),
                    });
                }
            }
        }
    }
}

fn is_valid_hostname(hostname: &str) -> bool {
    static HOSTNAME: OnceLock<Regex> = OnceLock::new();
    let re = HOSTNAME.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*\.?$")
            .expect("hostname pattern is valid")
    });
    hostname.len() <= 253 && re.is_match(hostname)
}

/// IPv4 network in CIDR notation
struct Subnet {
    cidr: String,
    base: u32,
    mask: u32,
}

impl Subnet {
    fn parse(cidr: &str) -> Option<Self> {
        let (addr, prefix) = cidr.split_once('/')?;
        let addr: Ipv4Addr = addr.trim().parse().ok()?;
        let prefix: u32 = prefix.trim().parse().ok()?;
        if prefix > 32 {
            return None;
        }
        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        Some(Self {
            cidr: cidr.to_string(),
            base: u32::from(addr) & mask,
            mask,
        })
    }

    fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & self.mask == self.base
    }
}
