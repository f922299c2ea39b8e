//! Health check pattern registry
//!
//! Static lookup from (service category, check kind) to a check template.
//! Templates are bound to a concrete service with [`CheckDescriptor::bind`].

use super::check::{CheckDescriptor, CheckKind, CheckRef, CheckTarget, HealthPlan, Stage, StagePolicy};
use crate::manifest::HealthSpec;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

/// Category consulted when a service's own category has no matching pattern
pub const GENERIC_CATEGORY: &str = "generic";

/// Default stage kinds for a category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDefaults {
    pub startup: CheckKind,
    pub liveness: CheckKind,
    pub readiness: Option<CheckKind>,
}

impl Default for StageDefaults {
    fn default() -> Self {
        Self {
            startup: CheckKind::ProcessActive,
            liveness: CheckKind::ProcessActive,
            readiness: None,
        }
    }
}

/// Pattern registry
#[derive(Debug, Clone, Default)]
pub struct PatternRegistry {
    patterns: HashMap<(String, CheckKind), CheckDescriptor>,
    defaults: HashMap<String, StageDefaults>,
}

impl PatternRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared built-in registry
    pub fn builtin() -> &'static PatternRegistry {
        static BUILTIN: OnceLock<PatternRegistry> = OnceLock::new();
        BUILTIN.get_or_init(builtin_patterns)
    }

    /// Register a template
    pub fn with_pattern(mut self, category: &str, template: CheckDescriptor) -> Self {
        self.patterns
            .insert((category.to_string(), template.kind()), template);
        self
    }

    /// Register default stage kinds for a category
    pub fn with_defaults(mut self, category: &str, defaults: StageDefaults) -> Self {
        self.defaults.insert(category.to_string(), defaults);
        self
    }

    /// Find the template for (category, kind), falling back to the generic row
    pub fn lookup(&self, category: &str, kind: CheckKind) -> Option<&CheckDescriptor> {
        self.patterns
            .get(&(category.to_string(), kind))
            .or_else(|| self.patterns.get(&(GENERIC_CATEGORY.to_string(), kind)))
    }

    /// Default stage kinds for a category
    pub fn stage_defaults(&self, category: &str) -> StageDefaults {
        self.defaults.get(category).copied().unwrap_or_default()
    }

    /// Categories with at least one pattern, sorted
    pub fn categories(&self) -> Vec<&str> {
        let mut categories: Vec<&str> = self.patterns.keys().map(|(c, _)| c.as_str()).collect();
        categories.sort();
        categories.dedup();
        categories
    }
}

/// A health plan that could not be resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedCheck {
    pub stage: Stage,
    pub message: String,
}

impl PatternRegistry {
    /// Resolve a service's declared health spec into a runnable plan
    ///
    /// Bare kinds are looked up as (category, kind); an unmatched pair is an
    /// error. Omitted startup/liveness stages use the category defaults.
    pub fn resolve_plan(
        &self,
        category: &str,
        spec: Option<&HealthSpec>,
        target: &CheckTarget,
        defaults: StagePolicy,
    ) -> std::result::Result<HealthPlan, UnresolvedCheck> {
        let stage_defaults = self.stage_defaults(category);
        let empty = HealthSpec::default();
        let spec = spec.unwrap_or(&empty);

        let startup = self.resolve_stage(
            category,
            Stage::Startup,
            spec.startup.as_ref(),
            Some(stage_defaults.startup),
        )?;
        let liveness = self.resolve_stage(
            category,
            Stage::Liveness,
            spec.liveness.as_ref(),
            Some(stage_defaults.liveness),
        )?;
        let readiness = match (spec.readiness.as_ref(), stage_defaults.readiness) {
            (None, None) => None,
            (declared, default) => {
                Some(self.resolve_stage(category, Stage::Readiness, declared, default)?)
            }
        };

        let policy = StagePolicy {
            timeout: spec
                .timeout
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            interval: spec
                .interval
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
            max_retries: spec.retries.unwrap_or(defaults.max_retries).max(1),
        };

        Ok(HealthPlan {
            startup: startup.bind(target),
            liveness: liveness.bind(target),
            readiness: readiness.map(|r| r.bind(target)),
            policy,
        })
    }

    fn resolve_stage(
        &self,
        category: &str,
        stage: Stage,
        declared: Option<&CheckRef>,
        default: Option<CheckKind>,
    ) -> std::result::Result<CheckDescriptor, UnresolvedCheck> {
        let kind = match declared {
            Some(CheckRef::Descriptor(d)) => return Ok(d.clone()),
            Some(CheckRef::Kind(kind)) => *kind,
            None => match default {
                Some(kind) => kind,
                None => {
                    return Err(UnresolvedCheck {
                        stage,
                        message: "no check declared and no default for category".to_string(),
                    })
                }
            },
        };

        self.lookup(category, kind)
            .cloned()
            .ok_or_else(|| UnresolvedCheck {
                stage,
                message: format!("no {} pattern registered for category '{}'", kind, category),
            })
    }
}

fn unit(name: &str) -> CheckDescriptor {
    CheckDescriptor::ProcessActive {
        unit: name.to_string(),
        host: Some("{ip}".to_string()),
    }
}

fn http(url: &str) -> CheckDescriptor {
    CheckDescriptor::HttpEndpoint {
        url: url.to_string(),
        expected_status: None,
    }
}

fn tcp(port: u16) -> CheckDescriptor {
    CheckDescriptor::TcpPort {
        host: "{ip}".to_string(),
        port,
    }
}

fn stages(liveness: CheckKind, readiness: Option<CheckKind>) -> StageDefaults {
    StageDefaults {
        startup: CheckKind::ProcessActive,
        liveness,
        readiness,
    }
}

fn builtin_patterns() -> PatternRegistry {
    PatternRegistry::new()
        .with_pattern(GENERIC_CATEGORY, unit("{name}.service"))
        .with_pattern(
            GENERIC_CATEGORY,
            CheckDescriptor::Filesystem {
                path: PathBuf::from("/var/lib/{name}"),
                writable: false,
            },
        )
        // dns
        .with_pattern("dns", unit("unbound.service"))
        .with_pattern("dns", tcp(53))
        .with_pattern(
            "dns",
            CheckDescriptor::CustomCommand {
                command: "dig +short +time=2 @{ip} {hostname}".to_string(),
            },
        )
        .with_defaults("dns", stages(CheckKind::TcpPort, Some(CheckKind::CustomCommand)))
        // postgresql
        .with_pattern("postgresql", unit("postgresql.service"))
        .with_pattern("postgresql", tcp(5432))
        .with_pattern(
            "postgresql",
            CheckDescriptor::DbConnection {
                host: "{ip}".to_string(),
                port: 5432,
                command: Some("pg_isready -h {ip} -p 5432".to_string()),
            },
        )
        .with_defaults("postgresql", stages(CheckKind::TcpPort, Some(CheckKind::DbConnection)))
        // caddy
        .with_pattern("caddy", unit("caddy.service"))
        .with_pattern("caddy", tcp(443))
        .with_pattern("caddy", http("http://{ip}:2019/config/"))
        .with_defaults("caddy", stages(CheckKind::TcpPort, Some(CheckKind::HttpEndpoint)))
        // authentik
        .with_pattern("authentik", unit("authentik.service"))
        .with_pattern("authentik", tcp(9000))
        .with_pattern("authentik", http("http://{ip}:9000/-/health/ready/"))
        .with_defaults("authentik", stages(CheckKind::TcpPort, Some(CheckKind::HttpEndpoint)))
        // vaultwarden
        .with_pattern("vaultwarden", unit("vaultwarden.service"))
        .with_pattern("vaultwarden", http("http://{ip}:8080/alive"))
        .with_defaults("vaultwarden", stages(CheckKind::HttpEndpoint, None))
        // prometheus
        .with_pattern("prometheus", unit("prometheus.service"))
        .with_pattern("prometheus", http("http://{ip}:9090/-/ready"))
        .with_defaults("prometheus", stages(CheckKind::HttpEndpoint, None))
        // grafana
        .with_pattern("grafana", unit("grafana.service"))
        .with_pattern("grafana", http("http://{ip}:3000/api/health"))
        .with_defaults("grafana", stages(CheckKind::HttpEndpoint, None))
        // nextcloud
        .with_pattern("nextcloud", unit("phpfpm-nextcloud.service"))
        .with_pattern("nextcloud", http("http://{ip}/status.php"))
        .with_defaults("nextcloud", stages(CheckKind::HttpEndpoint, None))
        // mail
        .with_pattern("mail", unit("postfix.service"))
        .with_pattern("mail", tcp(25))
        .with_defaults("mail", stages(CheckKind::TcpPort, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_exact_category() {
        let registry = PatternRegistry::builtin();
        let check = registry.lookup("postgresql", CheckKind::TcpPort).unwrap();
        assert_eq!(
            check,
            &CheckDescriptor::TcpPort {
                host: "{ip}".to_string(),
                port: 5432
            }
        );
    }

    #[test]
    fn test_lookup_falls_back_to_generic() {
        let registry = PatternRegistry::builtin();
        let check = registry
            .lookup("some-new-service", CheckKind::ProcessActive)
            .unwrap();
        assert_eq!(check.kind(), CheckKind::ProcessActive);
    }

    #[test]
    fn test_lookup_miss() {
        let registry = PatternRegistry::builtin();
        assert!(registry
            .lookup("some-new-service", CheckKind::HttpEndpoint)
            .is_none());
    }

    #[test]
    fn test_stage_defaults() {
        let registry = PatternRegistry::builtin();
        let defaults = registry.stage_defaults("postgresql");
        assert_eq!(defaults.liveness, CheckKind::TcpPort);
        assert_eq!(defaults.readiness, Some(CheckKind::DbConnection));
        assert_eq!(
            registry.stage_defaults("unknown"),
            StageDefaults::default()
        );
    }

    fn policy() -> StagePolicy {
        StagePolicy {
            timeout: Duration::from_secs(300),
            interval: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    #[test]
    fn test_resolve_plan_from_category_defaults() {
        let registry = PatternRegistry::builtin();
        let target = CheckTarget::new("postgresql", "10.0.0.7", "db.lan");
        let plan = registry
            .resolve_plan("postgresql", None, &target, policy())
            .unwrap();

        assert_eq!(
            plan.startup,
            CheckDescriptor::ProcessActive {
                unit: "postgresql.service".to_string(),
                host: Some("10.0.0.7".to_string()),
            }
        );
        assert_eq!(
            plan.liveness,
            CheckDescriptor::TcpPort {
                host: "10.0.0.7".to_string(),
                port: 5432
            }
        );
        assert_eq!(plan.readiness.unwrap().kind(), CheckKind::DbConnection);
        assert_eq!(plan.policy, policy());
    }

    #[test]
    fn test_resolve_plan_node_overrides() {
        let registry = PatternRegistry::builtin();
        let target = CheckTarget::new("app", "10.0.0.9", "app.lan");
        let spec = HealthSpec {
            liveness: Some(CheckRef::Descriptor(CheckDescriptor::HttpEndpoint {
                url: "http://{hostname}/health".to_string(),
                expected_status: Some(204),
            })),
            timeout: Some(30),
            retries: Some(0),
            ..Default::default()
        };
        let plan = registry
            .resolve_plan("app", Some(&spec), &target, policy())
            .unwrap();

        assert_eq!(
            plan.liveness,
            CheckDescriptor::HttpEndpoint {
                url: "http://app.lan/health".to_string(),
                expected_status: Some(204),
            }
        );
        assert!(plan.readiness.is_none());
        assert_eq!(plan.policy.timeout, Duration::from_secs(30));
        assert_eq!(plan.policy.max_retries, 1);
    }

    #[test]
    fn test_resolve_plan_unmatched_kind_is_error() {
        let registry = PatternRegistry::builtin();
        let target = CheckTarget::new("app", "10.0.0.9", "app.lan");
        let spec = HealthSpec {
            readiness: Some(CheckRef::Kind(CheckKind::HttpEndpoint)),
            ..Default::default()
        };
        let err = registry
            .resolve_plan("app", Some(&spec), &target, policy())
            .unwrap_err();
        assert_eq!(err.stage, Stage::Readiness);
        assert!(err.message.contains("http-endpoint"));
    }

    #[test]
    fn test_every_default_kind_has_a_pattern() {
        let registry = PatternRegistry::builtin();
        for category in registry.categories() {
            let defaults = registry.stage_defaults(category);
            assert!(registry.lookup(category, defaults.startup).is_some());
            assert!(registry.lookup(category, defaults.liveness).is_some());
            if let Some(kind) = defaults.readiness {
                assert!(registry.lookup(category, kind).is_some(), "{}", category);
            }
        }
    }
}
