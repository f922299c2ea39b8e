//! Manifest configuration types

use super::ordered::OrderedMap;
use crate::health::CheckRef;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Services keyed by name, in declaration order
pub type ServiceMap = OrderedMap<ServiceNode>;

/// Phase groups keyed by phase name, in declaration order
pub type PhaseMap = OrderedMap<Vec<String>>;

/// Deployment manifest as written by the operator
///
/// Top-level sections are optional at the type level so that a missing
/// section is reported as a validation violation instead of a parse error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Network configuration (passed through to collaborators)
    #[serde(default)]
    pub network: Option<NetworkConfig>,
    /// Services
    #[serde(default)]
    pub services: Option<ServiceMap>,
    /// Explicit phase groups; absent or empty means "derive from the graph"
    #[serde(default)]
    pub deployment_phases: Option<PhaseMap>,
    /// Overall health check budget per service (seconds)
    #[serde(default)]
    pub health_check_timeout: Option<u64>,
    /// Attempts for each collaborator call
    #[serde(default)]
    pub retry_attempts: Option<u32>,
    /// Base delay between collaborator retries (seconds)
    #[serde(default)]
    pub retry_delay: Option<u64>,
    #[serde(default)]
    pub enable_rollback: Option<bool>,
    #[serde(default)]
    pub enable_health_monitoring: Option<bool>,
    #[serde(default)]
    pub enable_dependency_graphing: Option<bool>,
    #[serde(default)]
    pub enable_deployment_logging: Option<bool>,
}

impl Manifest {
    /// Services in declaration order, empty when the section is missing
    pub fn service_entries(&self) -> Vec<(&String, &ServiceNode)> {
        self.services
            .as_ref()
            .map(|s| s.iter().collect())
            .unwrap_or_default()
    }

    /// Look up a service by name
    pub fn service(&self, name: &str) -> Option<&ServiceNode> {
        self.services.as_ref().and_then(|s| s.get(name))
    }

    /// Whether explicit phase groups are declared
    pub fn has_explicit_phases(&self) -> bool {
        self.deployment_phases
            .as_ref()
            .map(|p| !p.is_empty())
            .unwrap_or(false)
    }
}

/// Network configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// DNS server address
    #[serde(default)]
    pub dns: Option<String>,
    /// Default gateway
    #[serde(default)]
    pub gateway: Option<String>,
    /// Service subnet in CIDR notation
    #[serde(default)]
    pub cidr: Option<String>,
    /// VLAN tag
    #[serde(default)]
    pub vlan: Option<u16>,
}

/// A single service in the fleet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceNode {
    /// Whether the service takes part in deployments
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Always-required service; may not be disabled
    #[serde(default)]
    pub core: bool,
    /// IP address
    #[serde(default)]
    pub ip: Option<String>,
    /// Fully qualified hostname
    #[serde(default)]
    pub hostname: Option<String>,
    /// Names of services this one depends on
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Category used for health check patterns (defaults to the service name)
    #[serde(default)]
    pub category: Option<String>,
    /// Version label, folded into the config hash
    #[serde(default)]
    pub version: Option<String>,
    /// Health checks
    #[serde(default)]
    pub health: Option<HealthSpec>,
    /// Resource hints (informational)
    #[serde(default)]
    pub resources: ResourceHints,
    /// Explicit phase assignment (name of a declared phase)
    #[serde(default)]
    pub phase: Option<String>,
    /// Identity provider registration
    #[serde(default)]
    pub auth: Option<AuthSpec>,
    /// Service-specific parameters, opaque to the orchestrator
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

fn default_enabled() -> bool {
    true
}

impl Default for ServiceNode {
    fn default() -> Self {
        Self {
            enabled: true,
            core: false,
            ip: None,
            hostname: None,
            depends_on: Vec::new(),
            category: None,
            version: None,
            health: None,
            resources: ResourceHints::default(),
            phase: None,
            auth: None,
            params: BTreeMap::new(),
        }
    }
}

impl ServiceNode {
    /// Pattern registry category for this service
    pub fn category_or<'a>(&'a self, name: &'a str) -> &'a str {
        self.category.as_deref().unwrap_or(name)
    }

    /// SHA-256 of the canonical JSON form of this definition
    ///
    /// Any change to the definition, including opaque params, changes the hash.
    /// Dependencies are hashed as a set.
    pub fn config_hash(&self) -> String {
        let mut canonical = self.clone();
        canonical.depends_on.sort();
        canonical.depends_on.dedup();
        digest(&canonical)
    }
}

/// Health check specification as declared in the manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthSpec {
    /// Check that the service came up
    #[serde(default)]
    pub startup: Option<CheckRef>,
    /// Check that the service keeps running
    #[serde(default)]
    pub liveness: Option<CheckRef>,
    /// Check that the service accepts traffic
    #[serde(default)]
    pub readiness: Option<CheckRef>,
    /// Stage timeout (seconds)
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Poll interval (seconds)
    #[serde(default)]
    pub interval: Option<u64>,
    /// Maximum probe attempts per stage
    #[serde(default)]
    pub retries: Option<u32>,
}

/// Resource hints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceHints {
    /// Memory (e.g. "2G")
    #[serde(default)]
    pub memory: Option<String>,
    /// CPU cores
    #[serde(default)]
    pub cpu: Option<u32>,
    /// Storage (e.g. "20G")
    #[serde(default)]
    pub storage: Option<String>,
}

/// Identity provider kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthProvider {
    Oidc,
    Ldap,
    Radius,
    Proxy,
}

impl std::fmt::Display for AuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthProvider::Oidc => write!(f, "oidc"),
            AuthProvider::Ldap => write!(f, "ldap"),
            AuthProvider::Radius => write!(f, "radius"),
            AuthProvider::Proxy => write!(f, "proxy"),
        }
    }
}

/// Identity provider application declared by a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSpec {
    /// Provider type
    pub provider: AuthProvider,
    /// Application slug (defaults to the service name)
    #[serde(default)]
    pub slug: Option<String>,
    /// OAuth2 redirect URIs
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    /// Allowed scopes
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl AuthSpec {
    /// Application slug, falling back to the service name
    pub fn slug_or<'a>(&'a self, service: &'a str) -> &'a str {
        self.slug.as_deref().unwrap_or(service)
    }

    /// SHA-256 of the canonical JSON form of this spec
    pub fn spec_hash(&self) -> String {
        digest(self)
    }
}

fn digest<T: Serialize>(value: &T) -> String {
    // Struct fields serialize in declaration order and maps are BTreeMaps,
    // so the JSON form is canonical.
    let json = serde_json::to_vec(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&json);
    format!("{:x}", hasher.finalize())
}
