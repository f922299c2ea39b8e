//! Persisted deployment state document

use crate::manifest::ResolvedService;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Current schema version of the state document
pub const STATE_VERSION: u32 = 1;

/// What was successfully deployed or provisioned, per service
///
/// All maps are `BTreeMap`s so the serialized form is stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentState {
    /// Schema version
    pub version: u32,
    /// Number of times this document was saved
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Host that wrote the document
    #[serde(default)]
    pub updated_by: Option<String>,
    /// Deployed services
    #[serde(default)]
    pub services: BTreeMap<String, ServiceRecord>,
    /// Provisioned compute units, keyed by service
    #[serde(default)]
    pub containers: BTreeMap<String, ResourceRecord>,
    /// Registered identity provider applications, keyed by service
    #[serde(default)]
    pub identity_apps: BTreeMap<String, ResourceRecord>,
}

impl Default for DeploymentState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            generation: 0,
            updated_at: None,
            updated_by: None,
            services: BTreeMap::new(),
            containers: BTreeMap::new(),
            identity_apps: BTreeMap::new(),
        }
    }
}

impl DeploymentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.containers.is_empty() && self.identity_apps.is_empty()
    }

    /// Whether any record exists for `service`
    pub fn is_recorded(&self, service: &str) -> bool {
        self.services.contains_key(service)
            || self.containers.contains_key(service)
            || self.identity_apps.contains_key(service)
    }

    /// Every service with at least one record
    pub fn recorded(&self) -> BTreeSet<&str> {
        self.services
            .keys()
            .chain(self.containers.keys())
            .chain(self.identity_apps.keys())
            .map(String::as_str)
            .collect()
    }

    /// Copy marked as written now by this host
    pub fn stamped(&self) -> Self {
        let mut next = self.clone();
        next.version = STATE_VERSION;
        next.generation = self.generation + 1;
        next.updated_at = Some(Utc::now());
        next.updated_by = Some(gethostname::gethostname().to_string_lossy().into_owned());
        next
    }
}

/// Record of a successfully deployed service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub deployed_at: DateTime<Utc>,
    pub config_hash: String,
    #[serde(default)]
    pub version: Option<String>,
    /// Dependency set at deploy time
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    pub ip: String,
    pub hostname: String,
}

impl ServiceRecord {
    pub fn for_service(service: &ResolvedService, deployed_at: DateTime<Utc>) -> Self {
        Self {
            deployed_at,
            config_hash: service.config_hash.clone(),
            version: service.node.version.clone(),
            dependencies: service.depends_on().iter().cloned().collect(),
            ip: service.ip.clone(),
            hostname: service.hostname.clone(),
        }
    }
}

/// Record of an externally provisioned resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub created_at: DateTime<Utc>,
    /// Identifying fields
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl ResourceRecord {
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(|v| v.as_str())
    }
}

/// Kind of record written by a successful step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateEntry {
    Service(ServiceRecord),
    Container(ResourceRecord),
    IdentityApp(ResourceRecord),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> DeploymentState {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        let mut state = DeploymentState::new();
        state.services.insert(
            "postgresql".to_string(),
            ServiceRecord {
                deployed_at: at,
                config_hash: "ab12".to_string(),
                version: Some("16".to_string()),
                dependencies: ["dns".to_string()].into_iter().collect(),
                ip: "10.0.0.6".to_string(),
                hostname: "db.lan".to_string(),
            },
        );
        state.containers.insert(
            "postgresql".to_string(),
            ResourceRecord::new(at)
                .with_field("ip", "10.0.0.6")
                .with_field("identity", "ct-106"),
        );
        state
    }

    #[test]
    fn test_state_survives_json() {
        let state = sample().stamped();
        let json = serde_json::to_string_pretty(&state).unwrap();
        let parsed: DeploymentState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_stamped_bumps_generation() {
        let state = sample();
        let stamped = state.stamped();
        assert_eq!(stamped.generation, state.generation + 1);
        assert!(stamped.updated_at.is_some());
        assert!(stamped.updated_by.is_some());
        assert_eq!(stamped.services, state.services);
    }

    #[test]
    fn test_minimal_document_parses() {
        let state: DeploymentState = serde_json::from_str(r#"{"version": 1}"#).unwrap();
        assert!(state.is_empty());
    }
}
