//! Incremental deployment tracking
//!
//! `diff` compares the validated manifest with the last persisted state to
//! find the work a run actually has to do. `update` and `forget` return new
//! documents and never touch records other than the one they name.

use super::document::{DeploymentState, ResourceRecord, StateEntry};
use crate::manifest::{ResolvedService, ValidatedManifest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Container record fields compared by `diff`
const IDENTITY_FIELDS: &[&str] = &["ip", "hostname"];

/// Incremental work for a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployDiff {
    /// Services that need provisioning/configuration and health checks
    pub to_deploy: BTreeSet<String>,
    /// Services whose compute unit must be (re)provisioned
    pub resources_to_create: BTreeSet<String>,
    /// Services whose identity provider application must be (re)registered
    pub identity_apps_to_create: BTreeSet<String>,
    /// Recorded services that are no longer enabled in the manifest
    pub orphaned: BTreeSet<String>,
}

impl DeployDiff {
    /// Nothing to deploy, provision or register
    pub fn is_empty(&self) -> bool {
        self.to_deploy.is_empty()
            && self.resources_to_create.is_empty()
            && self.identity_apps_to_create.is_empty()
    }

    pub fn to_text(&self) -> String {
        if self.is_empty() {
            let mut out = "Everything is up to date\n".to_string();
            if !self.orphaned.is_empty() {
                out.push_str(&format!(
                    "Recorded but no longer enabled: {}\n",
                    join(&self.orphaned)
                ));
            }
            return out;
        }

        let mut out = String::new();
        for (label, set) in [
            ("Deploy", &self.to_deploy),
            ("Provision", &self.resources_to_create),
            ("Register identity app", &self.identity_apps_to_create),
            ("Recorded but no longer enabled", &self.orphaned),
        ] {
            if !set.is_empty() {
                out.push_str(&format!("{}: {}\n", label, join(set)));
            }
        }
        out
    }
}

fn join(set: &BTreeSet<String>) -> String {
    set.iter().cloned().collect::<Vec<_>>().join(", ")
}

/// State tracker
pub struct StateTracker;

impl StateTracker {
    /// Compute the incremental work for `validated` against `prior`
    pub fn diff(validated: &ValidatedManifest, prior: &DeploymentState) -> DeployDiff {
        let mut diff = DeployDiff::default();

        for service in validated.enabled_services() {
            let name = &service.name;

            if needs_deploy(service, prior) {
                diff.to_deploy.insert(name.clone());
            }

            let container_changed = match prior.containers.get(name) {
                None => true,
                Some(record) => IDENTITY_FIELDS
                    .iter()
                    .any(|field| record.field(field) != Some(identity_field(service, field))),
            };
            if container_changed {
                diff.resources_to_create.insert(name.clone());
            }

            if let Some(ref auth) = service.node.auth {
                let registered = prior
                    .identity_apps
                    .get(name)
                    .and_then(|r| r.field("spec_hash"))
                    == Some(auth.spec_hash().as_str());
                if !registered {
                    diff.identity_apps_to_create.insert(name.clone());
                }
            }
        }

        // a service is redeployed whenever its compute unit or app is recreated
        let recreated: Vec<String> = diff
            .resources_to_create
            .iter()
            .chain(diff.identity_apps_to_create.iter())
            .cloned()
            .collect();
        diff.to_deploy.extend(recreated);

        diff.orphaned = prior
            .recorded()
            .into_iter()
            .filter(|name| !validated.is_enabled(name))
            .map(String::from)
            .collect();

        diff
    }

    /// New document with `entry` recorded for `service`
    pub fn update(state: &DeploymentState, service: &str, entry: StateEntry) -> DeploymentState {
        let mut next = state.clone();
        match entry {
            StateEntry::Service(record) => {
                next.services.insert(service.to_string(), record);
            }
            StateEntry::Container(record) => {
                next.containers.insert(service.to_string(), record);
            }
            StateEntry::IdentityApp(record) => {
                next.identity_apps.insert(service.to_string(), record);
            }
        }
        next
    }

    /// New document without any record of `service`
    pub fn forget(state: &DeploymentState, service: &str) -> DeploymentState {
        let mut next = state.clone();
        next.services.remove(service);
        next.containers.remove(service);
        next.identity_apps.remove(service);
        next
    }

    /// Container record for a provisioned service
    pub fn container_record(
        service: &ResolvedService,
        identity: &str,
        created_at: DateTime<Utc>,
    ) -> ResourceRecord {
        ResourceRecord::new(created_at)
            .with_field("ip", service.ip.clone())
            .with_field("hostname", service.hostname.clone())
            .with_field("identity", identity)
    }
}

fn needs_deploy(service: &ResolvedService, prior: &DeploymentState) -> bool {
    let Some(record) = prior.services.get(&service.name) else {
        return true;
    };
    let dependencies: BTreeSet<String> = service.depends_on().iter().cloned().collect();

    record.config_hash != service.config_hash
        || record.version != service.node.version
        || record.dependencies != dependencies
}

fn identity_field<'a>(service: &'a ResolvedService, field: &str) -> &'a str {
    match field {
        "ip" => &service.ip,
        _ => &service.hostname,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{validate, ManifestParser};
    use crate::settings::DeploymentConfig;
    use crate::state::document::ServiceRecord;

    fn validated(services: &str) -> ValidatedManifest {
        let manifest = ManifestParser::parse_str(&format!(
            "network:\n  dns: 10.0.0.1\n  gateway: 10.0.0.1\n  cidr: 10.0.0.0/24\n{}",
            services
        ))
        .unwrap();
        validate(manifest, DeploymentConfig::defaults()).unwrap()
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
  vaultwarden:
    ip: 10.0.0.8
    hostname: vault.lan
    depends_on: [postgresql]
    auth:
      provider: oidc
      redirect_uris: [https://vault.lan/identity/connect/oidc-signin]
"#;

    /// State as the executor leaves it after deploying everything
    fn fully_deployed(validated: &ValidatedManifest) -> DeploymentState {
        let now = Utc::now();
        let mut state = DeploymentState::new();
        for service in validated.enabled_services() {
            state = StateTracker::update(
                &state,
                &service.name,
                StateEntry::Container(StateTracker::container_record(service, "ct", now)),
            );
            if let Some(ref auth) = service.node.auth {
                state = StateTracker::update(
                    &state,
                    &service.name,
                    StateEntry::IdentityApp(
                        ResourceRecord::new(now)
                            .with_field("slug", auth.slug_or(&service.name))
                            .with_field("spec_hash", auth.spec_hash()),
                    ),
                );
            }
            state = StateTracker::update(
                &state,
                &service.name,
                StateEntry::Service(ServiceRecord::for_service(service, now)),
            );
        }
        state
    }

    #[test]
    fn test_first_run_deploys_everything() {
        let manifest = validated(FLEET);
        let diff = StateTracker::diff(&manifest, &DeploymentState::new());
        assert_eq!(diff.to_deploy.len(), 3);
        assert_eq!(diff.resources_to_create.len(), 3);
        assert_eq!(
            diff.identity_apps_to_create.into_iter().collect::<Vec<_>>(),
            vec!["vaultwarden"]
        );
    }

    #[test]
    fn test_diff_after_full_deploy_is_empty() {
        let manifest = validated(FLEET);
        let state = fully_deployed(&manifest);
        let diff = StateTracker::diff(&manifest, &state);
        assert!(diff.is_empty(), "{:?}", diff);
        assert!(diff.orphaned.is_empty());
    }

    #[test]
    fn test_changed_config_and_dependencies_redeploy() {
        let before = validated(FLEET);
        let state = fully_deployed(&before);

        let after = validated(
            r#"
services:
  dns:
    ip: 10.0.0.5
    hostname: dns.lan
    version: "1.20"
  postgresql:
    ip: 10.0.0.6
    hostname: db.lan
  vaultwarden:
    ip: 10.0.0.8
    hostname: vault.lan
    depends_on: [postgresql]
    auth:
      provider: oidc
      redirect_uris: [https://vault.lan/identity/connect/oidc-signin]
"#,
        );
        let diff = StateTracker::diff(&after, &state);
        assert_eq!(
            diff.to_deploy.into_iter().collect::<Vec<_>>(),
            vec!["dns", "postgresql"]
        );
        assert!(diff.resources_to_create.is_empty());
    }

    #[test]
    fn test_dependency_order_is_not_a_change() {
        let fleet = r#"
services:
  a:
    ip: 10.0.0.5
    hostname: a.lan
  b:
    ip: 10.0.0.6
    hostname: b.lan
  c:
    ip: 10.0.0.7
    hostname: c.lan
    depends_on: [a, b]
"#;
        let state = fully_deployed(&validated(fleet));
        let reordered = validated(&fleet.replace("[a, b]", "[b, a]"));

        let diff = StateTracker::diff(&reordered, &state);
        assert!(diff.is_empty(), "{:?}", diff);
    }

    #[test]
    fn test_identity_change_reprovisions() {
        let before = validated(FLEET);
        let state = fully_deployed(&before);
        let after = validated(&FLEET.replace("10.0.0.6", "10.0.0.16"));

        let diff = StateTracker::diff(&after, &state);
        assert!(diff.resources_to_create.contains("postgresql"));
        assert!(diff.to_deploy.contains("postgresql"));
        assert!(!diff.to_deploy.contains("dns"));
    }

    #[test]
    fn test_auth_change_reregisters() {
        let before = validated(FLEET);
        let state = fully_deployed(&before);
        let after = validated(&FLEET.replace("provider: oidc", "provider: proxy"));

        let diff = StateTracker::diff(&after, &state);
        assert_eq!(
            diff.identity_apps_to_create.into_iter().collect::<Vec<_>>(),
            vec!["vaultwarden"]
        );
    }

    #[test]
    fn test_update_is_additive_and_pure() {
        let manifest = validated(FLEET);
        let state = fully_deployed(&manifest);
        let dns = manifest.service("dns").unwrap();

        let mut record = ServiceRecord::for_service(dns, Utc::now());
        record.config_hash = "changed".to_string();
        let next = StateTracker::update(&state, "dns", StateEntry::Service(record.clone()));

        assert_eq!(next.services.get("dns"), Some(&record));
        assert_eq!(next.services.get("postgresql"), state.services.get("postgresql"));
        assert_eq!(next.containers, state.containers);
        // the input document is untouched
        assert_ne!(state.services.get("dns"), Some(&record));

        let json = serde_json::to_string(&next).unwrap();
        assert_eq!(serde_json::from_str::<DeploymentState>(&json).unwrap(), next);
    }

    #[test]
    fn test_forget_and_orphans() {
        let manifest = validated(FLEET);
        let state = fully_deployed(&manifest);
        let forgotten = StateTracker::forget(&state, "vaultwarden");
        assert!(!forgotten.services.contains_key("vaultwarden"));
        assert!(!forgotten.identity_apps.contains_key("vaultwarden"));
        assert_eq!(forgotten.services.len(), 2);

        let shrunk = validated(
            r#"
services:
  dns:
    ip: 10.0.0.5
    hostname: dns.lan
"#,
        );
        let diff = StateTracker::diff(&shrunk, &state);
        assert!(diff.is_empty());
        assert_eq!(diff.orphaned.len(), 2);
        assert!(diff.to_text().contains("postgresql, vaultwarden"));
    }
}
