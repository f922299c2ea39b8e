//! External collaborators
//!
//! The executor never starts, configures or removes anything itself. It
//! calls these interfaces, which return `anyhow::Result` so implementations
//! can attach whatever context their tooling produces.

use crate::manifest::{AuthProvider, AuthSpec, Manifest, ResolvedService};
use crate::settings::HookCommands;
use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Identity of a service as seen by teardown and notify hooks
///
/// Built from the manifest or, for services no longer declared there, from
/// the persisted state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub name: String,
    pub ip: String,
    pub hostname: String,
    pub category: String,
}

impl From<&ResolvedService> for ServiceRef {
    fn from(service: &ResolvedService) -> Self {
        Self {
            name: service.name.clone(),
            ip: service.ip.clone(),
            hostname: service.hostname.clone(),
            category: service.category.clone(),
        }
    }
}

/// Result of provisioning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionResult {
    /// Backend identifier of the compute unit (container name, VM id, ...)
    pub identity: String,
}

/// Result of configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureResult {
    #[serde(default)]
    pub message: Option<String>,
}

/// Registered identity provider application; never carries the secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppHandle {
    pub slug: String,
    pub provider: AuthProvider,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Brings up the compute/network unit for a service
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    async fn provision(&self, service: &ResolvedService) -> anyhow::Result<ProvisionResult>;
}

/// Applies a provisioned service's runtime configuration
#[async_trait]
pub trait ConfigurationBackend: Send + Sync {
    async fn configure(
        &self,
        service: &ResolvedService,
        manifest: &Manifest,
    ) -> anyhow::Result<ConfigureResult>;
}

/// Registers identity provider applications
#[async_trait]
pub trait IdentityBackend: Send + Sync {
    async fn register_app(
        &self,
        service: &ResolvedService,
        auth: &AuthSpec,
    ) -> anyhow::Result<AppHandle>;
}

/// Removes a deployed service
#[async_trait]
pub trait TeardownHook: Send + Sync {
    async fn teardown(&self, service: &ServiceRef) -> anyhow::Result<()>;
}

/// Tells dependents that a service went away
#[async_trait]
pub trait NotifyHook: Send + Sync {
    async fn notify_dependents(&self, service: &ServiceRef, dependents: &[String])
        -> anyhow::Result<()>;
}

/// The full set of collaborators used by a run
#[derive(Clone)]
pub struct Collaborators {
    pub provisioning: Arc<dyn ProvisioningBackend>,
    pub configuration: Arc<dyn ConfigurationBackend>,
    pub identity: Arc<dyn IdentityBackend>,
    pub teardown: Arc<dyn TeardownHook>,
    pub notify: Arc<dyn NotifyHook>,
}

impl Collaborators {
    /// Use one implementation for every collaborator
    pub fn uniform<T>(backend: Arc<T>) -> Self
    where
        T: ProvisioningBackend
            + ConfigurationBackend
            + IdentityBackend
            + TeardownHook
            + NotifyHook
            + 'static,
    {
        Self {
            provisioning: backend.clone(),
            configuration: backend.clone(),
            identity: backend.clone(),
            teardown: backend.clone(),
            notify: backend,
        }
    }

    /// Shell hooks from the settings file
    pub fn from_hooks(hooks: &HookCommands) -> Self {
        Self::uniform(Arc::new(CommandBackend::new(hooks.clone())))
    }

    /// Log what would happen without doing it
    pub fn dry_run() -> Self {
        Self::uniform(Arc::new(DryRunBackend))
    }
}

/// Runs the configured shell command templates
///
/// Each hook gets `KEEL_ACTION`, `KEEL_SERVICE`, `KEEL_IP`, `KEEL_HOSTNAME`
/// and `KEEL_CATEGORY` in its environment and a JSON document on stdin.
/// Missing `configure` and `notify` hooks are skipped. Provisioning,
/// registration and teardown are recorded in state, so they fail without
/// their hook.
pub struct CommandBackend {
    hooks: HookCommands,
}

impl CommandBackend {
    pub fn new(hooks: HookCommands) -> Self {
        Self { hooks }
    }

    async fn run(
        &self,
        action: &str,
        template: &str,
        service: &ServiceRef,
        input: &serde_json::Value,
    ) -> anyhow::Result<String> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(template)
            .env("KEEL_ACTION", action)
            .env("KEEL_SERVICE", &service.name)
            .env("KEEL_IP", &service.ip)
            .env("KEEL_HOSTNAME", &service.hostname)
            .env("KEEL_CATEGORY", &service.category)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {} hook for {}", action, service.name))?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(input)?;
            // hooks that ignore stdin close it early
            if let Err(e) = stdin.write_all(&payload).await {
                tracing::debug!("{} hook for {} did not read stdin: {}", action, service.name, e);
            }
        }

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("{} hook for {} did not finish", action, service.name))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} hook for {} exited with {}: {}",
                action,
                service.name,
                output.status,
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ProvisioningBackend for CommandBackend {
    async fn provision(&self, service: &ResolvedService) -> anyhow::Result<ProvisionResult> {
        let target = ServiceRef::from(service);
        let Some(ref template) = self.hooks.provision else {
            bail!("no provision hook configured, cannot provision {}", service.name);
        };

        let input = serde_json::to_value(&service.node)?;
        let stdout = self.run("provision", template, &target, &input).await?;
        let identity = stdout
            .lines()
            .last()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string())
            .unwrap_or_else(|| service.name.clone());
        Ok(ProvisionResult { identity })
    }
}

#[async_trait]
impl ConfigurationBackend for CommandBackend {
    async fn configure(
        &self,
        service: &ResolvedService,
        manifest: &Manifest,
    ) -> anyhow::Result<ConfigureResult> {
        let Some(ref template) = self.hooks.configure else {
            tracing::debug!("No configure hook configured, skipping {}", service.name);
            return Ok(ConfigureResult::default());
        };

        let input = serde_json::json!({
            "service": service.name,
            "definition": service.node,
            "network": manifest.network,
        });
        let stdout = self
            .run("configure", template, &ServiceRef::from(service), &input)
            .await?;
        Ok(ConfigureResult {
            message: Some(stdout).filter(|s| !s.is_empty()),
        })
    }
}

#[async_trait]
impl IdentityBackend for CommandBackend {
    async fn register_app(
        &self,
        service: &ResolvedService,
        auth: &AuthSpec,
    ) -> anyhow::Result<AppHandle> {
        let slug = auth.slug_or(&service.name).to_string();
        let Some(ref template) = self.hooks.register_app else {
            bail!(
                "{} declares {} auth but no register_app hook is configured",
                service.name,
                auth.provider
            );
        };

        let input = serde_json::json!({
            "service": service.name,
            "slug": slug,
            "auth": auth,
        });
        let stdout = self
            .run("register_app", template, &ServiceRef::from(service), &input)
            .await?;

        // the hook may answer with {"client_id": ...} or a bare id
        let client_id = match serde_json::from_str::<serde_json::Value>(&stdout) {
            Ok(serde_json::Value::Object(map)) => map
                .get("client_id")
                .and_then(|v| v.as_str())
                .map(String::from),
            _ => Some(stdout).filter(|s| !s.is_empty()),
        };

        Ok(AppHandle {
            slug,
            provider: auth.provider,
            client_id,
        })
    }
}

#[async_trait]
impl TeardownHook for CommandBackend {
    async fn teardown(&self, service: &ServiceRef) -> anyhow::Result<()> {
        let Some(ref template) = self.hooks.teardown else {
            bail!("no teardown hook configured, {} was not removed", service.name);
        };
        let input = serde_json::to_value(service)?;
        self.run("teardown", template, service, &input).await?;
        Ok(())
    }
}

#[async_trait]
impl NotifyHook for CommandBackend {
    async fn notify_dependents(
        &self,
        service: &ServiceRef,
        dependents: &[String],
    ) -> anyhow::Result<()> {
        let Some(ref template) = self.hooks.notify else {
            return Ok(());
        };
        let input = serde_json::json!({
            "service": service,
            "dependents": dependents,
        });
        self.run("notify", template, service, &input).await?;
        Ok(())
    }
}

/// Logs every call and succeeds
pub struct DryRunBackend;

#[async_trait]
impl ProvisioningBackend for DryRunBackend {
    async fn provision(&self, service: &ResolvedService) -> anyhow::Result<ProvisionResult> {
        tracing::info!("[dry-run] would provision {} at {}", service.name, service.ip);
        Ok(ProvisionResult {
            identity: format!("dry-run-{}", service.name),
        })
    }
}

#[async_trait]
impl ConfigurationBackend for DryRunBackend {
    async fn configure(
        &self,
        service: &ResolvedService,
        _manifest: &Manifest,
    ) -> anyhow::Result<ConfigureResult> {
        tracing::info!("[dry-run] would configure {}", service.name);
        Ok(ConfigureResult::default())
    }
}

#[async_trait]
impl IdentityBackend for DryRunBackend {
    async fn register_app(
        &self,
        service: &ResolvedService,
        auth: &AuthSpec,
    ) -> anyhow::Result<AppHandle> {
        tracing::info!(
            "[dry-run] would register {} application for {}",
            auth.provider,
            service.name
        );
        Ok(AppHandle {
            slug: auth.slug_or(&service.name).to_string(),
            provider: auth.provider,
            client_id: None,
        })
    }
}

#[async_trait]
impl TeardownHook for DryRunBackend {
    async fn teardown(&self, service: &ServiceRef) -> anyhow::Result<()> {
        tracing::info!("[dry-run] would tear down {}", service.name);
        Ok(())
    }
}

#[async_trait]
impl NotifyHook for DryRunBackend {
    async fn notify_dependents(
        &self,
        service: &ServiceRef,
        dependents: &[String],
    ) -> anyhow::Result<()> {
        if !dependents.is_empty() {
            tracing::info!(
                "[dry-run] would notify {} that {} is gone",
                dependents.join(", "),
                service.name
            );
        }
        Ok(())
    }
}
