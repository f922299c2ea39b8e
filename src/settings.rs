//! Layered configuration
//!
//! The effective deployment configuration is built in a fixed order:
//! built-in defaults, then the manifest, then runtime overrides (settings
//! file and command line). Each step only replaces values that the layer
//! actually sets.

use crate::error::{KeelError, Result};
use crate::health::StagePolicy;
use crate::manifest::Manifest;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default overall health budget per service (seconds)
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: u64 = 300;
/// Default attempts per collaborator call
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
/// Default base delay between collaborator retries (seconds)
pub const DEFAULT_RETRY_DELAY: u64 = 10;
/// Default poll interval for health stages (seconds)
pub const DEFAULT_POLL_INTERVAL: u64 = 5;
/// Default limit for a single collaborator call (seconds)
pub const DEFAULT_HOOK_TIMEOUT: u64 = 600;
/// Settings file name under the user config directory
pub const SETTINGS_FILE: &str = "config.yaml";
/// Default state directory, relative to the manifest
pub const DEFAULT_STATE_DIR: &str = ".keel";

/// Feature flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub rollback: bool,
    pub health_monitoring: bool,
    pub dependency_graphing: bool,
    pub deployment_logging: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            rollback: true,
            health_monitoring: true,
            dependency_graphing: true,
            deployment_logging: true,
        }
    }
}

/// Effective deployment configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Overall health budget per service
    pub health_check_timeout: Duration,
    /// Attempts per collaborator call
    pub retry_attempts: u32,
    /// Base delay between collaborator retries
    pub retry_delay: Duration,
    /// Poll interval for health stages without their own
    pub poll_interval: Duration,
    /// Limit for a single collaborator call
    pub hook_timeout: Duration,
    pub flags: FeatureFlags,
}

impl DeploymentConfig {
    /// Built-in defaults
    pub fn defaults() -> Self {
        Self {
            health_check_timeout: Duration::from_secs(DEFAULT_HEALTH_CHECK_TIMEOUT),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL),
            hook_timeout: Duration::from_secs(DEFAULT_HOOK_TIMEOUT),
            flags: FeatureFlags::default(),
        }
    }

    /// Apply values set in the manifest
    pub fn with_manifest(mut self, manifest: &Manifest) -> Self {
        if let Some(secs) = manifest.health_check_timeout {
            self.health_check_timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = manifest.retry_attempts {
            self.retry_attempts = attempts;
        }
        if let Some(secs) = manifest.retry_delay {
            self.retry_delay = Duration::from_secs(secs);
        }
        if let Some(on) = manifest.enable_rollback {
            self.flags.rollback = on;
        }
        if let Some(on) = manifest.enable_health_monitoring {
            self.flags.health_monitoring = on;
        }
        if let Some(on) = manifest.enable_dependency_graphing {
            self.flags.dependency_graphing = on;
        }
        if let Some(on) = manifest.enable_deployment_logging {
            self.flags.deployment_logging = on;
        }
        self
    }

    /// Apply runtime overrides
    pub fn with_overrides(mut self, overrides: &Overrides) -> Self {
        if let Some(secs) = overrides.health_check_timeout {
            self.health_check_timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = overrides.retry_attempts {
            self.retry_attempts = attempts;
        }
        if let Some(secs) = overrides.retry_delay {
            self.retry_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = overrides.hook_timeout {
            self.hook_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(on) = overrides.enable_rollback {
            self.flags.rollback = on;
        }
        if let Some(on) = overrides.enable_health_monitoring {
            self.flags.health_monitoring = on;
        }
        self
    }

    /// Resolve in precedence order: defaults < manifest < overrides
    pub fn resolve(manifest: &Manifest, overrides: &Overrides) -> Self {
        Self::defaults()
            .with_manifest(manifest)
            .with_overrides(overrides)
    }

    /// Stage policy for services that declare none of their own
    pub fn default_stage_policy(&self) -> StagePolicy {
        StagePolicy {
            timeout: self.health_check_timeout,
            interval: self.poll_interval,
            max_retries: self.retry_attempts.max(1),
        }
    }
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

/// Runtime overrides (settings file, environment, command line)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overrides {
    #[serde(default)]
    pub health_check_timeout: Option<u64>,
    #[serde(default)]
    pub retry_attempts: Option<u32>,
    #[serde(default)]
    pub retry_delay: Option<u64>,
    #[serde(default)]
    pub hook_timeout: Option<u64>,
    #[serde(default)]
    pub enable_rollback: Option<bool>,
    #[serde(default)]
    pub enable_health_monitoring: Option<bool>,
}

impl Overrides {
    /// Layer `other` on top of `self`
    pub fn merged_with(mut self, other: &Overrides) -> Self {
        if other.health_check_timeout.is_some() {
            self.health_check_timeout = other.health_check_timeout;
        }
        if other.retry_attempts.is_some() {
            self.retry_attempts = other.retry_attempts;
        }
        if other.retry_delay.is_some() {
            self.retry_delay = other.retry_delay;
        }
        if other.hook_timeout.is_some() {
            self.hook_timeout = other.hook_timeout;
        }
        if other.enable_rollback.is_some() {
            self.enable_rollback = other.enable_rollback;
        }
        if other.enable_health_monitoring.is_some() {
            self.enable_health_monitoring = other.enable_health_monitoring;
        }
        self
    }
}

/// Shell command templates for the external collaborators
///
/// Each command runs through `sh -c` with `KEEL_SERVICE`, `KEEL_IP`,
/// `KEEL_HOSTNAME` and `KEEL_CATEGORY` set and the service definition as
/// JSON on stdin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookCommands {
    #[serde(default)]
    pub provision: Option<String>,
    #[serde(default)]
    pub configure: Option<String>,
    #[serde(default)]
    pub register_app: Option<String>,
    #[serde(default)]
    pub teardown: Option<String>,
    #[serde(default)]
    pub notify: Option<String>,
}

/// Runtime settings file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Where state, reports and logs are written
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// Concurrent services per phase
    #[serde(default)]
    pub max_parallel: Option<usize>,
    /// Command prefix for host-targeted checks, e.g. "ssh root@{host}"
    #[serde(default)]
    pub remote_shell: Option<String>,
    /// Per-probe timeout (seconds)
    #[serde(default)]
    pub probe_timeout: Option<u64>,
    #[serde(default)]
    pub hooks: HookCommands,
    #[serde(default)]
    pub overrides: Overrides,
}

impl Settings {
    /// Default settings file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("keel").join(SETTINGS_FILE))
    }

    /// Load settings from `path`, or from the default location when it exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) if p.exists() => p,
                _ => {
                    tracing::debug!("No settings file found, using defaults");
                    return Ok(Settings::default());
                }
            },
        };

        let content = std::fs::read_to_string(&path).map_err(|e| {
            KeelError::InvalidConfig(format!(
                "Failed to read settings file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse_str(&content).map_err(|e| {
            KeelError::InvalidConfig(format!("{}: {}", path.display(), e))
        })
    }

    pub fn parse_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// State directory, relative to the manifest directory unless absolute
    pub fn state_dir_for(&self, manifest_dir: &Path) -> PathBuf {
        match &self.state_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => manifest_dir.join(dir),
            None => manifest_dir.join(DEFAULT_STATE_DIR),
        }
    }

    /// Concurrent services per phase
    pub fn max_parallel(&self) -> usize {
        self.max_parallel.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout.unwrap_or(10))
    }
}
