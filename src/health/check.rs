//! Health check descriptors

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Kind of health check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckKind {
    /// A supervised process/unit is active
    ProcessActive,
    /// An HTTP endpoint answers
    HttpEndpoint,
    /// A TCP port accepts connections
    TcpPort,
    /// A database accepts connections
    DbConnection,
    /// A path exists on the filesystem
    Filesystem,
    /// An arbitrary command exits successfully
    CustomCommand,
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckKind::ProcessActive => write!(f, "process-active"),
            CheckKind::HttpEndpoint => write!(f, "http-endpoint"),
            CheckKind::TcpPort => write!(f, "tcp-port"),
            CheckKind::DbConnection => write!(f, "db-connection"),
            CheckKind::Filesystem => write!(f, "filesystem"),
            CheckKind::CustomCommand => write!(f, "custom-command"),
        }
    }
}

/// A concrete, runnable health check
///
/// String fields may carry `{name}`, `{ip}` and `{hostname}` placeholders
/// until they are bound to a service with [`CheckDescriptor::bind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CheckDescriptor {
    ProcessActive {
        /// Unit name (e.g. "postgresql.service")
        unit: String,
        /// Host to check through the remote shell; local when absent
        #[serde(default)]
        host: Option<String>,
    },
    HttpEndpoint {
        url: String,
        /// Expected status; any 2xx when absent
        #[serde(default)]
        expected_status: Option<u16>,
    },
    TcpPort {
        host: String,
        port: u16,
    },
    DbConnection {
        host: String,
        port: u16,
        /// Client command (e.g. "pg_isready -h {ip}"); plain TCP connect when absent
        #[serde(default)]
        command: Option<String>,
    },
    Filesystem {
        path: PathBuf,
        #[serde(default)]
        writable: bool,
    },
    CustomCommand {
        command: String,
    },
}

impl CheckDescriptor {
    /// Kind of this check
    pub fn kind(&self) -> CheckKind {
        match self {
            CheckDescriptor::ProcessActive { .. } => CheckKind::ProcessActive,
            CheckDescriptor::HttpEndpoint { .. } => CheckKind::HttpEndpoint,
            CheckDescriptor::TcpPort { .. } => CheckKind::TcpPort,
            CheckDescriptor::DbConnection { .. } => CheckKind::DbConnection,
            CheckDescriptor::Filesystem { .. } => CheckKind::Filesystem,
            CheckDescriptor::CustomCommand { .. } => CheckKind::CustomCommand,
        }
    }

    /// Substitute service identity placeholders
    pub fn bind(&self, target: &CheckTarget) -> CheckDescriptor {
        let sub = |s: &str| target.substitute(s);
        match self {
            CheckDescriptor::ProcessActive { unit, host } => CheckDescriptor::ProcessActive {
                unit: sub(unit),
                host: host.as_deref().map(sub),
            },
            CheckDescriptor::HttpEndpoint {
                url,
                expected_status,
            } => CheckDescriptor::HttpEndpoint {
                url: sub(url),
                expected_status: *expected_status,
            },
            CheckDescriptor::TcpPort { host, port } => CheckDescriptor::TcpPort {
                host: sub(host),
                port: *port,
            },
            CheckDescriptor::DbConnection {
                host,
                port,
                command,
            } => CheckDescriptor::DbConnection {
                host: sub(host),
                port: *port,
                command: command.as_deref().map(sub),
            },
            CheckDescriptor::Filesystem { path, writable } => CheckDescriptor::Filesystem {
                path: PathBuf::from(sub(&path.to_string_lossy())),
                writable: *writable,
            },
            CheckDescriptor::CustomCommand { command } => CheckDescriptor::CustomCommand {
                command: sub(command),
            },
        }
    }
}

impl std::fmt::Display for CheckDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckDescriptor::ProcessActive { unit, host } => match host {
                Some(h) => write!(f, "process-active {} on {}", unit, h),
                None => write!(f, "process-active {}", unit),
            },
            CheckDescriptor::HttpEndpoint { url, .. } => write!(f, "http-endpoint {}", url),
            CheckDescriptor::TcpPort { host, port } => write!(f, "tcp-port {}:{}", host, port),
            CheckDescriptor::DbConnection { host, port, .. } => {
                write!(f, "db-connection {}:{}", host, port)
            }
            CheckDescriptor::Filesystem { path, .. } => {
                write!(f, "filesystem {}", path.display())
            }
            CheckDescriptor::CustomCommand { command } => write!(f, "custom-command `{}`", command),
        }
    }
}

/// Stage reference in a manifest: either a bare kind resolved through the
/// pattern registry, or a full descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckRef {
    Kind(CheckKind),
    Descriptor(CheckDescriptor),
}

/// Health check stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Startup,
    Liveness,
    Readiness,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Startup => write!(f, "startup"),
            Stage::Liveness => write!(f, "liveness"),
            Stage::Readiness => write!(f, "readiness"),
        }
    }
}

/// Identity values available to check templates
#[derive(Debug, Clone)]
pub struct CheckTarget {
    pub name: String,
    pub ip: String,
    pub hostname: String,
}

impl CheckTarget {
    pub fn new(name: &str, ip: &str, hostname: &str) -> Self {
        Self {
            name: name.to_string(),
            ip: ip.to_string(),
            hostname: hostname.to_string(),
        }
    }

    fn substitute(&self, s: &str) -> String {
        s.replace("{name}", &self.name)
            .replace("{ip}", &self.ip)
            .replace("{hostname}", &self.hostname)
    }
}

/// Retry/timeout policy for one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePolicy {
    /// Stage fails once this elapses
    #[serde(with = "secs")]
    pub timeout: Duration,
    /// Delay between probe attempts
    #[serde(with = "secs")]
    pub interval: Duration,
    /// Stage fails after this many failed probes
    pub max_retries: u32,
}

/// A bound check with its policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCheck {
    pub stage: Stage,
    pub check: CheckDescriptor,
}

/// Fully resolved health checks for one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthPlan {
    pub startup: CheckDescriptor,
    pub liveness: CheckDescriptor,
    pub readiness: Option<CheckDescriptor>,
    pub policy: StagePolicy,
}

impl HealthPlan {
    /// Stages in evaluation order
    pub fn stages(&self) -> Vec<StageCheck> {
        let mut stages = vec![
            StageCheck {
                stage: Stage::Startup,
                check: self.startup.clone(),
            },
            StageCheck {
                stage: Stage::Liveness,
                check: self.liveness.clone(),
            },
        ];
        if let Some(ref readiness) = self.readiness {
            stages.push(StageCheck {
                stage: Stage::Readiness,
                check: readiness.clone(),
            });
        }
        stages
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
