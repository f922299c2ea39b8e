//! Probe executors
//!
//! A probe runs exactly one concrete check and answers healthy or not. The
//! engine owns retries and timeouts; probes only bound their own call.

use super::check::CheckDescriptor;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;

/// Runs one concrete health check
#[async_trait]
pub trait Probe: Send + Sync {
    /// Run the check once; `true` means healthy
    async fn probe(&self, check: &CheckDescriptor) -> bool;
}

/// Probe that runs checks against the live system
pub struct SystemProbe {
    /// Upper bound for a single probe call
    probe_timeout: Duration,
    /// Command prefix for host-targeted command checks, e.g. `["ssh", "root@{host}"]`
    remote_shell: Option<Vec<String>>,
    http: reqwest::Client,
}

impl SystemProbe {
    pub fn new(probe_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(probe_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            probe_timeout,
            remote_shell: None,
            http,
        }
    }

    /// Run host-targeted commands through this prefix (`{host}` is substituted)
    pub fn with_remote_shell(mut self, prefix: Option<String>) -> Self {
        self.remote_shell = prefix
            .map(|p| p.split_whitespace().map(String::from).collect::<Vec<_>>())
            .filter(|parts| !parts.is_empty());
        self
    }

    async fn run_command(&self, program: &str, args: &[String]) -> bool {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(self.probe_timeout, cmd.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                tracing::debug!("Probe command {} failed to start: {}", program, e);
                false
            }
            Err(_) => {
                tracing::debug!("Probe command {} timed out", program);
                false
            }
        }
    }

    async fn run_shell(&self, script: &str, host: Option<&str>) -> bool {
        match (host, &self.remote_shell) {
            (Some(host), Some(prefix)) => {
                let mut parts: Vec<String> = prefix.iter().map(|p| p.replace("{host}", host)).collect();
                let program = parts.remove(0);
                parts.push(script.to_string());
                self.run_command(&program, &parts).await
            }
            _ => {
                self.run_command("sh", &["-c".to_string(), script.to_string()])
                    .await
            }
        }
    }

    async fn tcp_connect(&self, host: &str, port: u16) -> bool {
        let addr = format!("{}:{}", host, port);
        matches!(
            tokio::time::timeout(self.probe_timeout, TcpStream::connect(&addr)).await,
            Ok(Ok(_))
        )
    }
}

#[async_trait]
impl Probe for SystemProbe {
    async fn probe(&self, check: &CheckDescriptor) -> bool {
        match check {
            CheckDescriptor::ProcessActive { unit, host } => {
                let script = format!("systemctl is-active --quiet {}", unit);
                self.run_shell(&script, host.as_deref()).await
            }
            CheckDescriptor::HttpEndpoint {
                url,
                expected_status,
            } => match self.http.get(url).send().await {
                Ok(resp) => match expected_status {
                    Some(code) => resp.status().as_u16() == *code,
                    None => resp.status().is_success(),
                },
                Err(e) => {
                    tracing::debug!("HTTP probe {} failed: {}", url, e);
                    false
                }
            },
            CheckDescriptor::TcpPort { host, port } => self.tcp_connect(host, *port).await,
            CheckDescriptor::DbConnection {
                host,
                port,
                command,
            } => match command {
                Some(command) => self.run_shell(command, None).await,
                None => self.tcp_connect(host, *port).await,
            },
            CheckDescriptor::Filesystem { path, writable } => {
                match tokio::fs::metadata(path).await {
                    Ok(meta) => !*writable || !meta.permissions().readonly(),
                    Err(_) => false,
                }
            }
            CheckDescriptor::CustomCommand { command } => self.run_shell(command, None).await,
        }
    }
}
