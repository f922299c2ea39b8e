//! Deployment event log
//!
//! One JSON object per line, appended to `deployments.log` in the state
//! directory for every service and phase transition of a run.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// A logged transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    /// Service or phase name
    pub subject: String,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Append-only JSON-lines log shared by the tasks of a run
#[derive(Clone)]
pub struct DeploymentLog {
    run_id: String,
    file: Option<Arc<Mutex<File>>>,
}

impl DeploymentLog {
    /// Log that drops every event
    pub fn disabled(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            file: None,
        }
    }

    /// Open (or create) the log file for appending
    pub async fn open(path: &Path, run_id: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        tracing::debug!("Appending deployment events to {}", path.display());
        Ok(Self {
            run_id: run_id.to_string(),
            file: Some(Arc::new(Mutex::new(file))),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Append a transition; write failures are logged and otherwise ignored
    pub async fn record(
        &self,
        subject: &str,
        from: impl ToString,
        to: impl ToString,
        message: Option<String>,
    ) {
        let Some(ref file) = self.file else {
            return;
        };

        let event = LogEvent {
            run_id: self.run_id.clone(),
            timestamp: Utc::now(),
            subject: subject.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            message,
        };

        let mut line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Failed to encode deployment event: {}", e);
                return;
            }
        };
        line.push('\n');

        let mut file = file.lock().await;
        let written = match file.write_all(line.as_bytes()).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            tracing::warn!("Failed to write deployment log: {}", e);
        }
    }

    /// Read all events from a log file
    pub async fn read(path: &Path) -> Result<Vec<LogEvent>> {
        let content = tokio::fs::read_to_string(path).await?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(Into::into))
            .collect()
    }
}
