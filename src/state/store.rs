//! State persistence
//!
//! Keeps `state.json` in the state directory. Saves go through a temp file
//! renamed over the old document so a crash never leaves a torn file; the
//! previous document is kept as `state.json.backup`.

use super::document::{DeploymentState, STATE_VERSION};
use crate::error::{KeelError, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;

const STATE_FILE: &str = "state.json";
const STATE_BACKUP: &str = "state.json.backup";
const STATE_TEMP: &str = "state.json.tmp";
/// Report of the most recent deploy run
pub const LAST_RUN_FILE: &str = "last-run.json";
/// Dependency graph report
pub const GRAPH_FILE: &str = "graph.json";
/// JSON-lines deployment event log
pub const LOG_FILE: &str = "deployments.log";

/// Reads and writes the state directory
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn backup_path(&self) -> PathBuf {
        self.dir.join(STATE_BACKUP)
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).await?;
            tracing::debug!("Created state directory: {}", self.dir.display());
        }
        Ok(())
    }

    /// Load the persisted state, or an empty document on first run
    pub async fn load(&self) -> Result<DeploymentState> {
        let path = self.state_path();
        if !path.exists() {
            tracing::debug!("State file not found, starting from empty state");
            return Ok(DeploymentState::new());
        }

        let content = fs::read_to_string(&path).await?;
        let state: DeploymentState = serde_json::from_str(&content).map_err(|e| {
            KeelError::State(format!("{} is not a valid state document: {}", path.display(), e))
        })?;

        if state.version > STATE_VERSION {
            return Err(KeelError::State(format!(
                "State file version {} is newer than supported version {}",
                state.version, STATE_VERSION
            )));
        }

        tracing::debug!(
            "Loaded state generation {} with {} service(s)",
            state.generation,
            state.services.len()
        );
        Ok(state)
    }

    /// Atomically replace the persisted state; returns the document as written
    pub async fn save(&self, state: &DeploymentState) -> Result<DeploymentState> {
        self.ensure_dir().await?;

        let stamped = state.stamped();
        let path = self.state_path();
        let temp = self.dir.join(STATE_TEMP);

        fs::write(&temp, serde_json::to_string_pretty(&stamped)?).await?;
        if path.exists() {
            fs::copy(&path, self.backup_path()).await?;
        }
        fs::rename(&temp, &path).await?;

        tracing::debug!(
            "Saved state generation {} with {} service(s)",
            stamped.generation,
            stamped.services.len()
        );
        Ok(stamped)
    }

    /// Write a JSON report next to the state document
    pub async fn write_report<T: Serialize>(&self, file: &str, report: &T) -> Result<PathBuf> {
        self.ensure_dir().await?;
        let path = self.dir.join(file);
        fs::write(&path, serde_json::to_string_pretty(report)?).await?;
        tracing::debug!("Wrote {}", path.display());
        Ok(path)
    }

    /// Read a JSON report written by [`StateStore::write_report`]
    pub async fn read_report<T: serde::de::DeserializeOwned>(&self, file: &str) -> Result<Option<T>> {
        let path = self.dir.join(file);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::document::ServiceRecord;
    use chrono::Utc;
    use tempfile::tempdir;

    fn record(hash: &str) -> ServiceRecord {
        ServiceRecord {
            deployed_at: Utc::now(),
            config_hash: hash.to_string(),
            version: None,
            dependencies: Default::default(),
            ip: "10.0.0.5".to_string(),
            hostname: "dns.lan".to_string(),
        }
    }

    #[tokio::test]
    async fn test_load_missing_is_empty() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(temp.path().join(".keel"));
        let state = store.load().await.unwrap();
        assert!(state.is_empty());
        assert_eq!(state.generation, 0);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(temp.path().join(".keel"));

        let mut state = DeploymentState::new();
        state.services.insert("dns".to_string(), record("one"));
        let written = store.save(&state).await.unwrap();
        assert_eq!(written.generation, 1);

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, written);
        assert!(!store.backup_path().exists());
        assert!(!temp.path().join(".keel").join(STATE_TEMP).exists());
    }

    #[tokio::test]
    async fn test_save_keeps_backup() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(temp.path());

        let mut state = DeploymentState::new();
        state.services.insert("dns".to_string(), record("one"));
        let first = store.save(&state).await.unwrap();

        let mut next = first.clone();
        next.services.insert("dns".to_string(), record("two"));
        let second = store.save(&next).await.unwrap();
        assert_eq!(second.generation, 2);

        let backup: DeploymentState =
            serde_json::from_str(&std::fs::read_to_string(store.backup_path()).unwrap()).unwrap();
        assert_eq!(backup.services["dns"].config_hash, "one");
        assert_eq!(store.load().await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_newer_version_is_refused() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(temp.path());
        std::fs::write(
            store.state_path(),
            format!(r#"{{"version": {}}}"#, STATE_VERSION + 1),
        )
        .unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, KeelError::State(_)));
    }

    #[tokio::test]
    async fn test_reports() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(temp.path());
        assert!(store
            .read_report::<serde_json::Value>(LAST_RUN_FILE)
            .await
            .unwrap()
            .is_none());

        store
            .write_report(GRAPH_FILE, &serde_json::json!({"nodes": [], "edges": []}))
            .await
            .unwrap();
        let graph: serde_json::Value = store.read_report(GRAPH_FILE).await.unwrap().unwrap();
        assert_eq!(graph["edges"], serde_json::json!([]));
    }
}
