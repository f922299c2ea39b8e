//! Manifest file parser

use super::config::Manifest;
use crate::error::{KeelError, Result};
use std::path::{Path, PathBuf};

/// Default manifest file names, in lookup order
pub const DEFAULT_MANIFEST_FILES: &[&str] = &[
    "keel.yaml",
    "keel.yml",
    "manifest.yaml",
    "manifest.yml",
    "manifest.json",
];

/// Manifest file parser
pub struct ManifestParser;

impl ManifestParser {
    /// Find manifest file in directory
    pub fn find_manifest_file(dir: &Path) -> Option<PathBuf> {
        DEFAULT_MANIFEST_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    /// Parse manifest file from path
    pub fn parse_file(path: &Path) -> Result<Manifest> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            KeelError::ManifestParse(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::parse_str(&content).map_err(|e| match e {
            KeelError::ManifestParse(msg) => {
                KeelError::ManifestParse(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Parse manifest from string (YAML; JSON is accepted as a YAML subset)
    pub fn parse_str(content: &str) -> Result<Manifest> {
        if content.trim().is_empty() {
            return Err(KeelError::ManifestParse("manifest is empty".to_string()));
        }
        serde_yaml::from_str(content)
            .map_err(|e| KeelError::ManifestParse(format!("Failed to parse manifest: {}", e)))
    }
}
