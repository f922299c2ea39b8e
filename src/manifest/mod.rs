//! Deployment manifest
//!
//! Parsing, configuration types, and validation of the declarative fleet
//! description.

pub mod config;
pub mod ordered;
pub mod parser;
pub mod validator;

pub use config::{
    AuthProvider, AuthSpec, HealthSpec, Manifest, NetworkConfig, PhaseMap, ResourceHints,
    ServiceMap, ServiceNode,
};
pub use ordered::OrderedMap;
pub use parser::{ManifestParser, DEFAULT_MANIFEST_FILES};
pub use validator::{validate, ManifestValidator, ResolvedService, ValidatedManifest, Violation};
