//! Deployment state
//!
//! The persisted record of what has been deployed, the diff that turns it
//! into incremental work, the store that keeps it on disk and the status
//! report built from it.

pub mod document;
pub mod report;
pub mod store;
pub mod tracker;

pub use document::{DeploymentState, ResourceRecord, ServiceRecord, StateEntry, STATE_VERSION};
pub use report::{Drift, LiveHealth, ServiceStatus, StatusReport};
pub use store::{StateStore, GRAPH_FILE, LAST_RUN_FILE, LOG_FILE};
pub use tracker::{DeployDiff, StateTracker};
