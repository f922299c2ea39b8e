//! Deployment execution
//!
//! Collaborator interfaces, the per-service and per-phase state machines,
//! the executor that drives them and the event log it writes.

pub mod backend;
pub mod executor;
pub mod log;
pub mod status;

pub use backend::{
    AppHandle, Collaborators, CommandBackend, ConfigurationBackend, ConfigureResult,
    DryRunBackend, IdentityBackend, NotifyHook, ProvisionResult, ProvisioningBackend, ServiceRef,
    TeardownHook,
};
pub use executor::{retry_delay, DeploymentExecutor, MAX_RETRY_DELAY};
pub use log::{DeploymentLog, LogEvent};
pub use status::{
    DeploymentReport, FailureKind, PhaseReport, PhaseState, ServiceAction, ServiceFailure,
    ServiceReport, ServiceState,
};
