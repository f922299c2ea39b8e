//! Health checking
//!
//! Check descriptors, the pattern registry that synthesizes them, probe
//! executors that run them, and the engine that applies retry/timeout
//! semantics across a service's startup, liveness and readiness stages.

pub mod cancel;
pub mod check;
pub mod engine;
pub mod probe;
pub mod registry;

pub use cancel::{CancelHandle, Cancellation};
pub use check::{
    CheckDescriptor, CheckKind, CheckRef, CheckTarget, HealthPlan, Stage, StageCheck, StagePolicy,
};
pub use engine::{AggregateResult, CheckResult, HealthCheckEngine, StageOutcome, UnhealthyCause};
pub use probe::{Probe, SystemProbe};
pub use registry::{PatternRegistry, StageDefaults, UnresolvedCheck, GENERIC_CATEGORY};
