//! Rollback of applied phases

pub mod manager;

pub use manager::{
    targets_from_state, AppliedPhase, RollbackEntry, RollbackManager, RollbackReport,
    RollbackTarget, ORPHANED_PHASE,
};
