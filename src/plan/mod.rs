//! Phase planning

pub mod planner;

pub use planner::{plan, ExecutionPlan, Phase, PlanMode, PlanViolation};
