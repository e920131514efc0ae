//! Execution plan model, generator and validator.

pub mod generator;
pub mod types;
pub mod validator;

pub use generator::{PlanGenerator, PlanRequest};
pub use types::{
    Classification, Degradation, Estimates, ExecutionPlan, ExecutionResult, PlanContext, Priority,
    Stage, StageError, ValidatedPlan, ValidationResult, VsEstimates,
};
pub use validator::PlanValidator;
