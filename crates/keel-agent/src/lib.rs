pub mod engine;
pub mod executor;
pub mod intent;
pub mod plan;
pub mod ranking;
pub mod registry;
pub mod run_log;

pub use engine::{Engine, EngineBuilder, RunReport};
pub use executor::{ExecutionOutcome, PlanExecutor};
pub use intent::{normalize_query, CachedClassifier, IntentClassifier, KeywordClassifier};
pub use plan::{
    Classification, Degradation, Estimates, ExecutionPlan, ExecutionResult, PlanContext,
    PlanGenerator, PlanRequest, PlanValidator, Priority, Stage, StageError, ValidatedPlan,
    ValidationResult, VsEstimates,
};
pub use ranking::{rank_candidates, Candidate, RankedCandidate};
pub use registry::WorkerRegistry;
pub use run_log::{RunLogStats, RunLogger};
