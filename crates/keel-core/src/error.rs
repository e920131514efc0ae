use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeelError {
    // Plan errors
    #[error("Plan rejected: {}", errors.join("; "))]
    PlanInvalid { errors: Vec<String> },

    #[error("Dependency cycle detected: {path}")]
    CycleDetected { path: String },

    #[error("Worker not found in catalog: {0}")]
    UnknownWorker(String),

    #[error("Tool not found in catalog: {0}")]
    UnknownTool(String),

    #[error("No workflow or route for query type: {0}")]
    NoWorkflow(String),

    // Stage errors
    #[error("Worker failed: {worker}: {message}")]
    WorkerFailed {
        worker: String,
        message: String,
        transient: bool,
    },

    #[error("Stage timeout after {timeout_ms}ms: {stage}")]
    StageTimeout { stage: String, timeout_ms: u64 },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Cancelled")]
    Cancelled,

    // Tool / resilience errors
    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_ms}ms: {tool}")]
    ToolTimeout { tool: String, timeout_ms: u64 },

    #[error("Tool unavailable: {tool}: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    // Persistence errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Checkpoint not found: {thread_id}/{checkpoint_id}")]
    CheckpointNotFound {
        thread_id: String,
        checkpoint_id: String,
    },

    #[error("Checkpoint integrity check failed: {reason}")]
    CheckpointIntegrity { reason: String },

    #[error("Invalid thread id {id:?}: {reason}")]
    InvalidThreadId { id: String, reason: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KeelError {
    /// Whether a retry of the same call could plausibly succeed.
    ///
    /// Timeouts at the stage level, validation failures, cancellations and
    /// breaker-open rejections are final for the attempt that produced them.
    pub fn is_transient(&self) -> bool {
        match self {
            KeelError::ToolExecution { .. } | KeelError::ToolTimeout { .. } => true,
            KeelError::WorkerFailed { transient, .. } => *transient,
            KeelError::Store(_) => true,
            _ => false,
        }
    }

    /// Shorthand for a retryable worker failure.
    pub fn worker(worker: impl Into<String>, message: impl Into<String>) -> Self {
        KeelError::WorkerFailed {
            worker: worker.into(),
            message: message.into(),
            transient: true,
        }
    }

    /// Shorthand for a worker failure that retrying cannot fix.
    pub fn worker_permanent(worker: impl Into<String>, message: impl Into<String>) -> Self {
        KeelError::WorkerFailed {
            worker: worker.into(),
            message: message.into(),
            transient: false,
        }
    }
}

pub type Result<T> = std::result::Result<T, KeelError>;
