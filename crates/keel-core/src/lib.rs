pub mod catalog;
pub mod config;
pub mod error;
pub mod event;
pub mod state;
pub mod traits;
pub mod types;
pub mod workflow;

pub use catalog::{Catalog, RetryPolicy, ToolDefinition, WorkerDefinition};
pub use config::AppConfig;
pub use error::{KeelError, Result};
pub use event::EventBus;
pub use state::SharedState;
pub use types::*;
pub use workflow::{Condition, WorkflowDefinition, WorkflowStep, WorkflowTable};
