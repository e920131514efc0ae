use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::state::SharedState;
use crate::types::{DegradedResult, ToolOutcome};

/// An external data provider (route, weather, pricing).
///
/// Tools are expected to return `Err` on failure rather than a silent default.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (matches the catalog's tool id).
    fn name(&self) -> &str;

    /// Call the tool with JSON arguments.
    fn call(&self, args: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// Per-call timeout in milliseconds.
    fn timeout_ms(&self) -> u64 {
        10_000
    }
}

/// Per-call context threaded into the resilience layer.
#[derive(Debug, Clone, Default)]
pub struct ToolCallContext {
    pub correlation_id: String,
    pub cancel: CancellationToken,
}

/// Narrow interface workers use to reach tools.
///
/// Implemented by the resilience layer; callers never see a breaker-open
/// rejection when a fallback exists, only a degraded outcome.
pub trait ToolInvoker: Send + Sync + 'static {
    fn invoke(
        &self,
        tool: &str,
        args: serde_json::Value,
        ctx: ToolCallContext,
    ) -> BoxFuture<'_, Result<ToolOutcome>>;
}

/// Context handed to a worker for one stage invocation.
#[derive(Clone)]
pub struct WorkerContext {
    pub correlation_id: String,
    pub stage_id: String,
    pub query: String,
    /// Cancelled when the stage times out; tool calls should observe it.
    pub cancel: CancellationToken,
    pub tools: Arc<dyn ToolInvoker>,
}

impl WorkerContext {
    /// Invoke a tool with this stage's cancellation token.
    pub async fn call_tool(&self, tool: &str, args: serde_json::Value) -> Result<ToolOutcome> {
        let ctx = ToolCallContext {
            correlation_id: self.correlation_id.clone(),
            cancel: self.cancel.clone(),
        };
        self.tools.invoke(tool, args, ctx).await
    }
}

/// Fields produced by one worker invocation.
#[derive(Debug, Clone, Default)]
pub struct WorkerOutput {
    pub fields: BTreeMap<String, serde_json::Value>,
    /// Actual cost, if the worker knows it. Falls back to the estimate.
    pub cost_usd: Option<f64>,
    /// Degradations the worker absorbed while producing its fields.
    pub degradations: Vec<DegradedResult>,
}

impl WorkerOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = Some(cost_usd);
        self
    }

    pub fn with_degradation(mut self, degraded: DegradedResult) -> Self {
        self.degradations.push(degraded);
        self
    }
}

/// One domain agent.
///
/// Workers must be safe to retry and must declare their inputs and outputs
/// truthfully in the catalog.
pub trait Worker: Send + Sync + 'static {
    /// Worker id (matches the catalog's worker id).
    fn id(&self) -> &str;

    /// Execute against a slice of the shared state.
    fn execute(&self, input: SharedState, ctx: WorkerContext) -> BoxFuture<'_, Result<WorkerOutput>>;
}

/// Key-value store with per-key TTL.
///
/// Backs the checkpoint reference store, the tool-result cache and the
/// classification cache. No multi-key transactions.
pub trait KvStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>>>;

    /// Set a key. `ttl` of `None` means no expiry.
    fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> BoxFuture<'_, Result<()>>;

    /// Delete a key. Returns whether it existed.
    fn del(&self, key: &str) -> BoxFuture<'_, Result<bool>>;

    /// Keys matching a glob pattern (`*` and `?` wildcards), sorted.
    fn keys(&self, pattern: &str) -> BoxFuture<'_, Result<Vec<String>>>;
}
