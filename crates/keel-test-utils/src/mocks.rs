use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use keel_core::error::{KeelError, Result};
use keel_core::state::SharedState;
use keel_core::traits::{Tool, ToolCallContext, ToolInvoker, Worker, WorkerContext, WorkerOutput};
use keel_core::types::ToolOutcome;

/// Worker that fails a scripted number of times, then returns fixed fields.
pub struct ScriptedWorker {
    id: String,
    fields: BTreeMap<String, serde_json::Value>,
    fail_first: u32,
    transient: bool,
    delay: Option<Duration>,
    cost_usd: Option<f64>,
    calls: Arc<AtomicU32>,
}

impl ScriptedWorker {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            fields: BTreeMap::new(),
            fail_first: 0,
            transient: true,
            delay: None,
            cost_usd: None,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn produces(mut self, key: &str, value: serde_json::Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    /// Fail the first `n` calls.
    pub fn failing(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    pub fn always_failing(self) -> Self {
        self.failing(u32::MAX)
    }

    /// Failures are reported as non-retryable.
    pub fn permanent(mut self) -> Self {
        self.transient = false;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = Some(cost_usd);
        self
    }

    /// Shared call counter; clone before registering the worker.
    pub fn calls(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

impl Worker for ScriptedWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn execute(&self, _input: SharedState, _ctx: WorkerContext) -> BoxFuture<'_, Result<WorkerOutput>> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if n < self.fail_first {
                let message = format!("scripted failure {}", n + 1);
                return Err(if self.transient {
                    KeelError::worker(&self.id, message)
                } else {
                    KeelError::worker_permanent(&self.id, message)
                });
            }
            let mut out = WorkerOutput::new();
            out.fields = self.fields.clone();
            out.cost_usd = self.cost_usd;
            Ok(out)
        })
    }
}

type WorkerFn =
    dyn Fn(SharedState, WorkerContext) -> BoxFuture<'static, Result<WorkerOutput>> + Send + Sync;

/// Worker backed by a closure.
pub struct FnWorker {
    id: String,
    f: Box<WorkerFn>,
}

impl FnWorker {
    pub fn new<F>(id: &str, f: F) -> Self
    where
        F: Fn(SharedState, WorkerContext) -> BoxFuture<'static, Result<WorkerOutput>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            id: id.to_string(),
            f: Box::new(f),
        }
    }
}

impl Worker for FnWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn execute(&self, input: SharedState, ctx: WorkerContext) -> BoxFuture<'_, Result<WorkerOutput>> {
        (self.f)(input, ctx)
    }
}

/// Tool that fails a scripted number of times, then returns a fixed value.
pub struct ScriptedTool {
    name: String,
    response: serde_json::Value,
    fail_first: u32,
    calls: Arc<AtomicU32>,
}

impl ScriptedTool {
    pub fn new(name: &str, response: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            response,
            fail_first: 0,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn failing(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    pub fn always_failing(self) -> Self {
        self.failing(u32::MAX)
    }

    pub fn calls(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

impl Tool for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, _args: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(KeelError::ToolExecution {
                    tool: self.name.clone(),
                    message: "HTTP 503 Service Unavailable".into(),
                });
            }
            Ok(self.response.clone())
        })
    }

    fn timeout_ms(&self) -> u64 {
        1_000
    }
}

/// Invoker for tests whose workers never call tools.
pub struct NoTools;

impl ToolInvoker for NoTools {
    fn invoke(
        &self,
        tool: &str,
        _args: serde_json::Value,
        _ctx: ToolCallContext,
    ) -> BoxFuture<'_, Result<ToolOutcome>> {
        let tool = tool.to_string();
        Box::pin(async move { Err(KeelError::UnknownTool(tool)) })
    }
}
