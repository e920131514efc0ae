use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use keel_core::error::{KeelError, Result};
use keel_core::traits::Tool;

/// Registry of tool implementations, keyed by catalog tool id.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Call a tool directly under its own timeout, bypassing breakers.
    pub async fn execute(&self, name: &str, args: serde_json::Value) -> Result<serde_json::Value> {
        let tool = self
            .get(name)
            .ok_or_else(|| KeelError::UnknownTool(name.to_string()))?;

        let timeout = Duration::from_millis(tool.timeout_ms());
        match tokio::time::timeout(timeout, tool.call(args)).await {
            Ok(result) => result,
            Err(_) => Err(KeelError::ToolTimeout {
                tool: name.to_string(),
                timeout_ms: tool.timeout_ms(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use serde_json::json;

    struct EchoTool;

    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn call(&self, args: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>> {
            Box::pin(async move { Ok(args) })
        }
    }

    struct SlowTool;

    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn call(&self, _args: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!(null))
            })
        }

        fn timeout_ms(&self) -> u64 {
            50
        }
    }

    #[tokio::test]
    async fn test_register_and_execute() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        reg.register(SlowTool);
        assert_eq!(reg.list(), vec!["echo", "slow"]);

        let out = reg.execute("echo", json!({"a": 1})).await.unwrap();
        assert_eq!(out, json!({"a": 1}));

        assert!(reg.unregister("echo"));
        assert!(matches!(
            reg.execute("echo", json!({})).await,
            Err(KeelError::UnknownTool(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_times_out() {
        let mut reg = ToolRegistry::new();
        reg.register(SlowTool);
        let err = reg.execute("slow", json!({})).await.unwrap_err();
        assert!(matches!(err, KeelError::ToolTimeout { timeout_ms: 50, .. }));
    }
}
