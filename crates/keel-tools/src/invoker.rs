use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::{debug, warn};

use keel_core::config::ToolRetryConfig;
use keel_core::error::{KeelError, Result};
use keel_core::event::EventBus;
use keel_core::traits::{ToolCallContext, ToolInvoker};
use keel_core::types::{KeelEvent, ToolOutcome};

use crate::breaker::CircuitBreakerRegistry;
use crate::fallback::FallbackDispatcher;
use crate::registry::ToolRegistry;

fn calculate_backoff(attempt: u32, config: &ToolRetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    if !config.jitter {
        return Duration::from_millis(ms);
    }
    // 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

/// Routes every tool call through its circuit breaker, retries transient
/// failures with backoff, and substitutes a degraded result when the call
/// cannot complete.
pub struct ResilientToolInvoker {
    registry: Arc<ToolRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    fallbacks: Arc<FallbackDispatcher>,
    retry: ToolRetryConfig,
    event_bus: Option<Arc<EventBus>>,
}

impl ResilientToolInvoker {
    pub fn new(
        registry: Arc<ToolRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        fallbacks: Arc<FallbackDispatcher>,
        retry: ToolRetryConfig,
    ) -> Self {
        Self {
            registry,
            breakers,
            fallbacks,
            retry,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    fn emit(&self, ctx: &ToolCallContext, tool: &str, succeeded: bool, degraded: bool, start: Instant) {
        if let Some(bus) = &self.event_bus {
            bus.publish(KeelEvent::ToolCall {
                correlation_id: ctx.correlation_id.clone(),
                tool: tool.to_string(),
                succeeded,
                degraded,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }
    }

    async fn call_with_retries(
        &self,
        tool: &str,
        args: &serde_json::Value,
        ctx: &ToolCallContext,
    ) -> Result<serde_json::Value> {
        let implementation = self
            .registry
            .get(tool)
            .ok_or_else(|| KeelError::UnknownTool(tool.to_string()))?;
        let timeout_ms = implementation.timeout_ms();
        let max_retries = self.retry.max_retries;

        let mut attempt = 0;
        loop {
            let Some(permit) = self.breakers.try_acquire(tool) else {
                return Err(KeelError::ToolUnavailable {
                    tool: tool.to_string(),
                    reason: "circuit breaker open".into(),
                });
            };

            let call = tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                implementation.call(args.clone()),
            );
            let outcome = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    permit.abandon();
                    return Err(KeelError::Cancelled);
                }
                r = call => r,
            };

            let err = match outcome {
                Ok(Ok(value)) => {
                    permit.success();
                    return Ok(value);
                }
                Ok(Err(e)) => e,
                Err(_) => KeelError::ToolTimeout {
                    tool: tool.to_string(),
                    timeout_ms,
                },
            };
            permit.failure();

            if !err.is_transient() || attempt >= max_retries {
                return Err(err);
            }

            let backoff = calculate_backoff(attempt, &self.retry);
            warn!(
                tool,
                attempt = attempt + 1,
                max_retries,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Retrying tool call"
            );
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(KeelError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
            attempt += 1;
        }
    }
}

impl ToolInvoker for ResilientToolInvoker {
    fn invoke(
        &self,
        tool: &str,
        args: serde_json::Value,
        ctx: ToolCallContext,
    ) -> BoxFuture<'_, Result<ToolOutcome>> {
        let tool = tool.to_string();
        Box::pin(async move {
            let start = Instant::now();

            let err = match self.call_with_retries(&tool, &args, &ctx).await {
                Ok(value) => {
                    self.fallbacks.remember(&tool, &args, &value).await;
                    self.emit(&ctx, &tool, true, false, start);
                    return Ok(ToolOutcome::Ok(value));
                }
                Err(e @ (KeelError::Cancelled | KeelError::UnknownTool(_))) => return Err(e),
                Err(e) => e,
            };

            match self.fallbacks.get_fallback_response(&tool, &err, &args).await {
                Some(degraded) => {
                    debug!(tool = %tool, reason = %degraded.reason, "Returning degraded result");
                    self.emit(&ctx, &tool, false, true, start);
                    Ok(ToolOutcome::Degraded(degraded))
                }
                None => {
                    self.emit(&ctx, &tool, false, false, start);
                    Err(err)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use keel_core::catalog::FallbackKind;
    use keel_core::config::BreakerConfig;
    use keel_core::traits::Tool;
    use keel_core::types::DegradationSource;
    use keel_memory::MemoryKv;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `fail_first` calls, then echoes its arguments.
    struct FlakyTool {
        name: &'static str,
        fail_first: u32,
        calls: Arc<AtomicU32>,
    }

    impl Tool for FlakyTool {
        fn name(&self) -> &str {
            self.name
        }

        fn call(&self, args: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n < self.fail_first {
                    Err(KeelError::ToolExecution {
                        tool: self.name.to_string(),
                        message: "HTTP 503".into(),
                    })
                } else {
                    Ok(json!({ "echo": args }))
                }
            })
        }
    }

    fn invoker(
        fail_first: u32,
        threshold: u32,
        fallback: FallbackKind,
    ) -> (ResilientToolInvoker, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(FlakyTool {
            name: "route_calculator",
            fail_first,
            calls: calls.clone(),
        });
        let mut fallbacks = FallbackDispatcher::new(Arc::new(MemoryKv::new()), Duration::from_secs(600));
        fallbacks.set_kind("route_calculator", fallback);
        let breakers = CircuitBreakerRegistry::new(&BreakerConfig {
            failure_threshold: threshold,
            window_secs: 60,
            cooldown_secs: 30,
        });
        let retry = ToolRetryConfig {
            max_retries: 2,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            jitter: false,
        };
        (
            ResilientToolInvoker::new(
                Arc::new(registry),
                Arc::new(breakers),
                Arc::new(fallbacks),
                retry,
            ),
            calls,
        )
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let cfg = ToolRetryConfig {
            max_retries: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 3000,
            jitter: false,
        };
        assert_eq!(calculate_backoff(0, &cfg), Duration::from_millis(500));
        assert_eq!(calculate_backoff(2, &cfg), Duration::from_millis(2000));
        assert_eq!(calculate_backoff(4, &cfg), Duration::from_millis(3000));

        let jittered = ToolRetryConfig { jitter: true, ..cfg };
        let d = calculate_backoff(0, &jittered).as_millis();
        assert!((400..=600).contains(&d));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers_after_retry() {
        let (inv, calls) = invoker(2, 10, FallbackKind::None);
        let out = inv
            .invoke("route_calculator", json!({"a": 1}), ToolCallContext::default())
            .await
            .unwrap();
        assert!(!out.is_degraded());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_without_fallback_is_error() {
        let (inv, calls) = invoker(100, 10, FallbackKind::None);
        let err = inv
            .invoke("route_calculator", json!({}), ToolCallContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::ToolExecution { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_serves_cached_result() {
        let (inv, calls) = invoker(0, 1, FallbackKind::CachedOnly);
        let args = json!({ "origin": "NLRTM", "destination": "SGSIN" });
        inv.invoke("route_calculator", args.clone(), ToolCallContext::default())
            .await
            .unwrap();

        // Force the breaker open.
        inv.breakers().try_acquire("route_calculator").unwrap().failure();

        let out = inv
            .invoke("route_calculator", args, ToolCallContext::default())
            .await
            .unwrap();
        match out {
            ToolOutcome::Degraded(d) => assert_eq!(d.source, DegradationSource::Cached),
            other => panic!("expected degraded outcome, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_without_fallback_is_unavailable() {
        let (inv, _) = invoker(100, 1, FallbackKind::GreatCircle);
        let args = json!({ "origin": "NLRTM", "destination": "SGSIN" });
        let _ = inv
            .invoke("route_calculator", args.clone(), ToolCallContext::default())
            .await;
        let err = inv
            .invoke("route_calculator", args, ToolCallContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::ToolUnavailable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_call_returns_cancelled() {
        let (inv, _) = invoker(100, 10, FallbackKind::InsufficientData);
        let ctx = ToolCallContext::default();
        ctx.cancel.cancel();
        let err = inv
            .invoke("route_calculator", json!({}), ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::Cancelled));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let (inv, _) = invoker(0, 10, FallbackKind::InsufficientData);
        let err = inv
            .invoke("nope", json!({}), ToolCallContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::UnknownTool(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_published() {
        let (inv, _) = invoker(0, 10, FallbackKind::None);
        let bus = Arc::new(EventBus::default());
        let inv = inv.with_event_bus(bus.clone());
        let mut rx = bus.subscribe();
        let ctx = ToolCallContext {
            correlation_id: "corr-7".into(),
            ..Default::default()
        };
        inv.invoke("route_calculator", json!({}), ctx).await.unwrap();
        match rx.recv().await.unwrap() {
            KeelEvent::ToolCall {
                correlation_id,
                succeeded,
                ..
            } => {
                assert_eq!(correlation_id, "corr-7");
                assert!(succeeded);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
