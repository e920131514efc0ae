use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::warn;

use keel_core::error::Result;
use keel_core::traits::KvStore;
use keel_memory::LAST_WRITE_KEY;
use keel_tools::{BreakerSnapshot, BreakerState, CircuitBreakerRegistry};

const PROBE_KEY: &str = "meta:health_probe";

/// Checkpoint store reachability and freshness.
#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    pub last_write: Option<DateTime<Utc>>,
    pub last_write_age_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// "ok", or "degraded" when a breaker is open or the store is unreachable.
    pub status: &'static str,
    pub version: &'static str,
    pub breakers: Vec<BreakerSnapshot>,
    pub checkpoint_store: StoreHealth,
}

impl HealthSnapshot {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Probe the store with a write and a read, then read the last checkpoint
/// write time.
pub async fn health_snapshot(breakers: &CircuitBreakerRegistry, store: &dyn KvStore) -> HealthSnapshot {
    let checkpoint_store = probe_store(store).await;
    let breakers = breakers.snapshot();
    let any_open = breakers.iter().any(|b| b.state == BreakerState::Open);
    let status = if checkpoint_store.reachable && !any_open {
        "ok"
    } else {
        "degraded"
    };
    HealthSnapshot {
        status,
        version: env!("CARGO_PKG_VERSION"),
        breakers,
        checkpoint_store,
    }
}

async fn round_trip(store: &dyn KvStore) -> Result<()> {
    store
        .set(PROBE_KEY, Utc::now().to_rfc3339(), Some(Duration::from_secs(60)))
        .await?;
    store.get(PROBE_KEY).await?;
    Ok(())
}

async fn probe_store(store: &dyn KvStore) -> StoreHealth {
    let start = Instant::now();
    if let Err(e) = round_trip(store).await {
        warn!(error = %e, "Checkpoint store probe failed");
        return StoreHealth {
            reachable: false,
            latency_ms: None,
            last_write: None,
            last_write_age_secs: None,
            error: Some(e.to_string()),
        };
    }
    let latency_ms = start.elapsed().as_millis() as u64;

    let last_write = match store.get(LAST_WRITE_KEY).await {
        Ok(Some(raw)) => DateTime::parse_from_rfc3339(&raw)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        _ => None,
    };

    StoreHealth {
        reachable: true,
        latency_ms: Some(latency_ms),
        last_write,
        last_write_age_secs: last_write.map(|t| (Utc::now() - t).num_seconds()),
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use keel_core::config::BreakerConfig;
    use keel_core::error::KeelError;
    use keel_memory::MemoryKv;

    struct FailingKv;

    fn refused<'a, T: Send + 'a>() -> BoxFuture<'a, Result<T>> {
        Box::pin(async { Err(KeelError::Store("connection refused".into())) })
    }

    impl KvStore for FailingKv {
        fn get(&self, _key: &str) -> BoxFuture<'_, Result<Option<String>>> {
            refused()
        }
        fn set(&self, _key: &str, _value: String, _ttl: Option<Duration>) -> BoxFuture<'_, Result<()>> {
            refused()
        }
        fn del(&self, _key: &str) -> BoxFuture<'_, Result<bool>> {
            refused()
        }
        fn keys(&self, _pattern: &str) -> BoxFuture<'_, Result<Vec<String>>> {
            refused()
        }
    }

    fn breakers() -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(&BreakerConfig {
            failure_threshold: 1,
            window_secs: 60,
            cooldown_secs: 30,
        })
    }

    #[tokio::test]
    async fn test_healthy_store() {
        let store = MemoryKv::new();
        store
            .set(LAST_WRITE_KEY, Utc::now().to_rfc3339(), None)
            .await
            .unwrap();
        let snap = health_snapshot(&breakers(), &store).await;
        assert!(snap.is_ok());
        assert!(snap.checkpoint_store.reachable);
        assert!(snap.checkpoint_store.last_write.is_some());
        assert!(snap.checkpoint_store.last_write_age_secs.unwrap() <= 1);
    }

    #[tokio::test]
    async fn test_open_breaker_degrades() {
        let reg = breakers();
        reg.try_acquire("route_calculator").unwrap().failure();
        let snap = health_snapshot(&reg, &MemoryKv::new()).await;
        assert_eq!(snap.status, "degraded");
        assert_eq!(snap.breakers[0].state, BreakerState::Open);
        assert!(snap.checkpoint_store.last_write.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_store() {
        let snap = health_snapshot(&breakers(), &FailingKv).await;
        assert!(!snap.is_ok());
        assert!(!snap.checkpoint_store.reachable);
        assert!(snap.checkpoint_store.error.unwrap().contains("connection refused"));
    }
}
