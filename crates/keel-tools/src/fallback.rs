//! Degraded responses for tools that are refused or out of retries.
//!
//! Each tool has a [`FallbackKind`]. Every kind except `none` first looks for
//! a cached successful result for the same arguments.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use keel_core::catalog::{Catalog, FallbackKind};
use keel_core::error::KeelError;
use keel_core::traits::KvStore;
use keel_core::types::{DegradationSource, DegradedResult};

pub const TOOL_CACHE_PREFIX: &str = "tool_cache";

const EARTH_RADIUS_NM: f64 = 3440.065;

/// Cache key for a tool result. Object keys serialize in sorted order, so
/// equivalent argument objects share a key.
pub fn cache_key(tool: &str, args: &serde_json::Value) -> String {
    let digest = Sha256::digest(args.to_string().as_bytes());
    let hash = format!("{:x}", digest);
    format!("{}:{}:{}", TOOL_CACHE_PREFIX, tool, &hash[..16])
}

/// Great-circle distance in nautical miles.
pub fn great_circle_nm(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_NM * a.sqrt().asin()
}

fn coordinates(args: &serde_json::Value, field: &str) -> Option<(f64, f64)> {
    let point = args.get(field)?;
    let lat = point.get("lat")?.as_f64()?;
    let lon = point.get("lon")?.as_f64()?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return None;
    }
    Some((lat, lon))
}

pub struct FallbackDispatcher {
    store: Arc<dyn KvStore>,
    kinds: HashMap<String, FallbackKind>,
    cache_ttl: Duration,
}

impl FallbackDispatcher {
    pub fn new(store: Arc<dyn KvStore>, cache_ttl: Duration) -> Self {
        Self {
            store,
            kinds: HashMap::new(),
            cache_ttl,
        }
    }

    /// Use each catalog tool's configured fallback kind.
    pub fn from_catalog(store: Arc<dyn KvStore>, catalog: &Catalog, cache_ttl: Duration) -> Self {
        let mut dispatcher = Self::new(store, cache_ttl);
        for tool in catalog.enabled_tools() {
            dispatcher.kinds.insert(tool.id.clone(), tool.fallback);
        }
        dispatcher
    }

    pub fn set_kind(&mut self, tool: impl Into<String>, kind: FallbackKind) {
        self.kinds.insert(tool.into(), kind);
    }

    pub fn kind(&self, tool: &str) -> FallbackKind {
        self.kinds.get(tool).copied().unwrap_or_default()
    }

    /// Remember a successful result for later degraded reuse. Best effort.
    pub async fn remember(&self, tool: &str, args: &serde_json::Value, result: &serde_json::Value) {
        if self.kind(tool) == FallbackKind::None {
            return;
        }
        let key = cache_key(tool, args);
        if let Err(e) = self
            .store
            .set(&key, result.to_string(), Some(self.cache_ttl))
            .await
        {
            warn!(tool, error = %e, "Failed to cache tool result");
        }
    }

    async fn cached(&self, tool: &str, args: &serde_json::Value) -> Option<serde_json::Value> {
        let key = cache_key(tool, args);
        match self.store.get(&key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(tool, error = %e, "Tool cache lookup failed");
                None
            }
        }
    }

    /// Degraded substitute for a failed call, or `None` if the tool has no
    /// usable fallback for these arguments.
    pub async fn get_fallback_response(
        &self,
        tool: &str,
        error: &KeelError,
        args: &serde_json::Value,
    ) -> Option<DegradedResult> {
        let kind = self.kind(tool);
        if kind == FallbackKind::None {
            return None;
        }

        if let Some(value) = self.cached(tool, args).await {
            info!(tool, "Serving cached result as fallback");
            return Some(DegradedResult::new(
                value,
                format!("{} unavailable ({}); showing a previously cached result", tool, error),
                DegradationSource::Cached,
            ));
        }

        match kind {
            FallbackKind::GreatCircle => {
                let (Some(origin), Some(destination)) =
                    (coordinates(args, "origin"), coordinates(args, "destination"))
                else {
                    debug!(tool, "No cached route and no coordinates for an estimate");
                    return None;
                };
                let distance = great_circle_nm(origin.0, origin.1, destination.0, destination.1);
                let mut value = json!({
                    "distance_nm": (distance * 10.0).round() / 10.0,
                    "method": "great_circle",
                    "waypoints": [
                        { "lat": origin.0, "lon": origin.1 },
                        { "lat": destination.0, "lon": destination.1 },
                    ],
                });
                if let Some(speed) = args.get("speed_knots").and_then(|s| s.as_f64()) {
                    if speed > 0.0 {
                        value["estimated_hours"] = json!((distance / speed * 10.0).round() / 10.0);
                    }
                }
                Some(DegradedResult::new(
                    value,
                    format!(
                        "{} unavailable ({}); straight-line distance shown, actual sailing distance will be longer",
                        tool, error
                    ),
                    DegradationSource::Approximated,
                ))
            }
            FallbackKind::InsufficientData => Some(DegradedResult::new(
                json!({ "status": "insufficient_data", "tool": tool }),
                format!("{} unavailable ({}); no data to substitute", tool, error),
                DegradationSource::InsufficientData,
            )),
            FallbackKind::CachedOnly | FallbackKind::None => None,
        }
    }
}
