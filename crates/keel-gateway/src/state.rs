use std::sync::Arc;

use keel_core::config::GatewayConfig;
use keel_core::traits::KvStore;
use keel_tools::CircuitBreakerRegistry;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub store: Arc<dyn KvStore>,
}
