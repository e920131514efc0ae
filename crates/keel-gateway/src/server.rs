use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use keel_core::config::GatewayConfig;
use keel_core::traits::KvStore;
use keel_tools::CircuitBreakerRegistry;

use crate::routes;
use crate::state::AppState;

/// Read-only HTTP surface for external monitoring.
pub struct GatewayServer {
    config: GatewayConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    store: Arc<dyn KvStore>,
}

impl GatewayServer {
    pub fn new(
        config: GatewayConfig,
        breakers: Arc<CircuitBreakerRegistry>,
        store: Arc<dyn KvStore>,
    ) -> Self {
        Self {
            config,
            breakers,
            store,
        }
    }

    fn router(&self) -> Router {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            breakers: self.breakers.clone(),
            store: self.store.clone(),
        });

        Router::new()
            .route("/api/health", get(routes::health))
            .route("/api/breakers", get(routes::breakers))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Run the server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = self.router();

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Health endpoint listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Health endpoint shut down");
        Ok(())
    }
}
