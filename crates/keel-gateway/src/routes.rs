use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use crate::health::health_snapshot;
use crate::state::AppState;

// GET /api/health
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = health_snapshot(&state.breakers, state.store.as_ref()).await;
    let code = if snapshot.checkpoint_store.reachable {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(snapshot))
}

// GET /api/breakers
pub async fn breakers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({ "breakers": state.breakers.snapshot() }))
}
