// =============================================================================
// Internal Admin API — Axum 0.7
// =============================================================================
//
// The in-process surface the surrounding platform layers call: bot
// start/stop, order cancellation, kill-switch control, and snapshot reads.
// Authentication, user CRUD, and end-user WebSocket feeds live in the outer
// platform, not here.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

use crate::engine::EngineState;

// =============================================================================
// Router construction
// =============================================================================

/// Build the admin router with CORS middleware and shared engine state.
pub fn router(engine: Arc<EngineState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/bots", get(list_bots))
        .route("/api/v1/bots/:id/start", post(start_bot))
        .route("/api/v1/bots/:id/stop", post(stop_bot))
        .route("/api/v1/bots/:id/orders", get(bot_orders))
        .route("/api/v1/bots/:id/positions", get(bot_positions))
        .route("/api/v1/orders/:id/cancel", post(cancel_order))
        .route("/api/v1/risk/:user_id/kill", post(trigger_kill))
        .route("/api/v1/risk/:user_id/kill/reset", post(reset_kill))
        .layer(cors)
        .with_state(engine)
}

// =============================================================================
// Handlers
// =============================================================================

async fn health(State(engine): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "state_version": engine.current_version(),
        "uptime_secs": engine.start_time.elapsed().as_secs(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

async fn full_state(State(engine): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(engine.build_snapshot())
}

async fn list_bots(State(engine): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(engine.bots.all())
}

async fn start_bot(
    State(engine): State<Arc<EngineState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match engine.start_bot(&id).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "started": id }))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

async fn stop_bot(
    State(engine): State<Arc<EngineState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match engine.stop_bot(&id).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "stopped": id }))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

async fn bot_orders(
    State(engine): State<Arc<EngineState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    Json(engine.orders.orders_for_bot(&id))
}

async fn bot_positions(
    State(engine): State<Arc<EngineState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    Json(engine.positions.open_for_bot(&id))
}

async fn cancel_order(
    State(engine): State<Arc<EngineState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match engine.cancel_order(&id).await {
        Ok(order) => (StatusCode::OK, Json(serde_json::json!({ "order": order }))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct KillRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn trigger_kill(
    State(engine): State<Arc<EngineState>>,
    Path(user_id): Path<Uuid>,
    Json(body): Json<KillRequest>,
) -> impl IntoResponse {
    let reason = body.reason.unwrap_or_else(|| "manual".to_string());
    info!(user_id = %user_id, reason = %reason, "manual kill switch requested");
    engine.trigger_kill_switch(user_id, &reason).await;
    (StatusCode::OK, Json(serde_json::json!({ "killed": user_id })))
}

#[derive(Debug, Deserialize)]
struct KillResetRequest {
    confirmation_code: String,
}

async fn reset_kill(
    State(engine): State<Arc<EngineState>>,
    Path(user_id): Path<Uuid>,
    Json(body): Json<KillResetRequest>,
) -> impl IntoResponse {
    match engine.reset_kill_switch(user_id, &body.confirmation_code) {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "reset": user_id }))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}
