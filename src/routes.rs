use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
};

use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Build the axum Router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", axum::routing::get(ws_handler::ws_upgrade))
        .route(
            "/api/users/{user_id}/push",
            axum::routing::post(push_to_user),
        )
        .route("/health", axum::routing::get(health_check))
        .with_state(state)
}

/// POST /api/users/{user_id}/push
/// Out-of-band injection point for the HTTP layer: deliver a
/// server-originated JSON payload to a specific connected user.
/// 404 when the user has no live connection — delivery is best-effort,
/// the caller decides whether that matters.
async fn push_to_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> StatusCode {
    let frame = match serde_json::to_string(&payload) {
        Ok(text) => axum::extract::ws::Message::Text(text.into()),
        Err(_) => return StatusCode::BAD_REQUEST,
    };

    if state.connections.push_to_user(&user_id, frame) {
        StatusCode::OK
    } else {
        tracing::debug!(user_id = %user_id, "Push skipped: user not connected");
        StatusCode::NOT_FOUND
    }
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
