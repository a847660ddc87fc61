//! Axum HTTP server: KOOK webhook at POST /api/im/kook/event, channel session snapshot at
//! GET /api/sessions, liveness at GET /health.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::trace::TraceLayer;

use yui_core::im::kook::{self, KookWebhookState};
use yui_core::im::{ChannelSession, SessionTable};

/// Shared app state: the session table (read-only here) and the KOOK webhook state.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionTable>,
    pub kook: KookWebhookState,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/im/kook/event", post(kook_webhook_handler))
        .route("/api/sessions", get(list_sessions_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// POST /api/im/kook/event: KOOK sends WEBHOOK_CHALLENGE (return {"challenge":"..."}) or message events.
async fn kook_webhook_handler(State(state): State<AppState>, body: String) -> Response {
    let (status_code, body_str) = kook::handle_webhook_body(&body, &state.kook).await;
    let status = StatusCode::from_u16(status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [("Content-Type", "application/json; charset=utf-8")],
        body_str,
    )
        .into_response()
}

async fn list_sessions_handler(State(state): State<AppState>) -> Json<Vec<ChannelSession>> {
    Json(state.sessions.snapshot())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
