use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use shared_types::{HealthResponse, MessageEnvelope, SendRequest, SendResponse};
use tracing::{error, info, warn};

use crate::{delivery::DeliveryError, supervisor::DiagnosticsSource, AppState};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/message", post(receive_message))
        .route("/send", post(push_message))
        .route("/admin/core/start", post(start_core))
        .route("/admin/core/stop", post(stop_core))
        .route("/admin/remediate", post(remediate))
}

/// GET /health: daemon liveness
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse::ok("daemon"))
}

/// GET /status: supervisor snapshot plus delivery state
pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let core_healthy = state.pipeline.is_healthy().await;
    Json(serde_json::json!({
        "core": state.supervisor.status(),
        "coreHealthy": core_healthy,
        "queueDepth": state.pipeline.queue_depth(),
        "policy": state.pipeline.policy(),
    }))
}

/// POST /message: inbound chat message from the channel adapter
pub async fn receive_message(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<MessageEnvelope>,
) -> impl IntoResponse {
    let message_id = envelope.message.id.clone();
    match state.pipeline.send(envelope.message, None).await {
        Ok(delivery) => {
            info!(
                message_id = %message_id,
                state = %delivery.state,
                attempts = delivery.attempts,
                "message answered"
            );
            Json(delivery.reply).into_response()
        }
        Err(e @ DeliveryError::QueueExpired { .. }) => {
            warn!(message_id = %message_id, "delivery expired: {e}");
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
        Err(e @ DeliveryError::ShuttingDown) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// POST /send: the core pushes a message to a conversation
pub async fn push_message(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SendRequest>,
) -> impl IntoResponse {
    match state.channel.send(&request).await {
        Ok(()) => Json(SendResponse { ok: true }).into_response(),
        Err(e) => {
            error!(chat_id = %request.chat_id, "push to channel: {e}");
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

/// POST /admin/core/start
pub async fn start_core(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.supervisor.resume();
    Json(state.supervisor.status())
}

/// POST /admin/core/stop
pub async fn stop_core(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.supervisor.stop();
    Json(state.supervisor.status())
}

/// POST /admin/remediate: run remediation against the last captured error
pub async fn remediate(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let Some(diagnostic) = state.supervisor.last_error() else {
        return (StatusCode::CONFLICT, "no core error captured").into_response();
    };
    let success = state.remediation.trigger(&diagnostic).await;
    Json(serde_json::json!({
        "success": success,
        "attemptsInWindow": state.remediation.attempts_in_window(),
    }))
    .into_response()
}
