//! HTTP API for the shelfcast node.
//!
//! Health, producer ingest, and the shared state and error types used by
//! every handler. The real-time endpoints live in [`crate::realtime_api`].

use axum::{
    extract::{FromRequestParts, Query, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use shelfcast_realtime::{
    BridgeStatus, DatagramRegistry, RealtimeError, RoomHub, SseHub, StreamRegistry,
};
use shelfcast_types::{Identity, NotificationEvent, ProgressEvent};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::auth::TokenVerifier;
use crate::observability::request_id_middleware;
use crate::realtime_api::realtime_routes;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Stream registry (progress events).
    pub stream: StreamRegistry,
    /// Datagram registry (notifications).
    pub datagram: DatagramRegistry,
    /// Chat rooms.
    pub rooms: RoomHub,
    /// Browser event streams.
    pub sse: SseHub,
    /// Upstream states of the bridge.
    pub bridge: BridgeStatus,
    /// Token verification.
    pub verifier: Arc<TokenVerifier>,
    /// Write deadline for chat sockets outside any room.
    pub chat_write_deadline: Duration,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl From<RealtimeError> for ApiError {
    fn from(err: RealtimeError) -> Self {
        match err {
            RealtimeError::AuthFailure(reason) => ApiError::Unauthorized(reason),
            RealtimeError::MalformedMessage(reason) => ApiError::BadRequest(reason),
            other => ApiError::Unavailable(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Verified caller identity.
///
/// Read from `Authorization: Bearer …`, or from the `token` query parameter
/// for transports that cannot set headers (EventSource, browser WebSocket).
#[derive(Debug, Clone)]
pub struct Authenticated(pub Identity);

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let header_token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.trim().to_string());

        let token = match header_token {
            Some(token) => token,
            None => Query::<TokenQuery>::try_from_uri(&parts.uri)
                .ok()
                .and_then(|q| q.0.token)
                .ok_or_else(|| ApiError::Unauthorized("missing token".into()))?,
        };

        let identity = state.verifier.verify(&token)?;
        Ok(Authenticated(identity))
    }
}

/// Creates the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/broadcast/progress", post(broadcast_progress))
        .route("/api/broadcast/notification", post(broadcast_notification))
        .merge(realtime_routes())
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Progress ingest body. User fields default to the caller.
#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    pub item_id: String,
    pub value: f64,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl ProgressRequest {
    fn into_event(self, caller: Identity) -> Result<ProgressEvent, RealtimeError> {
        if self.item_id.trim().is_empty() {
            return Err(RealtimeError::MalformedMessage(
                "item_id must not be empty".into(),
            ));
        }
        if !self.value.is_finite() {
            return Err(RealtimeError::MalformedMessage(
                "value must be a finite number".into(),
            ));
        }
        Ok(ProgressEvent::new(
            self.user_id.unwrap_or(caller.user_id),
            self.username.unwrap_or(caller.username),
            self.item_id,
            self.value,
        ))
    }
}

async fn broadcast_progress(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Json(req): Json<ProgressRequest>,
) -> Result<StatusCode, ApiError> {
    let event = req.into_event(caller)?;
    debug!(item_id = %event.item_id, user_id = %event.user_id, "Progress ingested");
    state.stream.broadcast(event).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Notification ingest body.
#[derive(Debug, Deserialize)]
pub struct NotificationRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub subject_id: String,
    pub message: String,
}

async fn broadcast_notification(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Json(req): Json<NotificationRequest>,
) -> Result<StatusCode, ApiError> {
    if req.kind.trim().is_empty() {
        return Err(RealtimeError::MalformedMessage("type must not be empty".into()).into());
    }

    let event = NotificationEvent::new(req.kind, req.subject_id, req.message);
    debug!(kind = %event.kind, subject_id = %event.subject_id, producer = %caller, "Notification ingested");
    state.datagram.broadcast(event).await?;
    Ok(StatusCode::ACCEPTED)
}
