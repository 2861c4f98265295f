//! Worker HTTP surface: `POST /runsync` runs one job synchronously and
//! `GET /health` reports liveness.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::HandlerError;
use crate::handler::Handler;
use crate::response::{ErrorEnvelope, ResponseEnvelope};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    handler: Handler,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(handler: Handler, shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(AppStateInner { handler, shutdown }),
        }
    }
}

/// Serverless job envelope: `{ "id": "...", "input": { ... } }`.
#[derive(Debug, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub input: Value,
}

/// `max_body_bytes` caps `/runsync` bodies; base64 media makes them large.
pub fn build_router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route(
            "/runsync",
            post(runsync).layer(DefaultBodyLimit::max(max_body_bytes)),
        )
        .route("/health", get(health))
        .with_state(state)
}

pub fn status_for(error: &HandlerError) -> StatusCode {
    match error {
        HandlerError::Validation { .. } => StatusCode::BAD_REQUEST,
        HandlerError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        HandlerError::Codec { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        HandlerError::BackendUnreachable(_) | HandlerError::JobFailed(_) => StatusCode::BAD_GATEWAY,
        HandlerError::JobTimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
        HandlerError::JobCancelled(_) | HandlerError::StartupNotReady { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        HandlerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ErrorEnvelope {
    fn into_response(self) -> Response {
        (status_for(self.cause()), Json(self)).into_response()
    }
}

impl IntoResponse for ResponseEnvelope {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

async fn runsync(
    State(state): State<AppState>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            let err = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                HandlerError::PayloadTooLarge(rejection.body_text())
            } else {
                HandlerError::validation("body", rejection.body_text())
            };
            warn!(kind = err.kind(), error = %err, "Rejected /runsync body");
            return ErrorEnvelope::new(err, None, std::time::Instant::now()).into_response();
        }
    };

    let cancel = state.inner.shutdown.child_token();
    state
        .inner
        .handler
        .handle(&request.input, request.id.as_deref(), &cancel)
        .await
        .into_response()
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_to_http_statuses() {
        let cases = [
            (HandlerError::validation("prompt", "is required"), 400),
            (HandlerError::PayloadTooLarge("length limit exceeded".into()), 413),
            (HandlerError::codec("image", "malformed base64"), 422),
            (HandlerError::BackendUnreachable("refused".into()), 502),
            (HandlerError::JobFailed("oom".into()), 502),
            (HandlerError::JobTimedOut { timeout_secs: 1 }, 504),
            (HandlerError::JobCancelled("shutdown".into()), 503),
            (HandlerError::Internal("bug".into()), 500),
        ];
        for (error, status) in cases {
            assert_eq!(status_for(&error).as_u16(), status, "{}", error.kind());
        }
    }

    #[test]
    fn run_request_tolerates_missing_fields() {
        let parsed: RunRequest = serde_json::from_value(json!({})).expect("parse");
        assert!(parsed.id.is_none());
        assert!(parsed.input.is_null());
    }
}
