//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::Serialize;

use crate::bridge::protocol::FailureKind;
use crate::error::{JobError, SliceError};
use crate::health::Health;
use crate::router::RouterMetricsSnapshot;
use crate::service::{HealthSnapshot, SliceRequest, SliceService};
use crate::version::VersionInfo;

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: Health,
    pub version: VersionInfo,
    pub sessions_in_flight: usize,
    pub router: RouterMetricsSnapshot,
}

impl From<HealthSnapshot> for HealthCheckResponse {
    fn from(snapshot: HealthSnapshot) -> Self {
        Self {
            status: snapshot.state,
            version: snapshot.version,
            sessions_in_flight: snapshot.sessions_in_flight,
            router: snapshot.router,
        }
    }
}

async fn health_check(State(service): State<Arc<SliceService>>) -> Json<HealthCheckResponse> {
    Json(service.health().await.into())
}

fn status_for(err: &SliceError) -> StatusCode {
    match err {
        SliceError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
        SliceError::Job(job) => match job {
            JobError::DispatchFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            JobError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            JobError::WorkerFailure { kind, .. } => match kind {
                FailureKind::BadRequest => StatusCode::BAD_REQUEST,
                FailureKind::NotFound => StatusCode::NOT_FOUND,
                FailureKind::Unauthorized => StatusCode::UNAUTHORIZED,
                FailureKind::Internal => StatusCode::BAD_GATEWAY,
            },
            JobError::DuplicateSession(_) | JobError::Incomplete { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        },
        SliceError::Encode(_) | SliceError::Decode { .. } | SliceError::ShapeMismatch { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(err: &SliceError) -> Response {
    let status = status_for(err);
    let mut body = serde_json::json!({ "error": err.to_string() });
    if let SliceError::Job(job) = err {
        body["correlation_id"] = serde_json::json!(job.correlation_id());
    }
    if status.is_server_error() {
        tracing::error!(%status, error = %err, "Slice request failed");
    } else {
        tracing::info!(%status, error = %err, "Slice request rejected");
    }
    (status, Json(body)).into_response()
}

async fn slice(
    State(service): State<Arc<SliceService>>,
    Path((guid, dim, lineno)): Path<(String, u32, u32)>,
    headers: HeaderMap,
) -> Response {
    let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
    else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "missing Authorization header" })),
        )
            .into_response();
    };

    let request = SliceRequest {
        guid,
        dim,
        lineno,
        token: token.to_string(),
    };
    match service.fetch_slice(request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn shutdown(State(service): State<Arc<SliceService>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    service.trigger_shutdown().await;
    (StatusCode::OK, Json(serde_json::json!({})))
}

pub fn routes(service: Arc<SliceService>) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/shutdown", post(shutdown))
        .route("/{guid}/slice/{dim}/{lineno}", get(slice))
        .with_state(service)
}
