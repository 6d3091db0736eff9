//! HTTP surface: event ingestion, proofs, verification and operator actions.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::event::AuditEvent;
use crate::error::AnchorError;
use crate::service::AnchorPipeline;

pub fn router(pipeline: Arc<AnchorPipeline>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status_endpoint))
        .route("/events", post(ingest_event))
        .route("/events/:id/proof", get(event_proof))
        .route("/events/:id/verify", get(verify_event))
        .route("/anchors/failed", get(failed_anchors))
        .route("/anchors/:batch_id/retry", post(retry_anchor))
        .route("/anchors/:batch_id/cancel", post(cancel_anchor))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .into_inner(),
        )
        .with_state(pipeline)
}

/// Error body: `{"error": <code>, "message": <text>}`
pub struct ApiError(AnchorError);

impl From<AnchorError> for ApiError {
    fn from(err: AnchorError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            AnchorError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AnchorError::DuplicateEvent { .. } => (StatusCode::CONFLICT, "duplicate_event"),
            AnchorError::AccumulatorClosed { .. } => (StatusCode::CONFLICT, "accumulator_closed"),
            AnchorError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
            AnchorError::CancellationRefused { .. } => (StatusCode::CONFLICT, "cancellation_refused"),
            AnchorError::RootImmutable(_) => (StatusCode::CONFLICT, "root_immutable"),
            AnchorError::ValidationError(_) | AnchorError::EmptyBatch => {
                (StatusCode::UNPROCESSABLE_ENTITY, "validation_error")
            }
            AnchorError::VerificationMismatch { .. } | AnchorError::EventMismatch { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "verification_mismatch")
            }
            AnchorError::SubmissionTimeout(_) | AnchorError::LedgerUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "ledger_unavailable")
            }
            AnchorError::SubmissionRejected(_) => (StatusCode::BAD_GATEWAY, "submission_rejected"),
            AnchorError::ConfigError(_) | AnchorError::DatabaseError(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            warn!("Request rejected: {}", self.0);
        }
        (status, Json(json!({ "error": code, "message": self.0.to_string() }))).into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "audit-anchor",
        "timestamp": chrono::Utc::now()
    }))
}

async fn status_endpoint(State(pipeline): State<Arc<AnchorPipeline>>) -> ApiResult {
    let status = pipeline.status().await?;
    Ok(Json(json!({
        "status": "healthy",
        "service": "audit-anchor",
        "timestamp": chrono::Utc::now(),
        "pipeline": status
    })))
}

async fn ingest_event(
    State(pipeline): State<Arc<AnchorPipeline>>,
    Json(event): Json<AuditEvent>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let outcome = pipeline.ingest(&event).await?;
    info!("Accepted {}", event.summary());
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "event_id": event.id,
            "event_hash": event.event_hash(),
            "batch_id": outcome.batch_id,
            "sequence_number": outcome.sequence_number,
            "position": outcome.position,
            "batch_closed": outcome.closed
        })),
    ))
}

async fn event_proof(State(pipeline): State<Arc<AnchorPipeline>>, Path(id): Path<Uuid>) -> ApiResult {
    let proof = pipeline.query().get_proof(id).await?;
    Ok(Json(serde_json::to_value(proof).map_err(AnchorError::from)?))
}

async fn verify_event(State(pipeline): State<Arc<AnchorPipeline>>, Path(id): Path<Uuid>) -> ApiResult {
    let verified = pipeline.query().verify(id).await?;
    Ok(Json(json!({
        "event_id": id,
        "verified": verified,
        "anchored": verified
    })))
}

async fn failed_anchors(State(pipeline): State<Arc<AnchorPipeline>>) -> ApiResult {
    let records = pipeline.query().failed_anchors().await?;
    Ok(Json(json!({
        "count": records.len(),
        "records": records
    })))
}

async fn retry_anchor(
    State(pipeline): State<Arc<AnchorPipeline>>,
    Path(batch_id): Path<Uuid>,
) -> ApiResult {
    let record = pipeline.retry_failed(batch_id).await?;
    Ok(Json(serde_json::to_value(record).map_err(AnchorError::from)?))
}

async fn cancel_anchor(
    State(pipeline): State<Arc<AnchorPipeline>>,
    Path(batch_id): Path<Uuid>,
) -> ApiResult {
    let record = pipeline.cancel(batch_id).await?;
    Ok(Json(serde_json::to_value(record).map_err(AnchorError::from)?))
}
