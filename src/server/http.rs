//! HTTP surface of the sync server.

use crate::api::{LocationUpdate, SyncBatch, SyncBatchResponse};
use crate::model::{AssignmentOutcome, InventoryItem};
use crate::server::locations::{self, LocationWrite};
use crate::server::schedule;
use crate::server::ServerState;
use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

pub fn router(state: ServerState) -> Router {
    let v1 = Router::new()
        .route("/v1/sync/batch", post(sync_batch))
        .route("/v1/practitioners/:id/location", put(put_location))
        .route("/v1/appointments/:id/assign", post(assign))
        .route("/v1/inventory/low-stock", get(low_stock))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(health))
        .merge(v1)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Infrastructure failure; logged and answered with a 500.
pub struct AppError(anyhow::Error);

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!(err = ?self.0, "request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "internal error" })),
        )
            .into_response()
    }
}

fn error_body(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn require_token(State(state): State<ServerState>, req: Request, next: Next) -> Response {
    if let Some(expected) = state.api_token.as_deref() {
        let presented = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(expected) {
            return error_body(StatusCode::UNAUTHORIZED, "missing or invalid bearer token");
        }
    }
    next.run(req).await
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn sync_batch(
    State(state): State<ServerState>,
    Json(batch): Json<SyncBatch>,
) -> Result<Json<SyncBatchResponse>, AppError> {
    Ok(Json(state.ingest.apply_batch(&batch).await?))
}

async fn put_location(
    State(state): State<ServerState>,
    Path(id): Path<Uuid>,
    Json(update): Json<LocationUpdate>,
) -> Result<Response, AppError> {
    Ok(match locations::upsert_location(&state.pool, id, &update).await? {
        LocationWrite::Stored | LocationWrite::Stale => StatusCode::NO_CONTENT.into_response(),
        LocationWrite::UnknownPractitioner => error_body(StatusCode::NOT_FOUND, "unknown practitioner"),
        LocationWrite::InvalidCoordinates => {
            error_body(StatusCode::UNPROCESSABLE_ENTITY, "coordinates out of range")
        }
    })
}

async fn assign(State(state): State<ServerState>, Path(id): Path<Uuid>) -> Result<Response, AppError> {
    if schedule::get_appointment(&state.pool, id).await?.is_none() {
        return Ok(error_body(StatusCode::NOT_FOUND, "unknown appointment"));
    }
    let outcome: AssignmentOutcome = state.resolver.assign(id).await?;
    info!(appointment_id = %id, ?outcome, "assignment requested");
    Ok(Json(outcome).into_response())
}

async fn low_stock(State(state): State<ServerState>) -> Result<Json<Vec<InventoryItem>>, AppError> {
    Ok(Json(state.inventory.low_stock().await?))
}
