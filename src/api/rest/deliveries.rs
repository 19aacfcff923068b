use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::ingest::{IngestOutcome, RejectReason, ingest};
use crate::engine::lifecycle;
use crate::error::AppError;
use crate::models::fix::{GeoPoint, PositionFix};
use crate::models::session::{
    ArchivedSession, DeliveryMetadata, DeliveryStatus, DeliveryTrackingSession, EndReason,
    SessionView,
};
use crate::models::update::TrackingUpdate;
use crate::state::AppState;

use super::ws;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/deliveries", post(start_session).get(list_sessions))
        .route("/deliveries/:id", get(get_session))
        .route("/deliveries/:id/status", patch(update_status))
        .route("/deliveries/:id/end", post(end_session))
        .route("/deliveries/:id/fixes", post(ingest_fix))
        .route("/deliveries/:id/ws", get(ws::tracking_ws_handler))
}

#[derive(Deserialize)]
pub struct StartSessionRequest {
    pub delivery_id: String,
    pub destination: GeoPoint,
    #[serde(default)]
    pub metadata: DeliveryMetadata,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: DeliveryStatus,
}

#[derive(Deserialize)]
pub struct EndSessionRequest {
    pub reason: EndReason,
}

#[derive(Deserialize)]
pub struct IngestFixRequest {
    pub latitude: f64,
    pub longitude: f64,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub speed_mps: Option<f64>,
    #[serde(default)]
    pub heading_deg: Option<f64>,
}

#[derive(Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum IngestResponse {
    Accepted { update: TrackingUpdate },
    Rejected { rejection: RejectReason },
}

async fn start_session(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<StartSessionRequest>,
) -> Result<Json<DeliveryTrackingSession>, AppError> {
    let session = lifecycle::start_session(
        &state,
        &payload.delivery_id,
        payload.destination,
        payload.metadata,
    )?;
    Ok(Json(session))
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<DeliveryTrackingSession>> {
    Json(lifecycle::list_sessions(&state).await)
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, AppError> {
    Ok(Json(lifecycle::get_session(&state, &id).await?))
}

async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<SessionView>, AppError> {
    Ok(Json(
        lifecycle::update_status(&state, &id, payload.status).await?,
    ))
}

async fn end_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<EndSessionRequest>,
) -> Result<Json<ArchivedSession>, AppError> {
    Ok(Json(
        lifecycle::end_session(&state, &id, payload.reason).await?,
    ))
}

async fn ingest_fix(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<IngestFixRequest>,
) -> Result<Response, AppError> {
    let fix = PositionFix {
        position: GeoPoint::new(payload.latitude, payload.longitude),
        captured_at: payload.captured_at,
        speed_mps: payload.speed_mps,
        heading_deg: payload.heading_deg,
    };

    match ingest(&state, &id, fix).await {
        IngestOutcome::Accepted(update) => Ok((
            StatusCode::ACCEPTED,
            Json(IngestResponse::Accepted { update }),
        )
            .into_response()),
        IngestOutcome::Rejected(RejectReason::NoActiveSession) => Err(AppError::NotFound(
            format!("no active session for delivery {id}"),
        )),
        IngestOutcome::Rejected(RejectReason::InvalidFix { detail }) => {
            Err(AppError::BadRequest(detail))
        }
        IngestOutcome::Rejected(rejection @ RejectReason::StaleFix { .. }) => Ok((
            StatusCode::OK,
            Json(IngestResponse::Rejected { rejection }),
        )
            .into_response()),
    }
}
