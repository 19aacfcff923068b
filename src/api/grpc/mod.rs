use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tonic::{Request, Response, Status};

use crate::engine::ingest::{IngestOutcome, ingest};
use crate::engine::lifecycle;
use crate::models::fix::PositionFix;
use crate::models::session::{
    ArchivedSession, DeliveryMetadata as ModelMetadata, DeliveryStatus, DeliveryTrackingSession,
    EndReason, SessionView,
};
use crate::state::AppState;

pub mod pb {
    tonic::include_proto!("tracking");
}

use pb::tracking_service_server::TrackingService;
use pb::{
    EndSessionRequest, EndSessionResponse, GeoPoint, GetSessionRequest, IngestFixRequest,
    IngestFixResponse, ProximityEvent, SessionResponse, StartSessionRequest, TrackingUpdate,
    UpdateStatusRequest, WatchProximityRequest, WatchTrackingRequest,
};

pub struct GrpcTrackingService {
    state: Arc<AppState>,
}

impl GrpcTrackingService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

fn point_to_proto(p: &crate::models::fix::GeoPoint) -> GeoPoint {
    GeoPoint {
        lat: p.lat,
        lng: p.lng,
    }
}

fn update_to_proto(u: &crate::models::update::TrackingUpdate) -> TrackingUpdate {
    TrackingUpdate {
        delivery_id: u.delivery_id.clone(),
        position: Some(point_to_proto(&u.position)),
        captured_at: u.captured_at.to_rfc3339(),
        distance_meters: u.distance_meters,
        eta_at: u.eta_at.to_rfc3339(),
        speed_mps: u.speed_mps,
        threshold_state: format!("{:?}", u.threshold_state),
        status: format!("{:?}", u.status),
    }
}

fn event_to_proto(e: &crate::models::event::ProximityEvent) -> ProximityEvent {
    ProximityEvent {
        id: e.id.to_string(),
        delivery_id: e.delivery_id.clone(),
        kind: format!("{:?}", e.kind),
        distance_meters: e.distance_meters,
        emitted_at: e.emitted_at.to_rfc3339(),
    }
}

fn session_to_proto(s: &DeliveryTrackingSession) -> SessionResponse {
    SessionResponse {
        delivery_id: s.delivery_id.clone(),
        destination: Some(point_to_proto(&s.destination)),
        status: format!("{:?}", s.status),
        threshold_state: format!("{:?}", s.last_crossed_threshold),
        latest: s.tracking_update().as_ref().map(update_to_proto),
        started_at: s.started_at.to_rfc3339(),
    }
}

fn archived_to_proto(a: &ArchivedSession) -> SessionResponse {
    SessionResponse {
        delivery_id: a.delivery_id.clone(),
        destination: Some(point_to_proto(&a.destination)),
        status: format!("{:?}", a.final_status),
        threshold_state: format!("{:?}", a.last_crossed_threshold),
        latest: None,
        started_at: a.started_at.to_rfc3339(),
    }
}

fn view_to_proto(view: &SessionView) -> SessionResponse {
    match view {
        SessionView::Active(session) => session_to_proto(session),
        SessionView::Ended(archived) => archived_to_proto(archived),
    }
}

fn parse_status(s: &str) -> Result<DeliveryStatus, Status> {
    match s {
        "Assigned" => Ok(DeliveryStatus::Assigned),
        "PickedUp" => Ok(DeliveryStatus::PickedUp),
        "EnRoute" => Ok(DeliveryStatus::EnRoute),
        "Nearby" => Ok(DeliveryStatus::Nearby),
        "Arrived" => Ok(DeliveryStatus::Arrived),
        "Delivered" => Ok(DeliveryStatus::Delivered),
        "Cancelled" => Ok(DeliveryStatus::Cancelled),
        other => Err(Status::invalid_argument(format!(
            "unknown status: {other}, expected Assigned/PickedUp/EnRoute/Nearby/Arrived/Delivered/Cancelled"
        ))),
    }
}

fn parse_reason(s: &str) -> Result<EndReason, Status> {
    match s {
        "Delivered" => Ok(EndReason::Delivered),
        "Cancelled" => Ok(EndReason::Cancelled),
        "InactivityTimeout" => Ok(EndReason::InactivityTimeout),
        other => Err(Status::invalid_argument(format!(
            "unknown reason: {other}, expected Delivered/Cancelled/InactivityTimeout"
        ))),
    }
}

fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>, Status> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| Status::invalid_argument(format!("{field} is not RFC 3339: {err}")))
}

#[tonic::async_trait]
impl TrackingService for GrpcTrackingService {
    async fn start_session(
        &self,
        request: Request<StartSessionRequest>,
    ) -> Result<Response<SessionResponse>, Status> {
        let req = request.into_inner();

        let destination = req
            .destination
            .ok_or_else(|| Status::invalid_argument("destination is required"))?;
        let metadata = req
            .metadata
            .map(|m| ModelMetadata {
                address: Some(m.address).filter(|a| !a.is_empty()),
                courier_id: Some(m.courier_id).filter(|c| !c.is_empty()),
                items: m.items,
            })
            .unwrap_or_default();

        let session = lifecycle::start_session(
            &self.state,
            &req.delivery_id,
            crate::models::fix::GeoPoint::new(destination.lat, destination.lng),
            metadata,
        )?;

        Ok(Response::new(session_to_proto(&session)))
    }

    async fn end_session(
        &self,
        request: Request<EndSessionRequest>,
    ) -> Result<Response<EndSessionResponse>, Status> {
        let req = request.into_inner();
        let reason = parse_reason(&req.reason)?;

        let archived = lifecycle::end_session(&self.state, &req.delivery_id, reason).await?;

        Ok(Response::new(EndSessionResponse {
            delivery_id: archived.delivery_id,
            final_status: format!("{:?}", archived.final_status),
            threshold_state: format!("{:?}", archived.last_crossed_threshold),
            reason: format!("{:?}", archived.reason),
            ended_at: archived.ended_at.to_rfc3339(),
        }))
    }

    async fn update_status(
        &self,
        request: Request<UpdateStatusRequest>,
    ) -> Result<Response<SessionResponse>, Status> {
        let req = request.into_inner();
        let status = parse_status(&req.status)?;

        let view = lifecycle::update_status(&self.state, &req.delivery_id, status).await?;
        Ok(Response::new(view_to_proto(&view)))
    }

    async fn ingest_fix(
        &self,
        request: Request<IngestFixRequest>,
    ) -> Result<Response<IngestFixResponse>, Status> {
        let req = request.into_inner();

        let fix = PositionFix {
            position: crate::models::fix::GeoPoint::new(req.latitude, req.longitude),
            captured_at: parse_timestamp("captured_at", &req.captured_at)?,
            speed_mps: req.speed_mps,
            heading_deg: req.heading_deg,
        };

        let response = match ingest(&self.state, &req.delivery_id, fix).await {
            IngestOutcome::Accepted(update) => IngestFixResponse {
                accepted: true,
                reject_reason: String::new(),
                update: Some(update_to_proto(&update)),
            },
            IngestOutcome::Rejected(reason) => IngestFixResponse {
                accepted: false,
                reject_reason: reason.as_str().to_string(),
                update: None,
            },
        };

        Ok(Response::new(response))
    }

    async fn get_session(
        &self,
        request: Request<GetSessionRequest>,
    ) -> Result<Response<SessionResponse>, Status> {
        let req = request.into_inner();
        let view = lifecycle::get_session(&self.state, &req.delivery_id).await?;
        Ok(Response::new(view_to_proto(&view)))
    }

    type WatchTrackingStream = Pin<Box<dyn Stream<Item = Result<TrackingUpdate, Status>> + Send>>;

    async fn watch_tracking(
        &self,
        request: Request<WatchTrackingRequest>,
    ) -> Result<Response<Self::WatchTrackingStream>, Status> {
        let req = request.into_inner();
        let subscription = self.state.broadcaster.subscribe(&req.delivery_id).ok_or_else(|| {
            Status::not_found(format!("no active session for delivery {}", req.delivery_id))
        })?;

        let stream = subscription
            .into_stream()
            .map(|update| Ok(update_to_proto(&update)));

        Ok(Response::new(Box::pin(stream)))
    }

    type WatchProximityStream = Pin<Box<dyn Stream<Item = Result<ProximityEvent, Status>> + Send>>;

    async fn watch_proximity(
        &self,
        _request: Request<WatchProximityRequest>,
    ) -> Result<Response<Self::WatchProximityStream>, Status> {
        let rx = self.state.proximity_events_tx.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(|result| match result {
            Ok(event) => Some(Ok(event_to_proto(&event))),
            Err(_) => None,
        });

        Ok(Response::new(Box::pin(stream)))
    }
}
