use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::event::ProximityKind;
use crate::models::fix::{GeoPoint, PositionFix};
use crate::models::update::TrackingUpdate;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ThresholdState {
    #[default]
    None,
    Nearby,
    Arrived,
}

impl From<ProximityKind> for ThresholdState {
    fn from(kind: ProximityKind) -> Self {
        match kind {
            ProximityKind::Nearby => ThresholdState::Nearby,
            ProximityKind::Arrived => ThresholdState::Arrived,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeliveryStatus {
    Assigned,
    PickedUp,
    EnRoute,
    Nearby,
    Arrived,
    Delivered,
    Cancelled,
}

impl DeliveryStatus {
    fn rank(&self) -> u8 {
        match self {
            DeliveryStatus::Assigned => 0,
            DeliveryStatus::PickedUp => 1,
            DeliveryStatus::EnRoute => 2,
            DeliveryStatus::Nearby => 3,
            DeliveryStatus::Arrived => 4,
            DeliveryStatus::Delivered => 5,
            DeliveryStatus::Cancelled => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Cancelled)
    }

    pub fn can_advance_to(&self, next: DeliveryStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == DeliveryStatus::Cancelled || next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EndReason {
    Delivered,
    Cancelled,
    InactivityTimeout,
}

impl EndReason {
    pub fn terminal_status(&self) -> Option<DeliveryStatus> {
        match self {
            EndReason::Delivered => Some(DeliveryStatus::Delivered),
            EndReason::Cancelled => Some(DeliveryStatus::Cancelled),
            EndReason::InactivityTimeout => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeliveryMetadata {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub courier_id: Option<String>,
    #[serde(default)]
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryTrackingSession {
    pub delivery_id: String,
    pub destination: GeoPoint,
    pub metadata: DeliveryMetadata,
    pub latest_fix: Option<PositionFix>,
    pub recent_fixes: VecDeque<PositionFix>,
    pub distance_meters: Option<f64>,
    pub eta_at: Option<DateTime<Utc>>,
    pub speed_mps: Option<f64>,
    pub last_crossed_threshold: ThresholdState,
    pub status: DeliveryStatus,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) ended: Option<EndReason>,
    #[serde(skip)]
    pub(crate) topic_generation: u64,
}

impl DeliveryTrackingSession {
    pub fn new(
        delivery_id: String,
        destination: GeoPoint,
        metadata: DeliveryMetadata,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            delivery_id,
            destination,
            metadata,
            latest_fix: None,
            recent_fixes: VecDeque::new(),
            distance_meters: None,
            eta_at: None,
            speed_mps: None,
            last_crossed_threshold: ThresholdState::None,
            status: DeliveryStatus::Assigned,
            started_at: now,
            last_activity_at: now,
            ended: None,
            topic_generation: 0,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended.is_some()
    }

    pub fn latest_captured_at(&self) -> Option<DateTime<Utc>> {
        self.latest_fix.as_ref().map(|fix| fix.captured_at)
    }

    pub fn record_fix(&mut self, fix: PositionFix, window_size: usize, received_at: DateTime<Utc>) {
        self.recent_fixes.push_back(fix.clone());
        while self.recent_fixes.len() > window_size.max(1) {
            self.recent_fixes.pop_front();
        }
        self.latest_fix = Some(fix);
        self.last_activity_at = received_at;
    }

    pub fn cross(&mut self, kind: ProximityKind) {
        let next = ThresholdState::from(kind);
        if next > self.last_crossed_threshold {
            self.last_crossed_threshold = next;
        }

        let status = match kind {
            ProximityKind::Nearby => DeliveryStatus::Nearby,
            ProximityKind::Arrived => DeliveryStatus::Arrived,
        };
        if self.status.can_advance_to(status) {
            self.status = status;
        }
    }

    pub fn tracking_update(&self) -> Option<TrackingUpdate> {
        let fix = self.latest_fix.as_ref()?;
        Some(TrackingUpdate {
            delivery_id: self.delivery_id.clone(),
            position: fix.position,
            captured_at: fix.captured_at,
            distance_meters: self.distance_meters?,
            eta_at: self.eta_at?,
            speed_mps: self.speed_mps?,
            threshold_state: self.last_crossed_threshold,
            status: self.status,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedSession {
    pub delivery_id: String,
    pub destination: GeoPoint,
    pub final_status: DeliveryStatus,
    pub last_crossed_threshold: ThresholdState,
    pub last_fix: Option<PositionFix>,
    pub reason: EndReason,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl ArchivedSession {
    pub fn from_session(
        session: &DeliveryTrackingSession,
        reason: EndReason,
        ended_at: DateTime<Utc>,
    ) -> Self {
        Self {
            delivery_id: session.delivery_id.clone(),
            destination: session.destination,
            final_status: session.status,
            last_crossed_threshold: session.last_crossed_threshold,
            last_fix: session.latest_fix.clone(),
            reason,
            started_at: session.started_at,
            ended_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionView {
    Active(DeliveryTrackingSession),
    Ended(ArchivedSession),
}
