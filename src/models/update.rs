use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::fix::GeoPoint;
use crate::models::session::{DeliveryStatus, ThresholdState};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackingUpdate {
    pub delivery_id: String,
    pub position: GeoPoint,
    pub captured_at: DateTime<Utc>,
    pub distance_meters: f64,
    pub eta_at: DateTime<Utc>,
    pub speed_mps: f64,
    pub threshold_state: ThresholdState,
    pub status: DeliveryStatus,
}
