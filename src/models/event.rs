use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ProximityKind {
    Nearby,
    Arrived,
}

impl ProximityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProximityKind::Nearby => "nearby",
            ProximityKind::Arrived => "arrived",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProximityEvent {
    pub id: Uuid,
    pub delivery_id: String,
    pub kind: ProximityKind,
    pub distance_meters: f64,
    pub emitted_at: DateTime<Utc>,
}

impl ProximityEvent {
    pub fn new(delivery_id: &str, kind: ProximityKind, distance_meters: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            delivery_id: delivery_id.to_string(),
            kind,
            distance_meters,
            emitted_at: Utc::now(),
        }
    }
}
