use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, broadcast, mpsc};

use crate::config::TrackingSettings;
use crate::engine::broadcaster::TrackingBroadcaster;
use crate::models::event::ProximityEvent;
use crate::models::session::{ArchivedSession, DeliveryTrackingSession};
use crate::observability::metrics::Metrics;

pub type SessionHandle = Arc<Mutex<DeliveryTrackingSession>>;

pub struct AppState {
    pub sessions: DashMap<String, SessionHandle>,
    pub archive: DashMap<String, ArchivedSession>,
    pub broadcaster: TrackingBroadcaster,
    pub notification_tx: mpsc::Sender<ProximityEvent>,
    pub proximity_events_tx: broadcast::Sender<ProximityEvent>,
    pub settings: TrackingSettings,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(
        settings: TrackingSettings,
        notification_queue_size: usize,
        event_buffer_size: usize,
    ) -> (Self, mpsc::Receiver<ProximityEvent>) {
        let (notification_tx, notification_rx) = mpsc::channel(notification_queue_size);
        let (proximity_events_tx, _unused_rx) = broadcast::channel(event_buffer_size);

        (
            Self {
                sessions: DashMap::new(),
                archive: DashMap::new(),
                broadcaster: TrackingBroadcaster::new(),
                notification_tx,
                proximity_events_tx,
                settings,
                metrics: Metrics::new(),
            },
            notification_rx,
        )
    }

    /// Clones the handle out so the map shard is not held while waiting on the
    /// session lock.
    pub fn session(&self, delivery_id: &str) -> Option<SessionHandle> {
        self.sessions
            .get(delivery_id)
            .map(|entry| entry.value().clone())
    }
}
