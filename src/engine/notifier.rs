use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::error::AppError;
use crate::models::event::ProximityEvent;
use crate::state::AppState;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &ProximityEvent) -> Result<(), AppError>;
}

pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &ProximityEvent) -> Result<(), AppError> {
        info!(
            event_id = %event.id,
            delivery_id = %event.delivery_id,
            kind = event.kind.as_str(),
            distance_m = event.distance_meters,
            "proximity notification"
        );
        Ok(())
    }
}

/// Never blocks: a full queue drops the notification.
pub fn emit_proximity_event(state: &AppState, event: ProximityEvent) {
    state
        .metrics
        .proximity_events_total
        .with_label_values(&[event.kind.as_str()])
        .inc();

    info!(
        delivery_id = %event.delivery_id,
        kind = event.kind.as_str(),
        distance_m = event.distance_meters,
        "proximity threshold crossed"
    );

    let _ = state.proximity_events_tx.send(event.clone());

    if let Err(err) = state.notification_tx.try_send(event) {
        state
            .metrics
            .notifications_total
            .with_label_values(&["dropped"])
            .inc();
        warn!(error = %err, "notification queue unavailable; dropping proximity notification");
    }
}

pub async fn run_notification_dispatcher(
    state: Arc<AppState>,
    notifier: Arc<dyn Notifier>,
    mut event_rx: mpsc::Receiver<ProximityEvent>,
) {
    info!("notification dispatcher started");

    while let Some(event) = event_rx.recv().await {
        match notifier.notify(&event).await {
            Ok(()) => {
                state
                    .metrics
                    .notifications_total
                    .with_label_values(&["success"])
                    .inc();
            }
            Err(err) => {
                state
                    .metrics
                    .notifications_total
                    .with_label_values(&["error"])
                    .inc();
                error!(
                    error = %err,
                    delivery_id = %event.delivery_id,
                    kind = event.kind.as_str(),
                    "failed to deliver proximity notification"
                );
            }
        }
    }

    warn!("notification dispatcher stopped: queue channel closed");
}
