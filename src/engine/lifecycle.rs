use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::error::AppError;
use crate::models::fix::GeoPoint;
use crate::models::session::{
    ArchivedSession, DeliveryMetadata, DeliveryStatus, DeliveryTrackingSession, EndReason,
    SessionView,
};
use crate::state::{AppState, SessionHandle};

pub fn start_session(
    state: &AppState,
    delivery_id: &str,
    destination: GeoPoint,
    metadata: DeliveryMetadata,
) -> Result<DeliveryTrackingSession, AppError> {
    let delivery_id = delivery_id.trim();
    if delivery_id.is_empty() {
        return Err(AppError::BadRequest("delivery_id cannot be empty".to_string()));
    }
    if !destination.is_valid() {
        return Err(AppError::BadRequest(format!(
            "destination out of range: lat={}, lng={}",
            destination.lat, destination.lng
        )));
    }

    let session = match state.sessions.entry(delivery_id.to_string()) {
        Entry::Occupied(_) => {
            return Err(AppError::Conflict(format!(
                "delivery {delivery_id} is already being tracked"
            )));
        }
        Entry::Vacant(slot) => {
            let mut session = DeliveryTrackingSession::new(
                delivery_id.to_string(),
                destination,
                metadata,
                Utc::now(),
            );
            session.topic_generation = state.broadcaster.open(delivery_id);
            // archive is touched under the sessions entry lock, same as in close_session
            state.archive.remove(delivery_id);
            slot.insert(Arc::new(Mutex::new(session.clone())));
            session
        }
    };

    state.metrics.active_sessions.inc();

    info!(
        delivery_id,
        lat = destination.lat,
        lng = destination.lng,
        "tracking session started"
    );

    Ok(session)
}

pub async fn end_session(
    state: &AppState,
    delivery_id: &str,
    reason: EndReason,
) -> Result<ArchivedSession, AppError> {
    let handle = state
        .session(delivery_id)
        .ok_or_else(|| no_session(delivery_id))?;

    close_session(state, delivery_id, &handle, reason, |_| true)
        .await
        .ok_or_else(|| no_session(delivery_id))
}

pub async fn update_status(
    state: &AppState,
    delivery_id: &str,
    status: DeliveryStatus,
) -> Result<SessionView, AppError> {
    let handle = state
        .session(delivery_id)
        .ok_or_else(|| no_session(delivery_id))?;

    {
        let mut session = handle.lock().await;
        if session.is_ended() {
            return Err(no_session(delivery_id));
        }
        if !session.status.can_advance_to(status) {
            return Err(AppError::Conflict(format!(
                "cannot move delivery {delivery_id} from {:?} to {status:?}",
                session.status
            )));
        }
        if !status.is_terminal() {
            session.status = status;
            info!(delivery_id, status = ?status, "delivery status updated");
            return Ok(SessionView::Active(session.clone()));
        }
    }

    let reason = match status {
        DeliveryStatus::Cancelled => EndReason::Cancelled,
        _ => EndReason::Delivered,
    };
    close_session(state, delivery_id, &handle, reason, |_| true)
        .await
        .map(SessionView::Ended)
        .ok_or_else(|| no_session(delivery_id))
}

pub async fn get_session(state: &AppState, delivery_id: &str) -> Result<SessionView, AppError> {
    if let Some(handle) = state.session(delivery_id) {
        let session = handle.lock().await;
        if !session.is_ended() {
            return Ok(SessionView::Active(session.clone()));
        }
    }

    state
        .archive
        .get(delivery_id)
        .map(|entry| SessionView::Ended(entry.value().clone()))
        .ok_or_else(|| AppError::NotFound(format!("delivery {delivery_id} not found")))
}

pub async fn list_sessions(state: &AppState) -> Vec<DeliveryTrackingSession> {
    let handles: Vec<SessionHandle> = state
        .sessions
        .iter()
        .map(|entry| entry.value().clone())
        .collect();

    let mut sessions = Vec::with_capacity(handles.len());
    for handle in handles {
        let session = handle.lock().await;
        if !session.is_ended() {
            sessions.push(session.clone());
        }
    }
    sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
    sessions
}

pub async fn expire_idle_sessions(state: &AppState, now: DateTime<Utc>) -> Vec<String> {
    let timeout = Duration::from_std(state.settings.inactivity_timeout).unwrap_or(Duration::MAX);
    let Some(cutoff) = now.checked_sub_signed(timeout) else {
        return Vec::new();
    };

    let candidates: Vec<(String, SessionHandle)> = state
        .sessions
        .iter()
        .map(|entry| (entry.key().clone(), entry.value().clone()))
        .collect();

    let mut expired = Vec::new();
    for (delivery_id, handle) in candidates {
        let closed = close_session(
            state,
            &delivery_id,
            &handle,
            EndReason::InactivityTimeout,
            |session| session.last_activity_at <= cutoff,
        )
        .await;
        if closed.is_some() {
            expired.push(delivery_id);
        }
    }
    expired
}

pub fn prune_archive(state: &AppState, now: DateTime<Utc>) -> usize {
    let retention = Duration::from_std(state.settings.archive_retention).unwrap_or(Duration::MAX);
    let Some(cutoff) = now.checked_sub_signed(retention) else {
        return 0;
    };

    let before = state.archive.len();
    state.archive.retain(|_, archived| archived.ended_at > cutoff);
    before.saturating_sub(state.archive.len())
}

pub async fn run_inactivity_sweeper(state: Arc<AppState>) {
    info!(
        interval_secs = state.settings.sweep_interval.as_secs(),
        timeout_secs = state.settings.inactivity_timeout.as_secs(),
        "inactivity sweeper started"
    );

    let mut ticker = tokio::time::interval(state.settings.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let now = Utc::now();

        let expired = expire_idle_sessions(&state, now).await;
        if !expired.is_empty() {
            info!(count = expired.len(), "expired idle tracking sessions");
        }

        let pruned = prune_archive(&state, now);
        if pruned > 0 {
            debug!(count = pruned, "pruned archived sessions");
        }
    }
}

/// Ends the session behind `handle` if `should_close` agrees and it is still
/// the one registered under `delivery_id`. Subscribers see end-of-stream.
async fn close_session(
    state: &AppState,
    delivery_id: &str,
    handle: &SessionHandle,
    reason: EndReason,
    should_close: impl FnOnce(&DeliveryTrackingSession) -> bool,
) -> Option<ArchivedSession> {
    let mut session = handle.lock().await;
    if session.is_ended() || !should_close(&*session) {
        return None;
    }

    let archived = match state.sessions.entry(delivery_id.to_string()) {
        Entry::Occupied(entry) if Arc::ptr_eq(entry.get(), handle) => {
            if let Some(status) = reason.terminal_status() {
                session.status = status;
            }
            session.ended = Some(reason);

            let archived = ArchivedSession::from_session(&session, reason, Utc::now());
            state
                .archive
                .insert(delivery_id.to_string(), archived.clone());
            entry.remove();
            archived
        }
        _ => return None,
    };

    state
        .broadcaster
        .close(delivery_id, session.topic_generation);
    state.metrics.active_sessions.dec();

    info!(
        delivery_id,
        reason = ?reason,
        status = ?session.status,
        threshold = ?session.last_crossed_threshold,
        "tracking session ended"
    );

    Some(archived)
}

fn no_session(delivery_id: &str) -> AppError {
    AppError::NotFound(format!("no active session for delivery {delivery_id}"))
}
