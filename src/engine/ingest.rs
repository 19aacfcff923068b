use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::TrackingSettings;
use crate::engine::evaluator::evaluate;
use crate::engine::notifier::emit_proximity_event;
use crate::engine::proximity::next_crossing;
use crate::models::event::ProximityEvent;
use crate::models::fix::PositionFix;
use crate::models::update::TrackingUpdate;
use crate::state::AppState;

#[derive(Debug, Clone)]
pub enum IngestOutcome {
    Accepted(TrackingUpdate),
    Rejected(RejectReason),
}

impl IngestOutcome {
    fn label(&self) -> &'static str {
        match self {
            IngestOutcome::Accepted(_) => "accepted",
            IngestOutcome::Rejected(reason) => reason.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    NoActiveSession,
    InvalidFix { detail: String },
    StaleFix { latest_captured_at: DateTime<Utc> },
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::NoActiveSession => "no_active_session",
            RejectReason::InvalidFix { .. } => "invalid_fix",
            RejectReason::StaleFix { .. } => "stale_fix",
        }
    }
}

/// Validation, evaluation, the proximity check and publication all happen
/// while the session lock is held, so two fixes for the same delivery never
/// interleave.
pub async fn ingest(state: &AppState, delivery_id: &str, fix: PositionFix) -> IngestOutcome {
    let start = Instant::now();
    let outcome = process_fix(state, delivery_id, fix).await;

    let label = outcome.label();
    state
        .metrics
        .fixes_ingested_total
        .with_label_values(&[label])
        .inc();
    state
        .metrics
        .ingest_latency_seconds
        .with_label_values(&[label])
        .observe(start.elapsed().as_secs_f64());

    outcome
}

async fn process_fix(state: &AppState, delivery_id: &str, fix: PositionFix) -> IngestOutcome {
    let now = Utc::now();

    if let Err(detail) = validate_fix(&fix, &state.settings, now) {
        debug!(delivery_id, %detail, "fix rejected: invalid");
        return IngestOutcome::Rejected(RejectReason::InvalidFix { detail });
    }

    let Some(handle) = state.session(delivery_id) else {
        debug!(delivery_id, "fix rejected: no active session");
        return IngestOutcome::Rejected(RejectReason::NoActiveSession);
    };

    let mut session = handle.lock().await;
    if session.is_ended() {
        debug!(delivery_id, "fix rejected: session ended while waiting");
        return IngestOutcome::Rejected(RejectReason::NoActiveSession);
    }

    if let Some(latest_captured_at) = session.latest_captured_at() {
        if fix.captured_at <= latest_captured_at {
            debug!(
                delivery_id,
                captured_at = %fix.captured_at,
                latest = %latest_captured_at,
                "fix rejected: stale"
            );
            return IngestOutcome::Rejected(RejectReason::StaleFix { latest_captured_at });
        }
    }

    session.record_fix(fix.clone(), state.settings.fix_window_size, now);
    let evaluation = evaluate(
        &session.destination,
        &fix,
        &session.recent_fixes,
        &state.settings,
        now,
    );
    session.distance_meters = Some(evaluation.distance_meters);
    session.speed_mps = Some(evaluation.speed_mps);
    session.eta_at = Some(evaluation.eta_at);

    let crossing = next_crossing(
        session.last_crossed_threshold,
        evaluation.distance_meters,
        &state.settings,
    );
    if let Some(kind) = crossing {
        session.cross(kind);
    }

    let update = TrackingUpdate {
        delivery_id: session.delivery_id.clone(),
        position: fix.position,
        captured_at: fix.captured_at,
        distance_meters: evaluation.distance_meters,
        eta_at: evaluation.eta_at,
        speed_mps: evaluation.speed_mps,
        threshold_state: session.last_crossed_threshold,
        status: session.status,
    };
    state.broadcaster.publish(&update);

    if let Some(kind) = crossing {
        emit_proximity_event(
            state,
            ProximityEvent::new(delivery_id, kind, evaluation.distance_meters),
        );
    }

    debug!(
        delivery_id,
        distance_m = evaluation.distance_meters,
        speed_mps = evaluation.speed_mps,
        eta_at = %evaluation.eta_at,
        "fix accepted"
    );

    IngestOutcome::Accepted(update)
}

pub fn validate_fix(
    fix: &PositionFix,
    settings: &TrackingSettings,
    now: DateTime<Utc>,
) -> Result<(), String> {
    if !fix.position.is_valid() {
        return Err(format!(
            "coordinates out of range: lat={}, lng={}",
            fix.position.lat, fix.position.lng
        ));
    }

    if let Some(speed) = fix.speed_mps {
        if !speed.is_finite() || speed < 0.0 {
            return Err(format!("invalid speed_mps: {speed}"));
        }
    }

    if let Some(heading) = fix.heading_deg {
        if !heading.is_finite() || !(0.0..360.0).contains(&heading) {
            return Err(format!("invalid heading_deg: {heading}"));
        }
    }

    let max_skew = Duration::from_std(settings.max_clock_skew).unwrap_or(Duration::MAX);
    if let Some(limit) = now.checked_add_signed(max_skew) {
        if fix.captured_at > limit {
            return Err(format!("captured_at {} is in the future", fix.captured_at));
        }
    }

    Ok(())
}
