use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use crate::config::TrackingSettings;
use crate::geo::haversine_m;
use crate::models::fix::{GeoPoint, PositionFix};
use crate::models::session::DeliveryTrackingSession;

/// ETAs further out than this are reported at the horizon.
pub const MAX_ETA_HORIZON_MS: i64 = 24 * 60 * 60 * 1_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub distance_meters: f64,
    pub speed_mps: f64,
    pub eta_at: DateTime<Utc>,
}

pub fn evaluate_session(
    session: &DeliveryTrackingSession,
    settings: &TrackingSettings,
    now: DateTime<Utc>,
) -> Option<Evaluation> {
    let latest = session.latest_fix.as_ref()?;
    Some(evaluate(
        &session.destination,
        latest,
        &session.recent_fixes,
        settings,
        now,
    ))
}

pub fn evaluate(
    destination: &GeoPoint,
    latest: &PositionFix,
    window: &VecDeque<PositionFix>,
    settings: &TrackingSettings,
    now: DateTime<Utc>,
) -> Evaluation {
    let distance_meters = haversine_m(&latest.position, destination);
    let speed_mps = estimate_speed_mps(latest, window, settings);

    let eta_at = if distance_meters <= settings.arrived_threshold_m {
        now
    } else {
        eta_after(now, distance_meters / speed_mps)
    };

    Evaluation {
        distance_meters,
        speed_mps,
        eta_at,
    }
}

fn eta_after(now: DateTime<Utc>, travel_secs: f64) -> DateTime<Utc> {
    let travel_ms = (travel_secs * 1_000.0)
        .round()
        .min(MAX_ETA_HORIZON_MS as f64)
        .max(0.0) as i64;

    Duration::try_milliseconds(travel_ms)
        .and_then(|travel| now.checked_add_signed(travel))
        .unwrap_or(now)
}

pub fn estimate_speed_mps(
    latest: &PositionFix,
    window: &VecDeque<PositionFix>,
    settings: &TrackingSettings,
) -> f64 {
    let reported = latest
        .speed_mps
        .filter(|speed| speed.is_finite() && *speed > 0.0);

    window_speed_mps(window)
        .or(reported)
        .unwrap_or(settings.default_speed_mps)
        .max(settings.min_speed_mps)
}

pub fn window_speed_mps(window: &VecDeque<PositionFix>) -> Option<f64> {
    let (first, last) = (window.front()?, window.back()?);
    if window.len() < 2 {
        return None;
    }

    let elapsed_secs = (last.captured_at - first.captured_at).num_milliseconds() as f64 / 1_000.0;
    if elapsed_secs <= 0.0 {
        return None;
    }

    let traveled: f64 = window
        .iter()
        .zip(window.iter().skip(1))
        .map(|(a, b)| haversine_m(&a.position, &b.position))
        .sum();

    Some(traveled / elapsed_secs)
}
