use std::time::{Duration, Instant};

use crate::geo::lerp;
use crate::models::fix::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Easing {
    #[default]
    Linear,
    EaseOutCubic,
}

impl Easing {
    pub fn apply(&self, t: f64) -> f64 {
        let t = t.clamp(0.0, 1.0);
        match self {
            Easing::Linear => t,
            Easing::EaseOutCubic => 1.0 - (1.0 - t).powi(3),
        }
    }
}

pub fn position_at(
    from: &GeoPoint,
    to: &GeoPoint,
    elapsed: Duration,
    duration: Duration,
    easing: Easing,
) -> GeoPoint {
    let progress = if duration.is_zero() {
        1.0
    } else {
        elapsed.as_secs_f64() / duration.as_secs_f64()
    };
    lerp(from, to, easing.apply(progress))
}

#[derive(Debug, Clone, Copy)]
struct Leg {
    from: GeoPoint,
    to: GeoPoint,
    started_at: Instant,
}

#[derive(Debug, Clone)]
pub struct MarkerAnimator {
    duration: Duration,
    easing: Easing,
    leg: Option<Leg>,
}

impl MarkerAnimator {
    pub fn new(duration: Duration, easing: Easing) -> Self {
        Self {
            duration,
            easing,
            leg: None,
        }
    }

    /// Starts from wherever the marker is at `now`, even mid-leg.
    pub fn retarget(&mut self, target: GeoPoint, now: Instant) {
        let from = self.position(now).unwrap_or(target);
        self.leg = Some(Leg {
            from,
            to: target,
            started_at: now,
        });
    }

    pub fn position(&self, now: Instant) -> Option<GeoPoint> {
        let leg = self.leg?;
        Some(position_at(
            &leg.from,
            &leg.to,
            now.saturating_duration_since(leg.started_at),
            self.duration,
            self.easing,
        ))
    }

    pub fn target(&self) -> Option<GeoPoint> {
        self.leg.map(|leg| leg.to)
    }

    pub fn is_settled(&self, now: Instant) -> bool {
        self.leg
            .is_none_or(|leg| now.saturating_duration_since(leg.started_at) >= self.duration)
    }
}
