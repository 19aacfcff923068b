pub mod animation;
pub mod format;

use std::time::Duration;

use chrono::Utc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::engine::broadcaster::Subscription;
use crate::models::fix::GeoPoint;
use crate::models::session::{DeliveryStatus, ThresholdState};
use crate::models::update::TrackingUpdate;

pub use animation::{Easing, MarkerAnimator};
use format::{format_distance, format_eta};

#[derive(Debug, Clone, PartialEq)]
pub struct TrackingText {
    pub distance: String,
    pub eta: String,
    pub threshold_state: ThresholdState,
    pub status: DeliveryStatus,
}

impl TrackingText {
    pub fn from_update(update: &TrackingUpdate) -> Self {
        Self {
            distance: format_distance(update.distance_meters),
            eta: format_eta(update.eta_at, Utc::now()),
            threshold_state: update.threshold_state,
            status: update.status,
        }
    }
}

pub trait MarkerRenderer {
    fn move_marker(&mut self, position: GeoPoint);
    fn show_text(&mut self, text: &TrackingText);
    fn stream_ended(&mut self);
}

#[derive(Debug, Clone)]
pub struct PresentationSettings {
    pub animation_window: Duration,
    pub frame_interval: Duration,
    pub easing: Easing,
}

impl Default for PresentationSettings {
    fn default() -> Self {
        Self {
            animation_window: Duration::from_secs(1),
            frame_interval: Duration::from_millis(16),
            easing: Easing::Linear,
        }
    }
}

pub struct PresentationAdapter<R> {
    renderer: R,
    animator: MarkerAnimator,
    frame_interval: Duration,
}

impl<R: MarkerRenderer> PresentationAdapter<R> {
    pub fn new(renderer: R, settings: PresentationSettings) -> Self {
        Self {
            renderer,
            animator: MarkerAnimator::new(settings.animation_window, settings.easing),
            frame_interval: settings.frame_interval,
        }
    }

    pub fn on_update(&mut self, update: &TrackingUpdate, now: std::time::Instant) {
        self.renderer.show_text(&TrackingText::from_update(update));
        self.animator.retarget(update.position, now);
        self.on_frame(now);
    }

    pub fn on_frame(&mut self, now: std::time::Instant) {
        if let Some(position) = self.animator.position(now) {
            self.renderer.move_marker(position);
        }
    }

    pub async fn run(mut self, mut subscription: Subscription) -> R {
        let mut ticker = tokio::time::interval(self.frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let animating = !self.animator.is_settled(Instant::now().into_std());

            tokio::select! {
                update = subscription.recv() => match update {
                    Some(update) => self.on_update(&update, Instant::now().into_std()),
                    None => break,
                },
                tick = ticker.tick(), if animating => self.on_frame(tick.into_std()),
            }
        }

        if let Some(target) = self.animator.target() {
            self.renderer.move_marker(target);
        }
        self.renderer.stream_ended();
        debug!(delivery_id = subscription.delivery_id(), "presentation stream ended");

        self.renderer
    }
}
