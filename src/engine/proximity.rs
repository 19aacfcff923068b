use crate::config::TrackingSettings;
use crate::models::event::ProximityKind;
use crate::models::session::ThresholdState;

/// `Nearby` fires only from `None` and outside the arrived radius. Nothing
/// moves the state backwards.
pub fn next_crossing(
    current: ThresholdState,
    distance_meters: f64,
    settings: &TrackingSettings,
) -> Option<ProximityKind> {
    if distance_meters <= settings.arrived_threshold_m {
        return (current != ThresholdState::Arrived).then_some(ProximityKind::Arrived);
    }

    if distance_meters <= settings.nearby_threshold_m && current == ThresholdState::None {
        return Some(ProximityKind::Nearby);
    }

    None
}
