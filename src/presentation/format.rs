use chrono::{DateTime, Utc};

pub fn format_distance(meters: f64) -> String {
    let meters = meters.max(0.0);
    if meters < 1_000.0 {
        format!("{} m", meters.round() as u64)
    } else {
        format!("{:.1} km", meters / 1_000.0)
    }
}

pub fn format_eta(eta_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (eta_at - now).num_seconds();
    if secs < 60 {
        return "Arriving now".to_string();
    }

    let minutes = (secs + 30) / 60;
    if minutes < 60 {
        format!("{minutes} min")
    } else {
        format!("{} h {:02} min", minutes / 60, minutes % 60)
    }
}
