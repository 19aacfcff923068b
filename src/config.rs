use std::env;
use std::time::Duration;

use crate::error::AppError;

const MIN_SPEED_FLOOR_MPS: f64 = 0.1;
const MAX_WINDOW: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub grpc_port: u16,
    pub log_level: String,
    pub notification_queue_size: usize,
    pub event_buffer_size: usize,
    pub tracking: TrackingSettings,
}

#[derive(Debug, Clone)]
pub struct TrackingSettings {
    pub nearby_threshold_m: f64,
    pub arrived_threshold_m: f64,
    pub fix_window_size: usize,
    pub default_speed_mps: f64,
    pub min_speed_mps: f64,
    pub max_clock_skew: Duration,
    pub inactivity_timeout: Duration,
    pub sweep_interval: Duration,
    pub archive_retention: Duration,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            nearby_threshold_m: 1_000.0,
            arrived_threshold_m: 100.0,
            fix_window_size: 5,
            default_speed_mps: 4.2,
            min_speed_mps: 0.5,
            max_clock_skew: Duration::from_secs(30),
            inactivity_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(30),
            archive_retention: Duration::from_secs(3_600),
        }
    }
}

impl TrackingSettings {
    pub fn validate(&self) -> Result<(), AppError> {
        if !(self.arrived_threshold_m > 0.0 && self.arrived_threshold_m < self.nearby_threshold_m) {
            return Err(AppError::Internal(format!(
                "thresholds must satisfy 0 < arrived ({}) < nearby ({})",
                self.arrived_threshold_m, self.nearby_threshold_m
            )));
        }
        if self.fix_window_size < 2 {
            return Err(AppError::Internal("FIX_WINDOW_SIZE must be >= 2".to_string()));
        }
        if !(self.min_speed_mps >= MIN_SPEED_FLOOR_MPS && self.min_speed_mps.is_finite()) {
            return Err(AppError::Internal(format!(
                "MIN_SPEED_MPS must be >= {MIN_SPEED_FLOOR_MPS}, got {}",
                self.min_speed_mps
            )));
        }
        if !(self.default_speed_mps >= self.min_speed_mps && self.default_speed_mps.is_finite()) {
            return Err(AppError::Internal(format!(
                "DEFAULT_SPEED_MPS must be >= MIN_SPEED_MPS, got {}",
                self.default_speed_mps
            )));
        }
        if self.sweep_interval.is_zero() {
            return Err(AppError::Internal("SWEEP_INTERVAL_SECS must be > 0".to_string()));
        }
        if self.inactivity_timeout.is_zero() {
            return Err(AppError::Internal("INACTIVITY_TIMEOUT_SECS must be > 0".to_string()));
        }
        for (key, value) in [
            ("MAX_CLOCK_SKEW_SECS", self.max_clock_skew),
            ("INACTIVITY_TIMEOUT_SECS", self.inactivity_timeout),
            ("SWEEP_INTERVAL_SECS", self.sweep_interval),
            ("ARCHIVE_RETENTION_SECS", self.archive_retention),
        ] {
            if value > MAX_WINDOW {
                return Err(AppError::Internal(format!(
                    "{key} must be at most {} seconds",
                    MAX_WINDOW.as_secs()
                )));
            }
        }
        Ok(())
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let defaults = TrackingSettings::default();
        let tracking = TrackingSettings {
            nearby_threshold_m: parse_or_default("NEARBY_THRESHOLD_M", defaults.nearby_threshold_m)?,
            arrived_threshold_m: parse_or_default(
                "ARRIVED_THRESHOLD_M",
                defaults.arrived_threshold_m,
            )?,
            fix_window_size: parse_or_default("FIX_WINDOW_SIZE", defaults.fix_window_size)?,
            default_speed_mps: parse_or_default("DEFAULT_SPEED_MPS", defaults.default_speed_mps)?,
            min_speed_mps: parse_or_default("MIN_SPEED_MPS", defaults.min_speed_mps)?,
            max_clock_skew: secs_or_default("MAX_CLOCK_SKEW_SECS", defaults.max_clock_skew)?,
            inactivity_timeout: secs_or_default(
                "INACTIVITY_TIMEOUT_SECS",
                defaults.inactivity_timeout,
            )?,
            sweep_interval: secs_or_default("SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            archive_retention: secs_or_default(
                "ARCHIVE_RETENTION_SECS",
                defaults.archive_retention,
            )?,
        };
        tracking.validate()?;

        let notification_queue_size = parse_or_default("NOTIFICATION_QUEUE_SIZE", 1024)?;
        let event_buffer_size = parse_or_default("EVENT_BUFFER_SIZE", 1024)?;
        if notification_queue_size == 0 || event_buffer_size == 0 {
            return Err(AppError::Internal(
                "NOTIFICATION_QUEUE_SIZE and EVENT_BUFFER_SIZE must be > 0".to_string(),
            ));
        }

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            grpc_port: parse_or_default("GRPC_PORT", 50051)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            notification_queue_size,
            event_buffer_size,
            tracking,
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}

fn secs_or_default(key: &str, default: Duration) -> Result<Duration, AppError> {
    parse_or_default(key, default.as_secs()).map(Duration::from_secs)
}
