use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;

/// Tunables of the order lifecycle engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub proximity_radius_km: f64,
    pub max_active_orders: usize,
    pub assigned_timeout: Duration,
    pub reclaim_interval: Duration,
    pub sync_fallback_interval: Duration,
    pub location_debounce: Duration,
    pub location_min_move_m: f64,
    pub event_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            proximity_radius_km: 5.0,
            max_active_orders: 2,
            assigned_timeout: Duration::from_secs(60),
            reclaim_interval: Duration::from_secs(15),
            sync_fallback_interval: Duration::from_secs(60),
            location_debounce: Duration::from_millis(2_000),
            location_min_move_m: 50.0,
            event_buffer_size: 1024,
        }
    }
}

impl EngineConfig {
    /// Zero intervals panic inside `interval_at` and a zero buffer panics in
    /// `broadcast::channel`, so both are rejected up front.
    pub fn validate(&self) -> Result<(), AppError> {
        let checks = [
            ("MAX_ACTIVE_ORDERS", self.max_active_orders == 0),
            ("RECLAIM_INTERVAL_SECS", self.reclaim_interval.is_zero()),
            ("SYNC_FALLBACK_SECS", self.sync_fallback_interval.is_zero()),
            ("EVENT_BUFFER_SIZE", self.event_buffer_size == 0),
        ];

        for (key, invalid) in checks {
            if invalid {
                return Err(AppError::Internal(format!("invalid {key}: must be > 0")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub backend_url: Option<String>,
    pub backend_key: String,
    pub change_poll: Duration,
    pub geocoder_url: String,
    pub geocode_delay: Duration,
    pub storage_path: PathBuf,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            proximity_radius_km: parse_or_default(
                "PROXIMITY_RADIUS_KM",
                defaults.proximity_radius_km,
            )?,
            max_active_orders: parse_or_default("MAX_ACTIVE_ORDERS", defaults.max_active_orders)?,
            assigned_timeout: Duration::from_secs(parse_or_default("ASSIGNED_TIMEOUT_SECS", 60)?),
            reclaim_interval: Duration::from_secs(parse_or_default("RECLAIM_INTERVAL_SECS", 15)?),
            sync_fallback_interval: Duration::from_secs(parse_or_default(
                "SYNC_FALLBACK_SECS",
                60,
            )?),
            location_debounce: Duration::from_millis(parse_or_default(
                "LOCATION_DEBOUNCE_MS",
                2_000,
            )?),
            location_min_move_m: parse_or_default(
                "LOCATION_MIN_MOVE_M",
                defaults.location_min_move_m,
            )?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", defaults.event_buffer_size)?,
        };

        engine.validate()?;

        let change_poll = Duration::from_secs(parse_or_default("CHANGE_POLL_SECS", 5)?);
        if change_poll.is_zero() {
            return Err(AppError::Internal(
                "invalid CHANGE_POLL_SECS: must be > 0".to_string(),
            ));
        }

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            backend_url: env::var("BACKEND_URL").ok().filter(|url| !url.trim().is_empty()),
            backend_key: env::var("BACKEND_KEY").unwrap_or_default(),
            change_poll,
            geocoder_url: env::var("GEOCODER_URL")
                .unwrap_or_else(|_| "https://nominatim.openstreetmap.org".to_string()),
            geocode_delay: Duration::from_millis(parse_or_default("GEOCODE_DELAY_MS", 1_000)?),
            storage_path: env::var("STORAGE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("driver-state.json")),
            engine,
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
