use std::str::FromStr;

use tracing::warn;

/// Runtime configuration, read from the environment with per-variable
/// defaults. Unset variables fall back; set-but-malformed values are errors
/// so a typo never silently reverts to a default.
#[derive(Debug, Clone)]
pub struct Config {
    /// Source API host
    pub ettu_base_url: String,
    /// API key passed as the `apiKey` query parameter
    pub ettu_api_key: String,
    /// External router host for street-following geometry
    pub osrm_base_url: String,
    /// Fast loop period (vehicle poll)
    pub poll_interval_seconds: u64,
    /// Slow loop period (route atlas refresh)
    pub route_refresh_hours: u64,
    /// Match rejection threshold
    pub max_snap_distance_m: f64,
    /// Evict a vehicle after this long without a source observation
    pub vehicle_ttl_seconds: i64,
    /// Flag a vehicle as signal-lost when its source timestamp is older
    pub signal_lost_seconds: i64,
    /// Per-subscriber frame ring capacity; oldest frames drop on overflow
    pub max_buffered_frames: usize,
    /// Never hand a snapshot older than this to a new subscriber
    pub snapshot_max_age_ms: u64,
    /// HTTP listen address
    pub http_bind: String,
    /// Reserved for the external history sink; not consumed by this process
    pub database_url: Option<String>,
    /// Reserved for the multi-process pub/sub transport
    pub redis_url: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: String, value: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup; `from_env` layers the real
    /// environment on top of this.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            ettu_base_url: string_var(&lookup, "ETTU_BASE_URL", "https://map.ettu.ru"),
            ettu_api_key: string_var(&lookup, "ETTU_API_KEY", "111"),
            osrm_base_url: string_var(&lookup, "OSRM_BASE_URL", "https://router.project-osrm.org"),
            poll_interval_seconds: parsed_var(&lookup, "POLL_INTERVAL_SECONDS", 10)?,
            route_refresh_hours: parsed_var(&lookup, "ROUTE_REFRESH_HOURS", 6)?,
            max_snap_distance_m: parsed_var(&lookup, "MAX_SNAP_DISTANCE_M", 300.0)?,
            vehicle_ttl_seconds: parsed_var(&lookup, "VEHICLE_TTL_SECONDS", 120)?,
            signal_lost_seconds: parsed_var(&lookup, "SIGNAL_LOST_SECONDS", 60)?,
            max_buffered_frames: parsed_var(&lookup, "MAX_BUFFERED_FRAMES", 8)?,
            snapshot_max_age_ms: parsed_var(&lookup, "SNAPSHOT_MAX_AGE_MS", 20_000)?,
            http_bind: string_var(&lookup, "HTTP_BIND", "0.0.0.0:8000"),
            database_url: lookup("DATABASE_URL").filter(|v| !v.is_empty()),
            redis_url: lookup("REDIS_URL").filter(|v| !v.is_empty()),
        })
    }

    /// Log warnings for values that work but deserve operator attention.
    pub fn validate(&self) {
        if !self.ettu_base_url.starts_with("https://") {
            warn!(url = %self.ettu_base_url, "source API URL does not use HTTPS");
        }
        if self.poll_interval_seconds < 5 {
            warn!(
                seconds = self.poll_interval_seconds,
                "poll interval below 5s may overload the source API"
            );
        }
        if self.vehicle_ttl_seconds < self.signal_lost_seconds {
            warn!(
                ttl = self.vehicle_ttl_seconds,
                signal_lost = self.signal_lost_seconds,
                "vehicle TTL shorter than the signal-lost threshold; vehicles will vanish before being flagged stale"
            );
        }
        if self.database_url.is_some() {
            warn!("DATABASE_URL is set but the history sink runs out of process; value is ignored here");
        }
        if self.redis_url.is_some() {
            warn!("REDIS_URL is set but this instance broadcasts in-process only");
        }
    }
}

fn string_var<F>(lookup: &F, name: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parsed_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name).filter(|v| !v.is_empty()) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            value: raw,
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_nothing_set() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config.ettu_base_url, "https://map.ettu.ru");
        assert_eq!(config.ettu_api_key, "111");
        assert_eq!(config.osrm_base_url, "https://router.project-osrm.org");
        assert_eq!(config.poll_interval_seconds, 10);
        assert_eq!(config.route_refresh_hours, 6);
        assert_eq!(config.max_snap_distance_m, 300.0);
        assert_eq!(config.vehicle_ttl_seconds, 120);
        assert_eq!(config.signal_lost_seconds, 60);
        assert_eq!(config.max_buffered_frames, 8);
        assert_eq!(config.snapshot_max_age_ms, 20_000);
        assert_eq!(config.http_bind, "0.0.0.0:8000");
        assert!(config.database_url.is_none());
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = Config::from_lookup(|name| match name {
            "POLL_INTERVAL_SECONDS" => Some("30".to_string()),
            "MAX_SNAP_DISTANCE_M" => Some("150.5".to_string()),
            "ETTU_BASE_URL" => Some("http://localhost:9000".to_string()),
            "REDIS_URL" => Some("redis://localhost:6379/0".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.poll_interval_seconds, 30);
        assert_eq!(config.max_snap_distance_m, 150.5);
        assert_eq!(config.ettu_base_url, "http://localhost:9000");
        assert_eq!(config.redis_url.as_deref(), Some("redis://localhost:6379/0"));
    }

    #[test]
    fn empty_values_fall_back_to_defaults() {
        let config = Config::from_lookup(|_| Some(String::new())).unwrap();
        assert_eq!(config.poll_interval_seconds, 10);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn malformed_number_is_an_error() {
        let result = Config::from_lookup(|name| {
            (name == "VEHICLE_TTL_SECONDS").then(|| "two minutes".to_string())
        });
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref name, .. }) if name == "VEHICLE_TTL_SECONDS"
        ));
    }
}
