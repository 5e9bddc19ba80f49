use crate::engine::{
    BridgeSettings, DEFAULT_FEED_INTERVAL, DEFAULT_HORIZON_DAYS, DEFAULT_POLL_INTERVAL,
    DEFAULT_RETRY_INTERVAL, DEFAULT_SENSOR_INTERVAL,
};
use crate::feed::adafruit;
use crate::sensor::{DEFAULT_BAUD_RATE, DEFAULT_DEVICE_DIR, DEFAULT_PORT_PATTERN};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";
pub const DEFAULT_FORECAST_URL: &str = "http://localhost:5000";
pub const DEFAULT_FORECAST_INTERVAL_MINUTES: u32 = 1;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub app: Option<AppSection>,
    #[serde(default)]
    pub logging: Option<LoggingSection>,
    #[serde(default)]
    pub forecast: Option<ForecastSection>,
    #[serde(default)]
    pub sensors: Option<SensorsSection>,
    #[serde(default)]
    pub cadence: Option<CadenceSection>,
    #[serde(default)]
    pub feed: Option<FeedSection>,
    #[serde(default)]
    pub server: Option<ServerSection>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppSection {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSection {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ForecastSection {
    pub base_url: Option<String>,
    /// Days of forecast requested at bring-up (default: 7)
    pub horizon_days: Option<u32>,
    /// Spacing of forecast rows in minutes (default: 1)
    pub interval_minutes: Option<u32>,
    pub request_timeout_secs: Option<u64>,
    /// Wait between failed forecast requests (default: 30)
    pub retry_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SensorsSection {
    /// Case-insensitive substring matched against device names (default: "Arduino")
    pub port_pattern: Option<String>,
    pub device_dir: Option<PathBuf>,
    pub baud_rate: Option<u32>,
    /// Wait between discovery scans that found nothing (default: 30)
    pub discovery_retry_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CadenceSection {
    pub sensor_update_ms: Option<u64>,
    pub feed_update_secs: Option<u64>,
    /// Pause between loop iterations; 0 busy-polls (default: 5)
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FeedSection {
    pub base_url: Option<String>,
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServerSection {
    /// Status API port; the API is off when unset
    pub port: Option<u16>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Load `config/config.toml`, falling back to built-in defaults when the file
/// does not exist.
pub fn load_default() -> Result<Config, ConfigError> {
    match load_from_path(DEFAULT_CONFIG_PATH) {
        Err(ConfigError::Read(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            Ok(Config::default())
        }
        other => other,
    }
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.horizon_days() == 0 {
            return Err(ConfigError::Invalid(
                "forecast.horizon_days must be at least 1".to_string(),
            ));
        }
        if self.forecast_interval_minutes() == 0 {
            return Err(ConfigError::Invalid(
                "forecast.interval_minutes must be at least 1".to_string(),
            ));
        }
        if self.baud_rate() == 0 {
            return Err(ConfigError::Invalid(
                "sensors.baud_rate must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn app_name(&self) -> &str {
        self.app
            .as_ref()
            .map(|app| app.name.as_str())
            .unwrap_or(env!("CARGO_PKG_NAME"))
    }

    pub fn log_level(&self) -> &str {
        self.logging
            .as_ref()
            .map(|logging| logging.level.as_str())
            .unwrap_or(DEFAULT_LOG_LEVEL)
    }

    pub fn forecast_url(&self) -> &str {
        self.forecast
            .as_ref()
            .and_then(|f| f.base_url.as_deref())
            .unwrap_or(DEFAULT_FORECAST_URL)
    }

    pub fn horizon_days(&self) -> u32 {
        self.forecast
            .as_ref()
            .and_then(|f| f.horizon_days)
            .unwrap_or(DEFAULT_HORIZON_DAYS)
    }

    pub fn forecast_interval_minutes(&self) -> u32 {
        self.forecast
            .as_ref()
            .and_then(|f| f.interval_minutes)
            .unwrap_or(DEFAULT_FORECAST_INTERVAL_MINUTES)
    }

    pub fn forecast_timeout(&self) -> Duration {
        let secs = self
            .forecast
            .as_ref()
            .and_then(|f| f.request_timeout_secs)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
        Duration::from_secs(secs)
    }

    pub fn forecast_retry(&self) -> Duration {
        self.forecast
            .as_ref()
            .and_then(|f| f.retry_interval_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETRY_INTERVAL)
    }

    pub fn port_pattern(&self) -> &str {
        self.sensors
            .as_ref()
            .and_then(|s| s.port_pattern.as_deref())
            .unwrap_or(DEFAULT_PORT_PATTERN)
    }

    pub fn device_dir(&self) -> &Path {
        self.sensors
            .as_ref()
            .and_then(|s| s.device_dir.as_deref())
            .unwrap_or(Path::new(DEFAULT_DEVICE_DIR))
    }

    pub fn baud_rate(&self) -> u32 {
        self.sensors
            .as_ref()
            .and_then(|s| s.baud_rate)
            .unwrap_or(DEFAULT_BAUD_RATE)
    }

    pub fn discovery_retry(&self) -> Duration {
        self.sensors
            .as_ref()
            .and_then(|s| s.discovery_retry_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETRY_INTERVAL)
    }

    pub fn sensor_interval(&self) -> Duration {
        self.cadence
            .as_ref()
            .and_then(|c| c.sensor_update_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SENSOR_INTERVAL)
    }

    pub fn feed_interval(&self) -> Duration {
        self.cadence
            .as_ref()
            .and_then(|c| c.feed_update_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_FEED_INTERVAL)
    }

    pub fn poll_interval(&self) -> Duration {
        self.cadence
            .as_ref()
            .and_then(|c| c.poll_interval_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_POLL_INTERVAL)
    }

    pub fn feed_url(&self) -> &str {
        self.feed
            .as_ref()
            .and_then(|f| f.base_url.as_deref())
            .unwrap_or(adafruit::DEFAULT_BASE_URL)
    }

    pub fn feed_timeout(&self) -> Duration {
        let secs = self
            .feed
            .as_ref()
            .and_then(|f| f.request_timeout_secs)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
        Duration::from_secs(secs)
    }

    /// Returns the status API port, or None when the API is disabled.
    pub fn server_port(&self) -> Option<u16> {
        self.server.as_ref().and_then(|s| s.port)
    }

    /// Engine settings for `feed_key` with every configured override applied.
    pub fn bridge_settings(&self, feed_key: &str) -> BridgeSettings {
        BridgeSettings {
            feed_key: feed_key.to_string(),
            port_pattern: self.port_pattern().to_string(),
            horizon_days: self.horizon_days(),
            forecast_retry: self.forecast_retry(),
            discovery_retry: self.discovery_retry(),
            sensor_interval: self.sensor_interval(),
            feed_interval: self.feed_interval(),
            poll_interval: self.poll_interval(),
        }
    }
}
