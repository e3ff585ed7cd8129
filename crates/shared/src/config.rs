use serde::Deserialize;
use std::env;
use std::str::FromStr;
use thiserror::Error;

const DEFAULT_DEVICE_NAME: &str = "locator-device";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub transport: TransportConfig,
    pub ranging: RangingConfig,
    pub coordinator: CoordinatorConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Name advertised to nearby peers
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// TCP port for incoming links (0 lets the OS choose)
    pub listen_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RangingConfig {
    /// Whether the simulated backend reports ranging hardware
    pub supported: bool,
    /// Period between simulated measurement updates in milliseconds (default: 500)
    pub update_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    /// Transitions buffered per snapshot subscriber before it lags (default: 64)
    pub snapshot_buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Error, Debug)]
#[error("Unknown log format '{0}' (expected 'json' or 'pretty')")]
pub struct UnknownLogFormat(String);

impl FromStr for LogFormat {
    type Err = UnknownLogFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(UnknownLogFormat(other.to_string())),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let display_name = lookup("LOCATOR_DEVICE_NAME")
            .or_else(|| lookup("HOSTNAME"))
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string());

        Ok(Config {
            device: DeviceConfig { display_name },
            transport: TransportConfig {
                listen_port: var("LOCATOR_LISTEN_PORT", "0").parse()?,
            },
            ranging: RangingConfig {
                supported: var("LOCATOR_RANGING_SUPPORTED", "true").parse()?,
                update_interval_ms: var("LOCATOR_RANGING_INTERVAL_MS", "500").parse()?,
            },
            coordinator: CoordinatorConfig {
                snapshot_buffer: var("LOCATOR_SNAPSHOT_BUFFER", "64").parse()?,
            },
            logging: LoggingConfig {
                format: var("LOCATOR_LOG_FORMAT", "pretty").parse()?,
            },
        })
    }
}
