use crate::error::ConfigError;
use std::{env, fmt::Display, str::FromStr, time::Duration};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    /// How long an unreferenced channel lingers before it is torn down.
    pub fn teardown_delay(&self) -> Duration {
        match self {
            Environment::Production => Duration::ZERO,
            Environment::Development => Duration::from_millis(500),
        }
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!("expected development or production, got {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub realtime_url: String,
    pub realtime_key: String,
    pub api_url: String,
    pub environment: Environment,
    pub subscribe_timeout: Duration,
    pub polling_interval: Duration,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            port: try_load("PLICO_PORT", "8080")?,
            realtime_url: require("PLICO_REALTIME_URL")?,
            realtime_key: require("PLICO_REALTIME_KEY")?,
            api_url: try_load("PLICO_API_URL", "http://localhost:3000")?,
            environment: try_load("PLICO_ENV", "development")?,
            subscribe_timeout: Duration::from_millis(try_load("PLICO_SUBSCRIBE_TIMEOUT_MS", "10000")?),
            polling_interval: Duration::from_millis(try_load("PLICO_POLL_INTERVAL_MS", "3000")?),
        })
    }
}

fn require(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| {
        warn!("Environment variable {key} not found");
        ConfigError::Missing(key.to_string())
    })
}

fn try_load<T: FromStr>(key: &str, default: &str) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    env::var(key)
        .unwrap_or_else(|_| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e: T::Err| {
            warn!("Invalid {key} value: {e}");
            ConfigError::Invalid {
                key: key.to_string(),
                message: e.to_string(),
            }
        })
}
