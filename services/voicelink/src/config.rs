use secrecy::SecretString;
use std::{net::SocketAddr, str::FromStr, time::Duration};
use tracing::Level;
use voicelink_core::{
    AudioFormat, SessionConfig,
    audio_utils::{DEFAULT_FRAME_SIZE, DEFAULT_SAMPLE_RATE},
};

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub endpoint: String,
    pub shared_secret: SecretString,
    pub format: AudioFormat,
    pub connect_timeout: Duration,
    pub bind_address: SocketAddr,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let endpoint = std::env::var("VOICELINK_ENDPOINT")
            .unwrap_or_else(|_| "ws://localhost:8000/ws".to_string());

        let shared_secret = std::env::var("VOICELINK_SHARED_SECRET")
            .ok()
            .filter(|secret| !secret.is_empty())
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingVar("VOICELINK_SHARED_SECRET".to_string()))?;

        let sample_rate: u32 = positive_var("SAMPLE_RATE", DEFAULT_SAMPLE_RATE)?;
        let frame_size: usize = positive_var("FRAME_SIZE", DEFAULT_FRAME_SIZE)?;
        let connect_timeout_ms: u64 = positive_var("CONNECT_TIMEOUT_MS", 5000)?;

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            endpoint,
            shared_secret,
            format: AudioFormat::new(sample_rate, frame_size),
            connect_timeout: Duration::from_millis(connect_timeout_ms),
            bind_address,
            log_level,
        })
    }

    /// The settings the session controller needs to open a session.
    pub fn session_config(&self) -> SessionConfig {
        let mut session = SessionConfig::new(self.endpoint.clone(), self.shared_secret.clone());
        session.format = self.format;
        session.connect_timeout = self.connect_timeout;
        session
    }
}

/// Reads a numeric variable that must be greater than zero.
fn positive_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let Ok(raw) = std::env::var(name) else {
        return Ok(default);
    };
    let value = raw
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))?;
    if value <= T::default() {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("'{}' must be greater than zero", raw),
        ));
    }
    Ok(value)
}
