use secrecy::SecretString;
use tracing::Level;
use vozia_core::config::{DEFAULT_FALLBACK_VOICE, DEFAULT_MODEL};

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Debug)]
pub struct Config {
    pub gemini_api_key: SecretString,
    pub live_url: String,
    pub model: String,
    /// Voice from the environment; the command line takes precedence.
    pub voice: Option<String>,
    pub fallback_voice: String,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let gemini_api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar("GEMINI_API_KEY".to_string()))?;

        let live_url = std::env::var("LIVE_API_URL")
            .unwrap_or_else(|_| gemini_realtime::DEFAULT_LIVE_URL.to_string());
        if !(live_url.starts_with("wss://") || live_url.starts_with("ws://")) {
            return Err(ConfigError::InvalidValue(
                "LIVE_API_URL".to_string(),
                format!("'{}' is not a ws:// or wss:// URL", live_url),
            ));
        }

        let model = std::env::var("LIVE_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let voice = std::env::var("LIVE_VOICE").ok().filter(|v| !v.is_empty());
        let fallback_voice = std::env::var("FALLBACK_VOICE")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_FALLBACK_VOICE.to_string());

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            gemini_api_key: SecretString::from(gemini_api_key),
            live_url,
            model,
            voice,
            fallback_voice,
            log_level,
        })
    }
}
