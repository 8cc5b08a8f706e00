//! Environment-backed runtime configuration for `kiosk-console`.

use std::{env, error::Error, fmt, path::PathBuf, str::FromStr};

use kiosk_core::SessionConfig;

const DEFAULT_CACHE_PATH: &str = "./.kiosk-console/slide-order.json";

/// Runtime configuration used by the console.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsoleConfig {
    /// Base URL of the kiosk API.
    pub api_base_url: String,
    /// Bearer token for the kiosk API.
    pub api_token: Option<String>,
    /// JSON file backing the position cache.
    pub cache_path: PathBuf,
    /// Session tuning, including the scoreboard to open.
    pub session: SessionConfig,
}

impl ConsoleConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let api_base_url = required_trimmed_env("KIOSK_API_BASE_URL", &mut lookup)?;
        let scoreboard_id = required_trimmed_env("KIOSK_SCOREBOARD_ID", &mut lookup)?;
        let api_token = optional_trimmed_env("KIOSK_API_TOKEN", &mut lookup);
        let cache_path = optional_trimmed_env("KIOSK_CACHE_PATH", &mut lookup)
            .map_or_else(|| PathBuf::from(DEFAULT_CACHE_PATH), PathBuf::from);

        let mut session = SessionConfig::new(scoreboard_id);
        session.debounce_ms =
            parse_with_default("KIOSK_DEBOUNCE_MS", session.debounce_ms, &mut lookup)?;
        session.transitional_threshold = parse_with_default(
            "KIOSK_TRANSITIONAL_THRESHOLD",
            session.transitional_threshold,
            &mut lookup,
        )?;
        session.max_slides =
            parse_with_default("KIOSK_MAX_SLIDES", session.max_slides, &mut lookup)?;
        session.max_upload_bytes = parse_with_default(
            "KIOSK_MAX_UPLOAD_BYTES",
            session.max_upload_bytes,
            &mut lookup,
        )?;

        if session.max_slides == 0 {
            return Err(ConfigError::InvalidValue {
                key: "KIOSK_MAX_SLIDES",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if session.transitional_threshold <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "KIOSK_TRANSITIONAL_THRESHOLD",
                value: session.transitional_threshold.to_string(),
                reason: "must be greater than 0".to_owned(),
            });
        }

        Ok(Self {
            api_base_url,
            api_token,
            cache_path,
            session,
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    /// A required environment variable is unset or blank.
    Missing { key: &'static str },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
            Self::Missing { key } => write!(f, "{key} must be set"),
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn required_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Result<String, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    optional_trimmed_env(key, lookup).ok_or(ConfigError::Missing { key })
}

fn parse_with_default<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        reason: err.to_string(),
        value,
    })
}
