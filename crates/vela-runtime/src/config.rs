#![forbid(unsafe_code)]

//! Program configuration.
//!
//! [`ProgramConfig`] carries the startup flags handed to the application's
//! flags decoder and the tunables of the built-in managers. It can be built
//! in code, parsed from JSON (or TOML with the `policy-config` feature),
//! and overlaid with environment variables:
//!
//! | Variable               | Field            |
//! |------------------------|------------------|
//! | `VELA_FLAGS`           | `flags` (JSON)   |
//! | `VELA_HTTP_TIMEOUT_MS` | `http_timeout`   |
//! | `VELA_FRAME_MS`        | `animation_frame`|
//!
//! Durations are written in milliseconds in every external format.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Environment variable holding the flags as JSON.
pub const ENV_FLAGS: &str = "VELA_FLAGS";
pub const ENV_HTTP_TIMEOUT_MS: &str = "VELA_HTTP_TIMEOUT_MS";
pub const ENV_FRAME_MS: &str = "VELA_FRAME_MS";

/// Failure to load or validate a [`ProgramConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "policy-config")]
    #[error("invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported config format `{0}`")]
    UnsupportedFormat(String),
    #[error("invalid value for {var}: {reason}")]
    Env { var: &'static str, reason: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn optional_millis<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
}

/// Startup configuration of a [`Program`](crate::program::Program).
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProgramConfig {
    /// Value decoded by the application's flags decoder.
    pub flags: Value,
    /// Default timeout for HTTP requests that do not set one.
    #[serde(rename = "http_timeout_ms", deserialize_with = "optional_millis")]
    pub http_timeout: Option<Duration>,
    /// Frame interval hint for hosts that pace animation frames themselves.
    #[serde(rename = "animation_frame_ms", deserialize_with = "millis")]
    pub animation_frame: Duration,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            flags: Value::Null,
            http_timeout: None,
            animation_frame: Duration::from_millis(16),
        }
    }
}

impl ProgramConfig {
    #[must_use]
    pub fn with_flags(mut self, flags: Value) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_animation_frame(mut self, interval: Duration) -> Self {
        self.animation_frame = interval;
        self
    }

    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    #[cfg(feature = "policy-config")]
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json` file, or a `.toml` file with `policy-config`.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&content),
            #[cfg(feature = "policy-config")]
            Some("toml") => Self::from_toml_str(&content),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or_default().to_owned(),
            )),
        }
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.merge_with_env()?;
        Ok(config)
    }

    /// Overlay the `VELA_*` variables of the process environment.
    pub fn merge_with_env(&mut self) -> Result<(), ConfigError> {
        self.merge_with_lookup(|var| std::env::var(var).ok())
    }

    /// Overlay variables resolved by `lookup` instead of the environment.
    pub fn merge_with_lookup(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(raw) = lookup(ENV_FLAGS) {
            self.flags = serde_json::from_str(&raw).map_err(|err| ConfigError::Env {
                var: ENV_FLAGS,
                reason: err.to_string(),
            })?;
        }
        if let Some(raw) = lookup(ENV_HTTP_TIMEOUT_MS) {
            self.http_timeout = Some(parse_millis(ENV_HTTP_TIMEOUT_MS, &raw)?);
        }
        if let Some(raw) = lookup(ENV_FRAME_MS) {
            self.animation_frame = parse_millis(ENV_FRAME_MS, &raw)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid("http timeout must be positive".into()));
        }
        if self.animation_frame.is_zero() {
            return Err(ConfigError::Invalid("animation frame interval must be positive".into()));
        }
        Ok(())
    }
}

fn parse_millis(var: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|err| ConfigError::Env {
            var,
            reason: err.to_string(),
        })
}
