//! Configuration
//!
//! - [`LoaderSettings`]: runtime settings shared by all loads (TOML)
//! - [`tracks`]: persisted track/source configuration (XML)

pub mod tracks;
pub mod xml;

pub use tracks::{read_tracks, read_tracks_file, write_tracks, write_tracks_file};

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Errors raised while reading or writing configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("XML error: {0}")]
    Xml(String),
    #[error("Missing attribute '{attribute}' on <{element}>")]
    MissingAttribute { element: String, attribute: String },
    #[error("Missing element <{child}> in <{element}>")]
    MissingElement { element: String, child: String },
    #[error("Invalid value '{value}' for {field}: {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
    #[error("Unknown data source protocol: {0}")]
    UnknownProtocol(String),
    #[error("Invalid track configuration: {0}")]
    InvalidTrack(String),
    #[error("TOML error: {0}")]
    Toml(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, value: impl Into<String>, reason: impl ToString) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            value: value.into(),
            reason: reason.to_string(),
        }
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_max_redirects() -> usize {
    5
}

fn default_cancel_check_interval() -> usize {
    1000
}

fn default_user_agent() -> String {
    format!("genomic-data-sdk/{}", env!("CARGO_PKG_VERSION"))
}

/// Settings shared by every load call
///
/// # Example
///
/// ```rust
/// use genomic_data_sdk::config::LoaderSettings;
///
/// let settings = LoaderSettings::from_toml_str("http_timeout_secs = 10").unwrap();
/// assert_eq!(settings.http_timeout_secs, 10);
/// assert_eq!(settings.max_redirects, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderSettings {
    /// Timeout for network requests
    #[serde(default = "default_timeout")]
    pub http_timeout_secs: u64,
    /// Redirect hops followed before giving up
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    /// Delay applied to sources that declare none
    #[serde(default)]
    pub default_delay_ms: u64,
    /// Records processed between two cancellation checks
    #[serde(default = "default_cancel_check_interval")]
    pub cancel_check_interval: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            http_timeout_secs: default_timeout(),
            max_redirects: default_max_redirects(),
            default_delay_ms: 0,
            cancel_check_interval: default_cancel_check_interval(),
            user_agent: default_user_agent(),
        }
    }
}

impl LoaderSettings {
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.http_timeout_secs = seconds;
        self
    }

    pub fn with_max_redirects(mut self, hops: usize) -> Self {
        self.max_redirects = hops;
        self
    }

    pub fn with_default_delay(mut self, delay_ms: u64) -> Self {
        self.default_delay_ms = delay_ms;
        self
    }

    pub fn with_cancel_check_interval(mut self, records: usize) -> Self {
        self.cancel_check_interval = records.max(1);
        self
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.http_timeout_secs)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let mut settings: LoaderSettings =
            toml::from_str(text).map_err(|e| ConfigError::Toml(e.to_string()))?;
        settings.cancel_check_interval = settings.cancel_check_interval.max(1);
        Ok(settings)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Toml(e.to_string()))
    }
}
