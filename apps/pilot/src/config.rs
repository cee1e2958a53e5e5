use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::credentials::CredentialConfig;
use crate::fusion::{FusionConfig, MAX_SENSITIVITY, MIN_SENSITIVITY};
use crate::session::{SessionConfig, DEFAULT_EVENT_QUEUE};
use crate::transfer::TransferConfig;

/// Longest accepted keepalive period.
pub const MAX_HEARTBEAT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid endpoint {url:?}: {reason}")]
    InvalidEndpoint { url: String, reason: String },
    #[error("endpoint {0} must use wss://")]
    InsecureEndpoint(String),
    #[error("username cannot be empty")]
    EmptyUsername,
    #[error("invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("failed to read fusion config {path:?}: {source}")]
    FusionFile { path: PathBuf, source: io::Error },
    #[error("failed to parse fusion config {path:?}: {reason}")]
    FusionParse { path: PathBuf, reason: String },
}

/// Fully resolved settings for one pilot process.
#[derive(Debug, Clone)]
pub struct PilotConfig {
    pub endpoint: Url,
    pub username: String,
    pub credentials: CredentialConfig,
    pub heartbeat: Duration,
    pub connect_timeout: Duration,
    pub tick_rate: u32,
    pub data_dir: PathBuf,
    pub sensitivity: f32,
    pub discrete: bool,
    pub transfer: TransferConfig,
    pub http_timeout: Duration,
    pub fusion: FusionConfig,
}

impl PilotConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.scheme() != "wss" {
            return Err(ConfigError::InsecureEndpoint(self.endpoint.to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(ConfigError::EmptyUsername);
        }
        if self.tick_rate == 0 {
            return Err(invalid("tick_rate", "must be at least 1 Hz"));
        }
        if self.heartbeat.is_zero() {
            return Err(invalid("heartbeat", "must be positive"));
        }
        if self.heartbeat > MAX_HEARTBEAT {
            return Err(invalid(
                "heartbeat",
                format!("must not exceed {}s", MAX_HEARTBEAT.as_secs()),
            ));
        }
        if self.transfer.retry.max_attempts == 0 {
            return Err(invalid("max_attempts", "must be at least 1"));
        }
        if self.transfer.sync_key_cap == 0 {
            return Err(invalid("sync_key_cap", "must be at least 1"));
        }
        if !(MIN_SENSITIVITY..=MAX_SENSITIVITY).contains(&self.sensitivity) {
            return Err(invalid(
                "sensitivity",
                format!("must be within {MIN_SENSITIVITY}..={MAX_SENSITIVITY}"),
            ));
        }
        self.fusion
            .validate()
            .map_err(|field| invalid("fusion", format!("{field} is out of range")))?;
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            endpoint: self.endpoint.clone(),
            label: self.username.clone(),
            heartbeat: self.heartbeat,
            connect_timeout: self.connect_timeout,
            event_queue: DEFAULT_EVENT_QUEUE,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate.max(1)))
    }
}

pub fn parse_endpoint(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim()).map_err(|err| ConfigError::InvalidEndpoint {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    if url.scheme() != "wss" {
        return Err(ConfigError::InsecureEndpoint(url.to_string()));
    }
    Ok(url)
}

/// Reads fusion tuning from a TOML file. Missing keys keep their defaults.
pub fn load_fusion_config(path: &Path) -> Result<FusionConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::FusionFile {
        path: path.to_path_buf(),
        source,
    })?;
    FusionConfig::from_toml_str(&raw).map_err(|err| ConfigError::FusionParse {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}
