use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

// ─── Service configuration ───────────────────────────────────────

/// Deployment settings shared by the server, producers and monitors.
/// Every field has a default, so an empty JSON object is a valid file.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Name the channel endpoint is published under
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// POSIX shared-memory object holding the summary
    #[serde(default = "default_region_name")]
    pub region_name: String,

    /// Directory that holds `<service_name>.sock`
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,

    /// Seconds between publish ticks
    #[serde(default = "default_publish_period")]
    pub publish_period_secs: u64,
}

fn default_service_name() -> String {
    "TempServer".into()
}
fn default_region_name() -> String {
    "/temp_stats_shm".into()
}
fn default_socket_dir() -> PathBuf {
    std::env::temp_dir()
}
fn default_publish_period() -> u64 {
    5
}

/// Send interval a producer uses when none is given (seconds).
pub const DEFAULT_SEND_INTERVAL_SECS: f64 = 1.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            region_name: default_region_name(),
            socket_dir: default_socket_dir(),
            publish_period_secs: default_publish_period(),
        }
    }
}

impl ServiceConfig {
    /// Defaults, overridden by the JSON file at `path` when one is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() || self.service_name.contains('/') {
            return Err(ConfigError::Invalid(
                "service_name must be a non-empty name without '/'".into(),
            ));
        }
        if self.region_name.is_empty() || self.region_name.contains('\0') {
            return Err(ConfigError::Invalid(
                "region_name must be non-empty".into(),
            ));
        }
        if self.publish_period_secs == 0 {
            return Err(ConfigError::Invalid(
                "publish_period_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Where the server listens and producers connect.
    pub fn socket_path(&self) -> PathBuf {
        self.socket_dir.join(format!("{}.sock", self.service_name))
    }

    pub fn publish_period(&self) -> Duration {
        Duration::from_secs(self.publish_period_secs)
    }
}

/// Producer send interval from fractional seconds.
pub fn send_interval(secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|_| {
        ConfigError::Invalid(format!(
            "send interval must be a finite, non-negative number of seconds (got {secs})"
        ))
    })
}
