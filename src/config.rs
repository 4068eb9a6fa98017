//! Engine configuration.
//!
//! Construction-time settings for the backend and the reaper, loadable from
//! a TOML file with every field defaulted. The embedding process is expected
//! to merge its own flag/env handling on top; this crate only defines the
//! schema and the file loader.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Read {
        /// Path that was attempted.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema.
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        /// Path that was attempted.
        path: String,
        /// The underlying TOML error.
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Namespace all workloads are created in.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Init-container image, reserved for setup steps that need to run
    /// before the workload container. Carried as configuration surface;
    /// no engine code path exercises it yet.
    #[serde(default)]
    pub init_image: Option<String>,

    /// Budget applied to every cluster-API call, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Interval between readiness polls after a start, in milliseconds.
    #[serde(default = "default_ready_poll_interval")]
    pub ready_poll_interval_ms: u64,

    /// Maximum total time a readiness watch waits, in seconds.
    #[serde(default = "default_ready_deadline")]
    pub ready_deadline_secs: u64,

    /// Expiry reaper settings.
    #[serde(default)]
    pub reaper: ReaperConfig,
}

/// Settings for the expiry reaper.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReaperConfig {
    /// Containers idle longer than this many seconds are reaped.
    #[serde(default = "default_keep_max")]
    pub keep_max_secs: u64,

    /// Seconds between sweeps.
    #[serde(default = "default_reap_interval")]
    pub interval_secs: u64,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_ready_poll_interval() -> u64 {
    500
}

fn default_ready_deadline() -> u64 {
    120
}

fn default_keep_max() -> u64 {
    900
}

fn default_reap_interval() -> u64 {
    60
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            namespace: default_namespace(),
            init_image: None,
            request_timeout_secs: default_request_timeout(),
            ready_poll_interval_ms: default_ready_poll_interval(),
            ready_deadline_secs: default_ready_deadline(),
            reaper: ReaperConfig::default(),
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        ReaperConfig {
            keep_max_secs: default_keep_max(),
            interval_secs: default_reap_interval(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Per-call cluster request budget.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Interval between readiness polls.
    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    /// Maximum total readiness wait.
    pub fn ready_deadline(&self) -> Duration {
        Duration::from_secs(self.ready_deadline_secs)
    }
}

impl ReaperConfig {
    /// Maximum idle time before a container is reaped.
    pub fn keep_max(&self) -> Duration {
        Duration::from_secs(self.keep_max_secs)
    }

    /// Time between sweeps.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}
