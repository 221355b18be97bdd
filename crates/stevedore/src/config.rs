//! Daemon configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stevedore_common::duration::as_human;
use stevedore_common::paths::STEVEDORE_CONFIG;
use stevedore_common::{StevedoreError, StevedorePaths, StevedoreResult};
use stevedore_runtime::Timeouts;

use crate::monitor::MonitorConfig;

/// Container runtime backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// The Docker CLI.
    #[default]
    Docker,
    /// The in-process simulation.
    Memory,
}

/// HTTP control channel settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Listen address.
    pub bind: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 7411)),
        }
    }
}

/// Deadlines for runtime calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Queries (ping, inspect, list).
    #[serde(with = "as_human")]
    pub query: Duration,
    /// Commands (start, stop, remove, volumes).
    #[serde(with = "as_human")]
    pub command: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let t = Timeouts::default();
        Self {
            query: t.query,
            command: t.command,
        }
    }
}

impl From<TimeoutConfig> for Timeouts {
    fn from(config: TimeoutConfig) -> Self {
        Self {
            query: config.query,
            command: config.command,
        }
    }
}

/// Top-level configuration, read from `stevedore.toml`.
///
/// Every field has a default so an absent or empty file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StevedoreConfig {
    /// Data directory. Defaults to `STEVEDORE_ROOT` or the platform data dir.
    pub root: Option<PathBuf>,
    /// Shared network every resource joins.
    pub network: String,
    /// Runtime backend.
    pub runtime: RuntimeKind,
    /// CLI binary used by the docker backend.
    pub docker_binary: PathBuf,
    /// YAML file overriding or extending the built-in service catalog.
    pub catalog: Option<PathBuf>,
    /// Runtime call deadlines.
    pub timeouts: TimeoutConfig,
    /// Event monitor tuning.
    pub monitor: MonitorConfig,
    /// Privileged helper used to edit the hosts file.
    pub hosts_helper: Option<PathBuf>,
    /// Control channel.
    pub http: HttpConfig,
}

impl Default for StevedoreConfig {
    fn default() -> Self {
        Self {
            root: None,
            network: "stevedore".to_string(),
            runtime: RuntimeKind::default(),
            docker_binary: PathBuf::from("docker"),
            catalog: None,
            timeouts: TimeoutConfig::default(),
            monitor: MonitorConfig::default(),
            hosts_helper: None,
            http: HttpConfig::default(),
        }
    }
}

impl StevedoreConfig {
    /// Parse from TOML.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::Config`] if the document is invalid.
    pub fn from_toml(content: &str) -> StevedoreResult<Self> {
        toml::from_str(content).map_err(|e| StevedoreError::Config {
            message: format!("Failed to parse configuration: {e}"),
        })
    }

    /// Load configuration.
    ///
    /// An explicit `path` must exist. Without one, the default location is
    /// read if present and defaults are used otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> StevedoreResult<Self> {
        let path = match path {
            Some(path) => path,
            None if STEVEDORE_CONFIG.exists() => STEVEDORE_CONFIG.as_path(),
            None => {
                tracing::debug!("No configuration file, using defaults");
                return Ok(Self::default());
            }
        };

        tracing::debug!(path = %path.display(), "Loading configuration");
        let content = std::fs::read_to_string(path).map_err(|e| StevedoreError::Config {
            message: format!("Failed to read {}: {e}", path.display()),
        })?;
        Self::from_toml(&content)
    }

    /// Filesystem layout derived from `root`.
    #[must_use]
    pub fn paths(&self) -> StevedorePaths {
        self.root
            .as_ref()
            .map_or_else(StevedorePaths::new, StevedorePaths::with_root)
    }

    /// Override the data directory.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Override the runtime backend.
    #[must_use]
    pub const fn with_runtime(mut self, runtime: RuntimeKind) -> Self {
        self.runtime = runtime;
        self
    }
}
