//! Runtime-facing data types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stevedore_common::duration::as_human;
use stevedore_common::{Labels, StevedoreError};

/// Health check declaration.
///
/// Timings are normalized to [`Duration`] when deserialized, whatever unit
/// the declaration used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    /// Probe command. A leading `CMD-SHELL` runs the rest through a shell.
    pub command: Vec<String>,
    /// Attempts before the container is declared unhealthy.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Per-attempt timeout.
    #[serde(default = "default_timeout", with = "as_human")]
    pub timeout: Duration,
    /// Delay between attempts.
    #[serde(default = "default_interval", with = "as_human")]
    pub interval: Duration,
    /// Grace period before the first attempt.
    #[serde(default, with = "as_human")]
    pub start_period: Duration,
}

const fn default_retries() -> u32 {
    3
}

const fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_interval() -> Duration {
    Duration::from_secs(2)
}

impl HealthCheckSpec {
    /// Upper bound on how long a full check sequence can take.
    #[must_use]
    pub fn budget(&self) -> Duration {
        self.start_period + (self.interval + self.timeout) * self.retries
    }
}

/// Transport protocol of a port mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP.
    #[default]
    Tcp,
    /// UDP.
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// A host port published for a container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port on the host.
    pub host: u16,
    /// Port inside the container.
    pub container: u16,
    /// Protocol.
    #[serde(default)]
    pub protocol: Protocol,
}

impl PortMapping {
    /// TCP mapping.
    #[must_use]
    pub const fn tcp(host: u16, container: u16) -> Self {
        Self {
            host,
            container,
            protocol: Protocol::Tcp,
        }
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.container, self.protocol)
    }
}

impl FromStr for PortMapping {
    type Err = StevedoreError;

    /// Parse `host:container[/proto]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StevedoreError::validation(format!("invalid port mapping: {s:?}"));
        let (ports, protocol) = match s.split_once('/') {
            Some((ports, "tcp")) => (ports, Protocol::Tcp),
            Some((ports, "udp")) => (ports, Protocol::Udp),
            Some(_) => return Err(invalid()),
            None => (s, Protocol::Tcp),
        };
        let (host, container) = ports.split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            host: host.parse().map_err(|_| invalid())?,
            container: container.parse().map_err(|_| invalid())?,
            protocol,
        })
    }
}

/// A named volume mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeBinding {
    /// Volume name.
    pub name: String,
    /// Mount point inside the container.
    pub target: String,
    /// Mount read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Command override; empty keeps the image default.
    #[serde(default)]
    pub command: Vec<String>,
    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Published ports.
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    /// Mounted volumes.
    #[serde(default)]
    pub volumes: Vec<VolumeBinding>,
    /// Labels.
    #[serde(default)]
    pub labels: Labels,
    /// Network to attach to.
    #[serde(default)]
    pub network: Option<String>,
    /// Health check.
    #[serde(default)]
    pub healthcheck: Option<HealthCheckSpec>,
}

/// Health as reported by the runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No health check configured (or container not running).
    #[default]
    None,
    /// Checks have not passed yet.
    Starting,
    /// Last check passed.
    Healthy,
    /// Retries exhausted.
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        })
    }
}

impl FromStr for HealthStatus {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "none" => Ok(Self::None),
            "starting" => Ok(Self::Starting),
            "healthy" => Ok(Self::Healthy),
            "unhealthy" => Ok(Self::Unhealthy),
            other => Err(StevedoreError::validation(format!(
                "unknown health status: {other}"
            ))),
        }
    }
}

/// Point-in-time observation of a container.
///
/// Never persisted: always re-derived from the runtime or corrected by the
/// event monitor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeState {
    /// Whether the container exists at all.
    pub exists: bool,
    /// Whether it is running.
    pub running: bool,
    /// Health status.
    pub health: HealthStatus,
    /// Published ports.
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    /// Container id.
    #[serde(default)]
    pub container_id: Option<String>,
    /// Container name.
    #[serde(default)]
    pub container_name: Option<String>,
    /// Image the container was created from.
    #[serde(default)]
    pub image: Option<String>,
    /// Container labels.
    #[serde(default)]
    pub labels: Labels,
}

impl RuntimeState {
    /// State of a container that does not exist.
    #[must_use]
    pub fn absent() -> Self {
        Self::default()
    }
}

/// Pull progress for one layer.
///
/// `current` and `total` are bytes when the backend reports them and layer
/// steps otherwise; either way `current == total` means the layer is done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullProgress {
    /// Layer identifier.
    pub layer_id: String,
    /// Units done.
    pub current: u64,
    /// Units in total.
    pub total: u64,
}

/// Container actions the monitor cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    /// Container started.
    Start,
    /// Container stopped.
    Stop,
    /// Main process exited.
    Die,
    /// Container received a signal.
    Kill,
    /// Container paused.
    Pause,
    /// Container unpaused.
    Unpause,
    /// Container restarted.
    Restart,
    /// Health status changed.
    HealthStatus(HealthStatus),
}

impl EventAction {
    /// Classify a raw runtime action string.
    ///
    /// Actions outside the set above (`create`, `exec_start`, ...) yield
    /// `None`.
    #[must_use]
    pub fn classify(action: &str) -> Option<Self> {
        if let Some(status) = action.strip_prefix("health_status") {
            let status = status.trim_start_matches(':').trim();
            return status.parse().ok().map(Self::HealthStatus);
        }
        Some(match action {
            "start" => Self::Start,
            "stop" => Self::Stop,
            "die" => Self::Die,
            "kill" => Self::Kill,
            "pause" => Self::Pause,
            "unpause" => Self::Unpause,
            "restart" => Self::Restart,
            _ => return None,
        })
    }

    /// Whether the container is running after this action.
    #[must_use]
    pub const fn implies_running(self) -> Option<bool> {
        match self {
            Self::Start | Self::Restart | Self::Unpause => Some(true),
            Self::Stop | Self::Die => Some(false),
            Self::Kill | Self::Pause | Self::HealthStatus(_) => None,
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("start"),
            Self::Stop => f.write_str("stop"),
            Self::Die => f.write_str("die"),
            Self::Kill => f.write_str("kill"),
            Self::Pause => f.write_str("pause"),
            Self::Unpause => f.write_str("unpause"),
            Self::Restart => f.write_str("restart"),
            Self::HealthStatus(status) => write!(f, "health_status: {status}"),
        }
    }
}

/// An unclassified notification from the runtime's event feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Container id.
    pub container_id: String,
    /// Action as reported by the runtime.
    pub action: String,
    /// When the runtime emitted it.
    pub timestamp: DateTime<Utc>,
    /// Labels attached to the event, if the runtime includes them.
    #[serde(default)]
    pub labels: Labels,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_actions() {
        assert_eq!(EventAction::classify("start"), Some(EventAction::Start));
        assert_eq!(EventAction::classify("die"), Some(EventAction::Die));
        assert_eq!(
            EventAction::classify("health_status: healthy"),
            Some(EventAction::HealthStatus(HealthStatus::Healthy))
        );
        assert_eq!(EventAction::classify("create"), None);
        assert_eq!(EventAction::classify("exec_start: sh -c true"), None);
    }

    #[test]
    fn action_display_matches_runtime_format() {
        let action = EventAction::HealthStatus(HealthStatus::Unhealthy);
        assert_eq!(action.to_string(), "health_status: unhealthy");
        assert_eq!(EventAction::classify(&action.to_string()), Some(action));
    }

    #[test]
    fn parse_port_mappings() {
        assert_eq!("8080:80".parse::<PortMapping>().unwrap(), PortMapping::tcp(8080, 80));
        let udp: PortMapping = "1025:1025/udp".parse().unwrap();
        assert_eq!(udp.protocol, Protocol::Udp);
        assert!("80".parse::<PortMapping>().is_err());
        assert!("80:80/sctp".parse::<PortMapping>().is_err());
        assert!("99999:80".parse::<PortMapping>().is_err());
    }

    #[test]
    fn health_check_defaults_and_units() {
        let spec: HealthCheckSpec = serde_json::from_str(
            r#"{"command": ["CMD", "redis-cli", "ping"], "interval": "1s", "timeout": 3000000000}"#,
        )
        .unwrap();
        assert_eq!(spec.retries, 3);
        assert_eq!(spec.interval, Duration::from_secs(1));
        assert_eq!(spec.timeout, Duration::from_secs(3));
        assert_eq!(spec.start_period, Duration::ZERO);
        assert_eq!(spec.budget(), Duration::from_secs(12));
    }
}
