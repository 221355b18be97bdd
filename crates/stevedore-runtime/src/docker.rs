//! Docker backend driven through the `docker` CLI.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use stevedore_common::{Labels, StevedoreError, StevedoreResult};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::client::{ContainerRuntime, EventStream, PullStream};
use crate::types::{
    ContainerSpec, HealthStatus, PortMapping, Protocol, PullProgress, RawEvent, RuntimeState,
};

const STREAM_BUFFER: usize = 64;

/// Steps a layer goes through in `docker pull` output.
const LAYER_STEPS: u64 = 4;

/// Backend for a local Docker (or Docker-compatible) engine.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCli {
    /// Use `docker` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    /// Use a specific CLI binary (`podman` works too).
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// The CLI binary in use.
    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn command(&self, args: &[String]) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn spawn_error(&self, err: &std::io::Error) -> StevedoreError {
        StevedoreError::unavailable(format!(
            "failed to execute {}: {err}",
            self.binary.display()
        ))
    }

    /// Run a command to completion and return its stdout.
    async fn run(&self, args: Vec<String>) -> StevedoreResult<String> {
        tracing::trace!(binary = %self.binary.display(), ?args, "Running runtime command");
        let output = self
            .command(&args)
            .output()
            .await
            .map_err(|e| self.spawn_error(&e))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_error(stderr.trim()))
        }
    }

    /// Spawn a long-running command and forward each stdout line, parsed by
    /// `parse`, into a stream. The child is killed when the stream is
    /// dropped.
    fn stream_lines<T, F>(
        &self,
        args: Vec<String>,
        parse: F,
    ) -> StevedoreResult<ReceiverStream<StevedoreResult<T>>>
    where
        T: Send + 'static,
        F: Fn(&str) -> Option<StevedoreResult<T>> + Send + 'static,
    {
        let mut child = self.command(&args).spawn().map_err(|e| self.spawn_error(&e))?;
        let stdout = child.stdout.take().ok_or_else(|| StevedoreError::Internal {
            message: "child stdout not captured".to_string(),
        })?;
        let stderr = child.stderr.take();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    () = tx.closed() => return,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if let Some(item) = parse(&line)
                                && tx.send(item).await.is_err()
                            {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            let _ = tx.send(Err(StevedoreError::Io(e))).await;
                            return;
                        }
                    },
                }
            }

            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    let message = match stderr {
                        Some(stderr) => read_all(stderr).await,
                        None => String::new(),
                    };
                    tracing::debug!(%status, message = %message.trim(), "Runtime stream exited");
                    let _ = tx.send(Err(classify_error(message.trim()))).await;
                }
                Err(e) => {
                    let _ = tx.send(Err(StevedoreError::Io(e))).await;
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }
}

async fn read_all(reader: impl AsyncRead + Unpin) -> String {
    let mut out = String::new();
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        out.push_str(&line);
        out.push('\n');
    }
    out
}

/// Map CLI stderr to an error variant.
fn classify_error(stderr: &str) -> StevedoreError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("error during connect")
    {
        return StevedoreError::unavailable(stderr);
    }

    for (needle, kind) in [
        ("no such container", "Container"),
        ("no such volume", "Volume"),
        ("no such image", "Image"),
        ("network not found", "Network"),
        ("no such network", "Network"),
        ("no such object", "Object"),
    ] {
        if let Some(pos) = lower.find(needle) {
            let id = stderr[pos + needle.len()..]
                .trim_start_matches(':')
                .trim()
                .to_string();
            return StevedoreError::NotFound { kind, id };
        }
    }

    if stderr.is_empty() {
        StevedoreError::runtime("command failed without output")
    } else {
        StevedoreError::runtime(stderr)
    }
}

fn label_args(labels: &Labels) -> impl Iterator<Item = String> + '_ {
    labels
        .iter()
        .flat_map(|(k, v)| ["--label".to_string(), format!("{k}={v}")])
}

fn filter_args(filter: &Labels) -> impl Iterator<Item = String> + '_ {
    filter
        .iter()
        .flat_map(|(k, v)| ["--filter".to_string(), format!("label={k}={v}")])
}

fn strings<const N: usize>(args: [&str; N]) -> Vec<String> {
    args.iter().map(ToString::to_string).collect()
}

/// Translate a health check command vector to the CLI's shell string.
///
/// `CMD-SHELL` carries a ready shell string; argv forms are quoted word by
/// word so the shell sees the same arguments.
fn health_command(command: &[String]) -> String {
    match command.split_first() {
        Some((first, rest)) if first == "CMD-SHELL" => rest.join(" "),
        Some((first, rest)) if first == "CMD" => quote_words(rest),
        _ => quote_words(command),
    }
}

fn quote_words(words: &[String]) -> String {
    words.iter().map(|w| shell_quote(w)).collect::<Vec<_>>().join(" ")
}

fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+%".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = strings(["create", "--name"]);
    args.push(spec.name.clone());
    args.extend(label_args(&spec.labels));
    for (key, value) in &spec.env {
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }
    for port in &spec.ports {
        args.push("--publish".to_string());
        args.push(port.to_string());
    }
    for volume in &spec.volumes {
        args.push("--volume".to_string());
        let mut binding = format!("{}:{}", volume.name, volume.target);
        if volume.read_only {
            binding.push_str(":ro");
        }
        args.push(binding);
    }
    if let Some(network) = &spec.network {
        args.push("--network".to_string());
        args.push(network.clone());
    }
    if let Some(health) = &spec.healthcheck {
        args.push("--health-cmd".to_string());
        args.push(health_command(&health.command));
        args.push(format!("--health-retries={}", health.retries));
        args.push(format!("--health-timeout={}ms", health.timeout.as_millis()));
        args.push(format!("--health-interval={}ms", health.interval.as_millis()));
        args.push(format!(
            "--health-start-period={}ms",
            health.start_period.as_millis()
        ));
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectOutput {
    id: String,
    name: String,
    config: InspectConfig,
    state: InspectState,
    #[serde(default)]
    network_settings: Option<InspectNetwork>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    image: String,
    #[serde(default)]
    labels: Option<Labels>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    running: bool,
    #[serde(default)]
    health: Option<InspectHealth>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHealth {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetwork {
    #[serde(default)]
    ports: Option<BTreeMap<String, Option<Vec<InspectBinding>>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectBinding {
    host_port: String,
}

fn parse_inspect(json: &str) -> StevedoreResult<RuntimeState> {
    let output: InspectOutput = serde_json::from_str(json.trim())?;

    let mut ports = Vec::new();
    let published = output.network_settings.and_then(|n| n.ports).unwrap_or_default();
    for (container_port, bindings) in published {
        let (port, protocol) = split_proto(&container_port);
        let Ok(container) = port.parse() else { continue };
        for binding in bindings.unwrap_or_default() {
            if let Ok(host) = binding.host_port.parse() {
                let mapping = PortMapping {
                    host,
                    container,
                    protocol,
                };
                if !ports.contains(&mapping) {
                    ports.push(mapping);
                }
            }
        }
    }

    Ok(RuntimeState {
        exists: true,
        running: output.state.running,
        health: output
            .state
            .health
            .and_then(|h| h.status.parse().ok())
            .unwrap_or_default(),
        ports,
        container_id: Some(output.id),
        container_name: Some(output.name.trim_start_matches('/').to_string()),
        image: Some(output.config.image),
        labels: output.config.labels.unwrap_or_default(),
    })
}

fn split_proto(port: &str) -> (&str, Protocol) {
    match port.split_once('/') {
        Some((port, "udp")) => (port, Protocol::Udp),
        Some((port, _)) => (port, Protocol::Tcp),
        None => (port, Protocol::Tcp),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    names: String,
    image: String,
    state: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    labels: String,
    #[serde(default)]
    ports: String,
}

fn parse_ps_line(line: &str) -> StevedoreResult<RuntimeState> {
    let ps: PsLine = serde_json::from_str(line.trim())?;
    let labels = ps
        .labels
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    Ok(RuntimeState {
        exists: true,
        running: ps.state == "running",
        health: health_from_status(&ps.status),
        ports: parse_ps_ports(&ps.ports),
        container_id: Some(ps.id),
        container_name: ps.names.split(',').next().map(ToString::to_string),
        image: Some(ps.image),
        labels,
    })
}

/// Health from a `docker ps` status such as `Up 2 minutes (healthy)`.
fn health_from_status(status: &str) -> HealthStatus {
    if status.contains("(healthy)") {
        HealthStatus::Healthy
    } else if status.contains("(unhealthy)") {
        HealthStatus::Unhealthy
    } else if status.contains("(health: starting)") {
        HealthStatus::Starting
    } else {
        HealthStatus::None
    }
}

/// Ports from a `docker ps` column such as
/// `0.0.0.0:6379->6379/tcp, :::6379->6379/tcp`.
fn parse_ps_ports(column: &str) -> Vec<PortMapping> {
    let mut ports = Vec::new();
    for entry in column.split(", ") {
        let Some((host, container)) = entry.split_once("->") else {
            continue;
        };
        let Some(host) = host.rsplit(':').next().and_then(|p| p.parse().ok()) else {
            continue;
        };
        let (container, protocol) = split_proto(container);
        let Ok(container) = container.parse() else { continue };
        let mapping = PortMapping {
            host,
            container,
            protocol,
        };
        if !ports.contains(&mapping) {
            ports.push(mapping);
        }
    }
    ports
}

#[derive(Debug, Deserialize)]
struct EventLine {
    #[serde(rename = "Action")]
    action: String,
    #[serde(rename = "Actor")]
    actor: EventActor,
    #[serde(default)]
    time: i64,
    #[serde(default, rename = "timeNano")]
    time_nano: i64,
}

#[derive(Debug, Deserialize)]
struct EventActor {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default, rename = "Attributes")]
    attributes: BTreeMap<String, String>,
}

fn parse_event_line(line: &str) -> Option<StevedoreResult<RawEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let event: EventLine = match serde_json::from_str(line) {
        Ok(event) => event,
        Err(e) => {
            tracing::debug!(error = %e, line, "Skipping unparsable runtime event");
            return None;
        }
    };

    let timestamp = if event.time_nano > 0 {
        DateTime::from_timestamp_nanos(event.time_nano)
    } else {
        DateTime::from_timestamp(event.time, 0).unwrap_or_else(Utc::now)
    };
    let labels = event
        .actor
        .attributes
        .into_iter()
        .filter(|(k, _)| k != "name" && k != "image")
        .collect();

    Some(Ok(RawEvent {
        container_id: event.actor.id,
        action: event.action,
        timestamp,
        labels,
    }))
}

/// Parse a `docker pull` line like `a1b2c3d4e5f6: Downloading`.
fn parse_pull_line(line: &str) -> Option<PullProgress> {
    let (layer, status) = line.trim().split_once(": ")?;
    if layer.len() != 12 || !layer.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let step = match status.split_whitespace().next()? {
        "Pulling" | "Waiting" => 0,
        "Downloading" => 1,
        "Verifying" | "Download" => 2,
        "Extracting" => 3,
        "Pull" | "Already" => LAYER_STEPS,
        _ => return None,
    };
    Some(PullProgress {
        layer_id: layer.to_string(),
        current: step,
        total: LAYER_STEPS,
    })
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> StevedoreResult<()> {
        self.run(strings(["version", "--format", "{{.Server.Version}}"]))
            .await
            .map(|_| ())
    }

    async fn ensure_network(&self, name: &str, labels: &Labels) -> StevedoreResult<()> {
        match self.run(strings(["network", "inspect", name])).await {
            Ok(_) => return Ok(()),
            Err(StevedoreError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        tracing::info!(network = name, "Creating network");
        let mut args = strings(["network", "create"]);
        args.extend(label_args(labels));
        args.push(name.to_string());
        self.run(args).await.map(|_| ())
    }

    async fn create_volume(&self, name: &str, labels: &Labels) -> StevedoreResult<()> {
        let mut args = strings(["volume", "create"]);
        args.extend(label_args(labels));
        args.push(name.to_string());
        self.run(args).await.map(|_| ())
    }

    async fn volume_exists(&self, name: &str) -> StevedoreResult<bool> {
        match self.run(strings(["volume", "inspect", name])).await {
            Ok(_) => Ok(true),
            Err(StevedoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn remove_volume(&self, name: &str) -> StevedoreResult<()> {
        self.run(strings(["volume", "rm", name])).await.map(|_| ())
    }

    async fn pull_image(&self, reference: &str) -> StevedoreResult<PullStream> {
        let stream = self.stream_lines(strings(["pull", reference]), |line| {
            parse_pull_line(line).map(Ok)
        })?;
        Ok(stream.boxed())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> StevedoreResult<String> {
        let out = self.run(create_args(spec)).await?;
        Ok(out.trim().to_string())
    }

    async fn start(&self, id: &str) -> StevedoreResult<()> {
        self.run(strings(["start", id])).await.map(|_| ())
    }

    async fn stop(&self, id: &str) -> StevedoreResult<()> {
        self.run(strings(["stop", id])).await.map(|_| ())
    }

    async fn restart(&self, id: &str) -> StevedoreResult<()> {
        self.run(strings(["restart", id])).await.map(|_| ())
    }

    async fn remove(&self, id: &str) -> StevedoreResult<()> {
        self.run(strings(["rm", "--force", id])).await.map(|_| ())
    }

    async fn inspect(&self, id: &str) -> StevedoreResult<RuntimeState> {
        let args = strings(["inspect", "--type", "container", "--format", "{{json .}}", id]);
        match self.run(args).await {
            Ok(out) => parse_inspect(&out),
            Err(StevedoreError::NotFound { .. }) => Ok(RuntimeState::absent()),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, filter: &Labels) -> StevedoreResult<Vec<RuntimeState>> {
        let mut args = strings(["ps", "--all", "--no-trunc", "--format", "{{json .}}"]);
        args.extend(filter_args(filter));
        let out = self.run(args).await?;
        out.lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_ps_line)
            .collect()
    }

    async fn subscribe_events(&self, filter: &Labels) -> StevedoreResult<EventStream> {
        self.ping().await?;
        let mut args = strings([
            "events",
            "--format",
            "{{json .}}",
            "--filter",
            "type=container",
        ]);
        args.extend(filter_args(filter));
        let stream = self.stream_lines(args, parse_event_line)?;
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HealthCheckSpec, VolumeBinding};
    use std::time::Duration;

    #[test]
    fn classifies_cli_errors() {
        let err = classify_error(
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?",
        );
        assert!(err.is_unavailable());

        let err = classify_error("Error response from daemon: No such container: stevedore-redis");
        assert!(matches!(
            err,
            StevedoreError::NotFound { kind: "Container", ref id } if id == "stevedore-redis"
        ));

        let err = classify_error("Error response from daemon: port is already allocated");
        assert!(matches!(err, StevedoreError::Runtime { .. }));
    }

    #[test]
    fn parses_inspect_output() {
        let json = r#"{
            "Id": "abc123",
            "Name": "/stevedore-redis",
            "Config": {"Image": "redis:7-alpine", "Labels": {"dev.stevedore.managed": "true"}},
            "State": {"Running": true, "Health": {"Status": "healthy"}},
            "NetworkSettings": {"Ports": {
                "6379/tcp": [{"HostIp": "0.0.0.0", "HostPort": "6380"}, {"HostIp": "::", "HostPort": "6380"}],
                "9000/udp": null
            }}
        }"#;
        let state = parse_inspect(json).unwrap();
        assert!(state.running);
        assert_eq!(state.health, HealthStatus::Healthy);
        assert_eq!(state.ports, vec![PortMapping::tcp(6380, 6379)]);
        assert_eq!(state.container_name.as_deref(), Some("stevedore-redis"));
        assert_eq!(state.labels["dev.stevedore.managed"], "true");
    }

    #[test]
    fn parses_ps_lines() {
        let line = r#"{"ID":"abc","Names":"stevedore-pg","Image":"postgres:16","State":"running","Status":"Up 3 minutes (health: starting)","Labels":"dev.stevedore.managed=true,dev.stevedore.type=service","Ports":"0.0.0.0:5432->5432/tcp, :::5432->5432/tcp"}"#;
        let state = parse_ps_line(line).unwrap();
        assert_eq!(state.health, HealthStatus::Starting);
        assert_eq!(state.ports, vec![PortMapping::tcp(5432, 5432)]);
        assert_eq!(state.labels["dev.stevedore.type"], "service");
    }

    #[test]
    fn parses_event_lines() {
        let line = r#"{"status":"die","id":"abc","Type":"container","Action":"die","Actor":{"ID":"abc","Attributes":{"dev.stevedore.managed":"true","exitCode":"0","image":"redis","name":"stevedore-redis"}},"time":1700000000,"timeNano":1700000000123456789}"#;
        let event = parse_event_line(line).unwrap().unwrap();
        assert_eq!(event.action, "die");
        assert_eq!(event.container_id, "abc");
        assert!(!event.labels.contains_key("name"));
        assert_eq!(event.timestamp.timestamp(), 1_700_000_000);
        assert!(parse_event_line("not json").is_none());
    }

    #[test]
    fn parses_pull_lines() {
        assert_eq!(
            parse_pull_line("a1b2c3d4e5f6: Downloading"),
            Some(PullProgress {
                layer_id: "a1b2c3d4e5f6".into(),
                current: 1,
                total: LAYER_STEPS
            })
        );
        assert_eq!(parse_pull_line("a1b2c3d4e5f6: Pull complete").unwrap().current, 4);
        assert!(parse_pull_line("7-alpine: Pulling from library/redis").is_none());
        assert!(parse_pull_line("Digest: sha256:0123").is_none());
    }

    #[test]
    fn builds_create_arguments() {
        let spec = ContainerSpec {
            name: "stevedore-redis".into(),
            image: "redis:7-alpine".into(),
            command: vec!["redis-server".into(), "--appendonly".into(), "yes".into()],
            env: BTreeMap::from([("A".to_string(), "1".to_string())]),
            ports: vec![PortMapping::tcp(6379, 6379)],
            volumes: vec![VolumeBinding {
                name: "stevedore-redis-data".into(),
                target: "/data".into(),
                read_only: true,
            }],
            labels: Labels::from([("dev.stevedore.managed".to_string(), "true".to_string())]),
            network: Some("stevedore".into()),
            healthcheck: Some(HealthCheckSpec {
                command: vec!["CMD".into(), "redis-cli".into(), "ping".into()],
                retries: 5,
                timeout: Duration::from_secs(3),
                interval: Duration::from_secs(2),
                start_period: Duration::ZERO,
            }),
        };
        let args = create_args(&spec);
        let joined = args.join(" ");
        assert!(joined.starts_with("create --name stevedore-redis --label dev.stevedore.managed=true"));
        assert!(joined.contains("--publish 6379:6379/tcp"));
        assert!(joined.contains("--volume stevedore-redis-data:/data:ro"));
        assert!(joined.contains("--health-cmd redis-cli ping"));
        assert!(joined.contains("--health-interval=2000ms"));
        assert!(joined.ends_with("redis:7-alpine redis-server --appendonly yes"));
    }

    #[test]
    fn health_argv_survives_the_shell() {
        let argv = |words: &[&str]| words.iter().map(ToString::to_string).collect::<Vec<_>>();

        assert_eq!(
            health_command(&argv(&["CMD", "mysqladmin", "ping", "-p", "my secret"])),
            "mysqladmin ping -p 'my secret'"
        );
        assert_eq!(health_command(&argv(&["CMD", "echo", "it's"])), r"echo 'it'\''s'");
        assert_eq!(health_command(&argv(&["CMD", "test", ""])), "test ''");
        assert_eq!(
            health_command(&argv(&["CMD-SHELL", "pg_isready -U postgres || exit 1"])),
            "pg_isready -U postgres || exit 1"
        );
    }
}
