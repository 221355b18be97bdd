//! In-process runtime simulation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use stevedore_common::{Labels, StevedoreError, StevedoreResult};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::client::{ContainerRuntime, EventStream, PullStream, matches_filter};
use crate::types::{ContainerSpec, HealthStatus, PullProgress, RawEvent, RuntimeState};

const EVENT_BUFFER: usize = 256;
const LAYER_SIZES: [u64; 3] = [4 << 20, 16 << 20, 1 << 20];
const CHUNKS_PER_LAYER: u64 = 4;

/// How simulated health checks progress once a container starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthBehavior {
    /// Report `healthy` after this many inspections of a started container.
    HealthyAfter(u32),
    /// Stay `starting` forever.
    NeverHealthy,
}

impl Default for HealthBehavior {
    fn default() -> Self {
        Self::HealthyAfter(2)
    }
}

#[derive(Debug, Clone)]
struct Container {
    id: String,
    spec: ContainerSpec,
    running: bool,
    health: HealthStatus,
    polls: u32,
}

impl Container {
    fn state(&self) -> RuntimeState {
        RuntimeState {
            exists: true,
            running: self.running,
            health: self.health,
            ports: if self.running { self.spec.ports.clone() } else { Vec::new() },
            container_id: Some(self.id.clone()),
            container_name: Some(self.spec.name.clone()),
            image: Some(self.spec.image.clone()),
            labels: self.spec.labels.clone(),
        }
    }

    fn reset_health(&mut self) {
        self.polls = 0;
        self.health = match (&self.spec.healthcheck, self.running) {
            (Some(_), true) => HealthStatus::Starting,
            _ => HealthStatus::None,
        };
    }
}

#[derive(Debug)]
struct Inner {
    containers: BTreeMap<String, Container>,
    volumes: BTreeMap<String, Labels>,
    networks: BTreeMap<String, Labels>,
    images: BTreeSet<String>,
    next_id: u64,
    calls: Vec<String>,
    failures: HashMap<String, String>,
    unavailable: bool,
    failing_subscriptions: u32,
    latency: Duration,
    health: HealthBehavior,
    event_labels: bool,
    events: broadcast::Sender<RawEvent>,
}

impl Inner {
    fn resolve(&self, id_or_name: &str) -> Option<String> {
        if self.containers.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        self.containers
            .values()
            .find(|c| c.spec.name == id_or_name)
            .map(|c| c.id.clone())
    }

    fn container_mut(&mut self, id_or_name: &str) -> StevedoreResult<&mut Container> {
        let id = self.resolve(id_or_name).ok_or_else(|| StevedoreError::NotFound {
            kind: "Container",
            id: id_or_name.to_string(),
        })?;
        self.containers
            .get_mut(&id)
            .ok_or_else(|| StevedoreError::Internal {
                message: format!("container {id} vanished"),
            })
    }

    fn emit(&self, container_id: &str, action: &str) {
        let labels = self
            .containers
            .get(container_id)
            .map(|c| c.spec.labels.clone())
            .unwrap_or_default();
        // No receivers is fine: nobody is watching.
        let _ = self.events.send(RawEvent {
            container_id: container_id.to_string(),
            action: action.to_string(),
            timestamp: Utc::now(),
            labels,
        });
    }

    fn take_failure(&mut self, operation: &str) -> StevedoreResult<()> {
        match self.failures.remove(operation) {
            Some(message) => Err(StevedoreError::runtime(message)),
            None => Ok(()),
        }
    }
}

/// A deterministic container runtime living entirely in memory.
///
/// Containers, volumes, networks and pulled images are tracked in maps and
/// every state change is published on the event feed the way a real daemon
/// would. Test hooks allow simulating an unreachable daemon, slow calls,
/// dropped event streams and state changes that happen without any event.
#[derive(Debug)]
pub struct MemoryRuntime {
    inner: Mutex<Inner>,
}

impl Default for MemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRuntime {
    /// Empty runtime; health checks pass after two inspections.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Mutex::new(Inner {
                containers: BTreeMap::new(),
                volumes: BTreeMap::new(),
                networks: BTreeMap::new(),
                images: BTreeSet::new(),
                next_id: 1,
                calls: Vec::new(),
                failures: HashMap::new(),
                unavailable: false,
                failing_subscriptions: 0,
                latency: Duration::ZERO,
                health: HealthBehavior::default(),
                event_labels: true,
                events,
            }),
        }
    }

    /// Choose how health checks progress for containers started from now on.
    pub fn set_health_behavior(&self, behavior: HealthBehavior) {
        self.inner.lock().health = behavior;
    }

    /// Make every call fail with `RuntimeUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unavailable = unavailable;
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().latency = latency;
    }

    /// Whether events carry container labels. Docker includes them; some
    /// runtimes do not, forcing a label lookup.
    pub fn set_event_labels(&self, include: bool) {
        self.inner.lock().event_labels = include;
    }

    /// Fail the next `count` event subscriptions.
    pub fn fail_next_subscriptions(&self, count: u32) {
        self.inner.lock().failing_subscriptions = count;
    }

    /// Fail the next call of `operation` (`"pull"`, `"create"`, `"start"`,
    /// ...) with a runtime error carrying `message`.
    pub fn fail_next(&self, operation: &str, message: &str) {
        self.inner
            .lock()
            .failures
            .insert(operation.to_string(), message.to_string());
    }

    /// End every open event stream, as if the daemon connection dropped.
    pub fn disconnect_events(&self) {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        self.inner.lock().events = events;
    }

    /// Flip a container's running flag without emitting any event.
    pub fn set_running_silently(&self, id_or_name: &str, running: bool) -> StevedoreResult<()> {
        let mut inner = self.inner.lock();
        let container = inner.container_mut(id_or_name)?;
        container.running = running;
        container.reset_health();
        Ok(())
    }

    /// Drop a container without emitting any event.
    pub fn forget_container(&self, id_or_name: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.resolve(id_or_name) {
            Some(id) => inner.containers.remove(&id).is_some(),
            None => false,
        }
    }

    /// Force a container's health and publish the matching event.
    pub fn set_health(&self, id_or_name: &str, health: HealthStatus) -> StevedoreResult<()> {
        let mut inner = self.inner.lock();
        let container = inner.container_mut(id_or_name)?;
        container.health = health;
        let id = container.id.clone();
        inner.emit(&id, &format!("health_status: {health}"));
        Ok(())
    }

    /// Publish an arbitrary action for a container.
    pub fn emit(&self, id_or_name: &str, action: &str) {
        let inner = self.inner.lock();
        let id = inner.resolve(id_or_name).unwrap_or_else(|| id_or_name.to_string());
        inner.emit(&id, action);
    }

    /// Every call made so far, as `"<operation> <argument>"`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    /// The spec a container was created from.
    #[must_use]
    pub fn container_spec(&self, id_or_name: &str) -> Option<ContainerSpec> {
        let inner = self.inner.lock();
        let id = inner.resolve(id_or_name)?;
        inner.containers.get(&id).map(|c| c.spec.clone())
    }

    /// Names of existing volumes.
    #[must_use]
    pub fn volumes(&self) -> Vec<String> {
        self.inner.lock().volumes.keys().cloned().collect()
    }

    /// Names of existing networks.
    #[must_use]
    pub fn networks(&self) -> Vec<String> {
        self.inner.lock().networks.keys().cloned().collect()
    }

    /// Number of open event streams.
    #[must_use]
    pub fn event_subscribers(&self) -> usize {
        self.inner.lock().events.receiver_count()
    }

    async fn enter(&self, operation: &str, argument: &str) -> StevedoreResult<()> {
        let latency = {
            let mut inner = self.inner.lock();
            inner.calls.push(format!("{operation} {argument}"));
            inner.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut inner = self.inner.lock();
        if inner.unavailable {
            return Err(StevedoreError::unavailable(
                "Cannot connect to the container runtime",
            ));
        }
        inner.take_failure(operation)
    }
}

fn pull_steps(reference: &str) -> Vec<StevedoreResult<PullProgress>> {
    let mut steps = Vec::new();
    for (index, size) in LAYER_SIZES.iter().enumerate() {
        let layer_id = format!("{:012x}", reference.len() * 0x1_0000 + index);
        let chunk = size / CHUNKS_PER_LAYER;
        for step in 1..=CHUNKS_PER_LAYER {
            steps.push(Ok(PullProgress {
                layer_id: layer_id.clone(),
                current: chunk * step,
                total: *size,
            }));
        }
    }
    steps
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> StevedoreResult<()> {
        self.enter("ping", "").await
    }

    async fn ensure_network(&self, name: &str, labels: &Labels) -> StevedoreResult<()> {
        self.enter("ensure_network", name).await?;
        self.inner
            .lock()
            .networks
            .entry(name.to_string())
            .or_insert_with(|| labels.clone());
        Ok(())
    }

    async fn create_volume(&self, name: &str, labels: &Labels) -> StevedoreResult<()> {
        self.enter("create_volume", name).await?;
        self.inner
            .lock()
            .volumes
            .entry(name.to_string())
            .or_insert_with(|| labels.clone());
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> StevedoreResult<bool> {
        self.enter("volume_exists", name).await?;
        Ok(self.inner.lock().volumes.contains_key(name))
    }

    async fn remove_volume(&self, name: &str) -> StevedoreResult<()> {
        self.enter("remove_volume", name).await?;
        let mut inner = self.inner.lock();
        if inner.containers.values().any(|c| c.spec.volumes.iter().any(|v| v.name == name)) {
            return Err(StevedoreError::runtime(format!(
                "remove {name}: volume is in use"
            )));
        }
        inner
            .volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StevedoreError::NotFound {
                kind: "Volume",
                id: name.to_string(),
            })
    }

    async fn pull_image(&self, reference: &str) -> StevedoreResult<PullStream> {
        self.enter("pull", reference).await?;
        self.inner.lock().images.insert(reference.to_string());
        Ok(futures::stream::iter(pull_steps(reference)).boxed())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> StevedoreResult<String> {
        self.enter("create", &spec.name).await?;
        let mut inner = self.inner.lock();
        if !inner.images.contains(&spec.image) {
            return Err(StevedoreError::NotFound {
                kind: "Image",
                id: spec.image.clone(),
            });
        }
        if let Some(network) = &spec.network
            && !inner.networks.contains_key(network)
        {
            return Err(StevedoreError::NotFound {
                kind: "Network",
                id: network.clone(),
            });
        }
        if inner.resolve(&spec.name).is_some() {
            return Err(StevedoreError::runtime(format!(
                "Conflict. The container name \"/{}\" is already in use",
                spec.name
            )));
        }

        for volume in &spec.volumes {
            inner.volumes.entry(volume.name.clone()).or_default();
        }

        let id = format!("{:064x}", 0xc0ff_ee00_u64 + inner.next_id);
        inner.next_id += 1;
        inner.containers.insert(
            id.clone(),
            Container {
                id: id.clone(),
                spec: spec.clone(),
                running: false,
                health: HealthStatus::None,
                polls: 0,
            },
        );
        inner.emit(&id, "create");
        Ok(id)
    }

    async fn start(&self, id: &str) -> StevedoreResult<()> {
        self.enter("start", id).await?;
        let mut inner = self.inner.lock();
        let container = inner.container_mut(id)?;
        if container.running {
            return Ok(());
        }
        container.running = true;
        container.reset_health();
        let id = container.id.clone();
        inner.emit(&id, "start");
        Ok(())
    }

    async fn stop(&self, id: &str) -> StevedoreResult<()> {
        self.enter("stop", id).await?;
        let mut inner = self.inner.lock();
        let container = inner.container_mut(id)?;
        if !container.running {
            return Ok(());
        }
        container.running = false;
        container.reset_health();
        let id = container.id.clone();
        inner.emit(&id, "kill");
        inner.emit(&id, "die");
        inner.emit(&id, "stop");
        Ok(())
    }

    async fn restart(&self, id: &str) -> StevedoreResult<()> {
        self.enter("restart", id).await?;
        let mut inner = self.inner.lock();
        let container = inner.container_mut(id)?;
        let was_running = container.running;
        container.running = true;
        container.reset_health();
        let id = container.id.clone();
        if was_running {
            inner.emit(&id, "die");
            inner.emit(&id, "stop");
        }
        inner.emit(&id, "start");
        inner.emit(&id, "restart");
        Ok(())
    }

    async fn remove(&self, id: &str) -> StevedoreResult<()> {
        self.enter("remove", id).await?;
        let mut inner = self.inner.lock();
        let container = inner.container_mut(id)?;
        let was_running = container.running;
        let id = container.id.clone();
        if was_running {
            inner.emit(&id, "kill");
            inner.emit(&id, "die");
        }
        inner.emit(&id, "destroy");
        inner.containers.remove(&id);
        Ok(())
    }

    async fn inspect(&self, id: &str) -> StevedoreResult<RuntimeState> {
        self.enter("inspect", id).await?;
        let mut inner = self.inner.lock();
        let Some(resolved) = inner.resolve(id) else {
            return Ok(RuntimeState::absent());
        };
        let behavior = inner.health;
        let Some(container) = inner.containers.get_mut(&resolved) else {
            return Ok(RuntimeState::absent());
        };

        let mut became_healthy = false;
        if container.running && container.health == HealthStatus::Starting {
            container.polls += 1;
            if let HealthBehavior::HealthyAfter(n) = behavior
                && container.polls >= n
            {
                container.health = HealthStatus::Healthy;
                became_healthy = true;
            }
        }
        let state = container.state();
        if became_healthy {
            inner.emit(&resolved, "health_status: healthy");
        }
        Ok(state)
    }

    async fn list(&self, filter: &Labels) -> StevedoreResult<Vec<RuntimeState>> {
        self.enter("list", "").await?;
        Ok(self
            .inner
            .lock()
            .containers
            .values()
            .filter(|c| matches_filter(&c.spec.labels, filter))
            .map(Container::state)
            .collect())
    }

    async fn subscribe_events(&self, filter: &Labels) -> StevedoreResult<EventStream> {
        self.enter("subscribe_events", "").await?;
        let (receiver, include_labels) = {
            let mut inner = self.inner.lock();
            if inner.failing_subscriptions > 0 {
                inner.failing_subscriptions -= 1;
                return Err(StevedoreError::unavailable("event stream refused"));
            }
            (inner.events.subscribe(), inner.event_labels)
        };

        let filter = filter.clone();
        let stream = BroadcastStream::new(receiver).filter_map(move |item| {
            let item = match item {
                Ok(mut event) if matches_filter(&event.labels, &filter) => {
                    if !include_labels {
                        event.labels.clear();
                    }
                    Some(Ok(event))
                }
                Ok(_) => None,
                Err(lagged) => Some(Err(StevedoreError::runtime(lagged.to_string()))),
            };
            futures::future::ready(item)
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HealthCheckSpec, PortMapping, VolumeBinding};
    use stevedore_common::labels;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "redis:7-alpine".to_string(),
            command: Vec::new(),
            env: BTreeMap::new(),
            ports: vec![PortMapping::tcp(6379, 6379)],
            volumes: vec![VolumeBinding {
                name: format!("{name}-data"),
                target: "/data".to_string(),
                read_only: false,
            }],
            labels: labels::shared(),
            network: None,
            healthcheck: Some(HealthCheckSpec {
                command: vec!["CMD".into(), "redis-cli".into(), "ping".into()],
                retries: 3,
                timeout: Duration::from_secs(1),
                interval: Duration::from_secs(1),
                start_period: Duration::ZERO,
            }),
        }
    }

    async fn pulled(runtime: &MemoryRuntime) {
        let steps: Vec<_> = runtime.pull_image("redis:7-alpine").await.unwrap().collect().await;
        assert_eq!(steps.len(), 12);
    }

    #[tokio::test]
    async fn create_requires_pulled_image() {
        let runtime = MemoryRuntime::new();
        let err = runtime.create_container(&spec("a")).await.unwrap_err();
        assert!(matches!(err, StevedoreError::NotFound { kind: "Image", .. }));

        pulled(&runtime).await;
        runtime.create_container(&spec("a")).await.unwrap();
        assert_eq!(runtime.volumes(), vec!["a-data".to_string()]);
        assert!(runtime.create_container(&spec("a")).await.is_err());
    }

    #[tokio::test]
    async fn health_progresses_on_inspection() {
        let runtime = MemoryRuntime::new();
        pulled(&runtime).await;
        let id = runtime.create_container(&spec("a")).await.unwrap();
        runtime.start(&id).await.unwrap();

        assert_eq!(runtime.inspect("a").await.unwrap().health, HealthStatus::Starting);
        assert_eq!(runtime.inspect("a").await.unwrap().health, HealthStatus::Healthy);

        runtime.stop(&id).await.unwrap();
        let state = runtime.inspect(&id).await.unwrap();
        assert!(!state.running);
        assert_eq!(state.health, HealthStatus::None);
    }

    #[tokio::test]
    async fn events_follow_state_changes_until_disconnect() {
        let runtime = MemoryRuntime::new();
        pulled(&runtime).await;
        let mut events = runtime.subscribe_events(&labels::shared()).await.unwrap();

        let id = runtime.create_container(&spec("a")).await.unwrap();
        runtime.start(&id).await.unwrap();
        assert_eq!(events.next().await.unwrap().unwrap().action, "create");
        assert_eq!(events.next().await.unwrap().unwrap().action, "start");

        runtime.disconnect_events();
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn silent_changes_emit_nothing() {
        let runtime = MemoryRuntime::new();
        pulled(&runtime).await;
        let id = runtime.create_container(&spec("a")).await.unwrap();
        let mut events = runtime.subscribe_events(&Labels::new()).await.unwrap();

        runtime.set_running_silently(&id, true).unwrap();
        runtime.emit(&id, "pause");
        assert_eq!(events.next().await.unwrap().unwrap().action, "pause");
        assert!(runtime.inspect(&id).await.unwrap().running);
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let runtime = MemoryRuntime::new();
        runtime.fail_next("ping", "boom");
        assert!(runtime.ping().await.is_err());
        runtime.ping().await.unwrap();

        runtime.set_unavailable(true);
        assert!(runtime.ping().await.unwrap_err().is_unavailable());
    }
}
