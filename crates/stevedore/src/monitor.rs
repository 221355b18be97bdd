//! Container event monitor.
//!
//! One background task holds the runtime's event stream open, classifies
//! and enriches every event, and fans the result out to subscribers. When the
//! stream drops the task reconnects with a bounded linear backoff and, once
//! connected again, tells subscribers to resynchronize because events may
//! have been missed in between.
//!
//! ```text
//! Disconnected ──start──▶ Connecting ──ok──▶ Connected
//!       ▲                     │                  │
//!       └──── backoff ◀── error ◀─── stream error/close
//! ```

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use stevedore_common::duration::as_human;
use stevedore_common::{Category, LabelOrigin, ResourceId, ResourceKind, labels};
use stevedore_runtime::{ContainerRuntime, EventAction, RawEvent};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Entries kept in the label cache before expired ones are swept.
const LABEL_CACHE_SWEEP: usize = 512;

/// Event monitor tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Delay after the first failure; grows linearly per attempt.
    #[serde(with = "as_human")]
    pub backoff_base: Duration,
    /// Upper bound on the reconnect delay.
    #[serde(with = "as_human")]
    pub backoff_max: Duration,
    /// How long container labels are cached.
    #[serde(with = "as_human")]
    pub label_ttl: Duration,
    /// Notices buffered per subscriber before new ones are dropped.
    pub buffer: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            label_ttl: Duration::from_secs(60),
            buffer: 256,
        }
    }
}

impl MonitorConfig {
    /// Reconnect delay after `attempts` consecutive failures.
    #[must_use]
    pub fn backoff(&self, attempts: u32) -> Duration {
        self.backoff_base.saturating_mul(attempts.max(1)).min(self.backoff_max)
    }
}

/// A container event, attributed to the resource that owns the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerEvent {
    /// Container id.
    pub container_id: String,
    /// What happened.
    pub action: EventAction,
    /// When the runtime emitted it.
    pub timestamp: DateTime<Utc>,
    /// Owning resource.
    pub resource_id: ResourceId,
    /// Owning resource kind.
    pub kind: ResourceKind,
    /// Owning resource category.
    pub category: Option<Category>,
}

/// Health of the monitor's connection to the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    /// Whether the event stream is open.
    pub connected: bool,
    /// Consecutive failed attempts; reset on connect.
    pub reconnect_attempts: u32,
    /// Why the last attempt or stream failed.
    pub last_error: Option<String>,
    /// When this status was produced.
    pub timestamp: DateTime<Utc>,
}

impl ConnectionStatus {
    fn connected() -> Self {
        Self {
            connected: true,
            reconnect_attempts: 0,
            last_error: None,
            timestamp: Utc::now(),
        }
    }

    fn disconnected(reconnect_attempts: u32, last_error: Option<String>) -> Self {
        Self {
            connected: false,
            reconnect_attempts,
            last_error,
            timestamp: Utc::now(),
        }
    }
}

/// What subscribers receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MonitorNotice {
    /// A managed container changed.
    Event(ContainerEvent),
    /// The connection state changed.
    Status(ConnectionStatus),
    /// Events may have been missed; cached state must be rebuilt.
    Resync,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct CachedLabels {
    fetched: Instant,
    origin: Option<LabelOrigin>,
}

struct Shared {
    runtime: Arc<dyn ContainerRuntime>,
    config: MonitorConfig,
    subscribers: DashMap<u64, mpsc::Sender<MonitorNotice>>,
    next_subscriber: AtomicU64,
    task: Mutex<Option<Running>>,
    status: RwLock<ConnectionStatus>,
    labels: DashMap<String, CachedLabels>,
}

/// Watches the runtime's event feed on behalf of any number of subscribers.
///
/// Cheap to clone; clones share the same task and subscribers.
#[derive(Clone)]
pub struct EventMonitor {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for EventMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventMonitor")
            .field("runtime", &self.shared.runtime.name())
            .field("subscribers", &self.shared.subscribers.len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl EventMonitor {
    /// New stopped monitor.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: MonitorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                runtime,
                config,
                subscribers: DashMap::new(),
                next_subscriber: AtomicU64::new(1),
                task: Mutex::new(None),
                status: RwLock::new(ConnectionStatus::disconnected(0, None)),
                labels: DashMap::new(),
            }),
        }
    }

    /// Start watching. Does nothing if already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut task = self.shared.task.lock();
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            tracing::debug!("Event monitor already running");
            return;
        }

        tracing::info!(runtime = self.shared.runtime.name(), "Starting event monitor");
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(Arc::clone(&self.shared), cancel.clone()));
        *task = Some(Running { cancel, handle });
    }

    /// Stop watching and close every subscription.
    pub async fn stop(&self) {
        let running = self.shared.task.lock().take();
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(e) = running.handle.await {
                tracing::warn!(error = %e, "Event monitor task ended abnormally");
            }
            tracing::info!("Event monitor stopped");
        }
        self.shared.subscribers.clear();
        self.shared.labels.clear();
        *self.shared.status.write() = ConnectionStatus::disconnected(0, None);
    }

    /// Whether the background task is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared
            .task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Latest connection status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.read().clone()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.len()
    }

    /// Receive notices from now on, starting the monitor if needed.
    pub fn subscribe(&self) -> Subscription {
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.shared.config.buffer.max(1));
        self.shared.subscribers.insert(id, tx);
        tracing::debug!(subscriber = id, "Subscriber added");
        self.start();
        Subscription {
            id,
            rx,
            shared: Arc::downgrade(&self.shared),
        }
    }
}

/// A live subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<MonitorNotice>,
    shared: Weak<Shared>,
}

impl Subscription {
    /// Next notice; `None` once the monitor stops or the subscription is
    /// cancelled.
    pub async fn recv(&mut self) -> Option<MonitorNotice> {
        self.rx.recv().await
    }

    /// A notice if one is already queued.
    pub fn try_recv(&mut self) -> Option<MonitorNotice> {
        self.rx.try_recv().ok()
    }

    /// Unsubscribe.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade()
            && shared.subscribers.remove(&self.id).is_some()
        {
            tracing::debug!(subscriber = self.id, "Subscriber removed");
        }
    }
}

impl Stream for Subscription {
    type Item = MonitorNotice;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared").finish_non_exhaustive()
    }
}

impl Shared {
    fn broadcast(&self, notice: &MonitorNotice) {
        let mut closed = Vec::new();
        for entry in &self.subscribers {
            match entry.value().try_send(notice.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(subscriber = *entry.key(), "Subscriber is full, notice dropped");
                }
                Err(TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }
        for id in closed {
            self.subscribers.remove(&id);
        }
    }

    fn publish_status(&self, status: ConnectionStatus) {
        *self.status.write() = status.clone();
        self.broadcast(&MonitorNotice::Status(status));
    }

    /// Resolve the resource owning a container from the event's labels, the
    /// cache, or the runtime, in that order.
    async fn origin(&self, event: &RawEvent) -> Option<LabelOrigin> {
        if let Some(origin) = LabelOrigin::from_labels(&event.labels) {
            self.remember(&event.container_id, Some(origin.clone()));
            return Some(origin);
        }

        if let Some(cached) = self.labels.get(&event.container_id)
            && cached.fetched.elapsed() < self.config.label_ttl
        {
            return cached.origin.clone();
        }

        match self.runtime.container_labels(&event.container_id).await {
            Ok(labels) => {
                let origin = LabelOrigin::from_labels(&labels);
                self.remember(&event.container_id, origin.clone());
                origin
            }
            Err(e) => {
                tracing::warn!(container = %event.container_id, error = %e, "Could not resolve container labels");
                None
            }
        }
    }

    fn remember(&self, container_id: &str, origin: Option<LabelOrigin>) {
        if self.labels.len() >= LABEL_CACHE_SWEEP {
            let ttl = self.config.label_ttl;
            self.labels.retain(|_, cached| cached.fetched.elapsed() < ttl);
        }
        self.labels.insert(
            container_id.to_string(),
            CachedLabels {
                fetched: Instant::now(),
                origin,
            },
        );
    }

    async fn dispatch(&self, raw: RawEvent) {
        let Some(action) = EventAction::classify(&raw.action) else {
            tracing::trace!(action = %raw.action, "Ignoring event");
            return;
        };
        let Some(origin) = self.origin(&raw).await else {
            tracing::trace!(container = %raw.container_id, "Ignoring unmanaged container");
            return;
        };

        tracing::debug!(resource = %origin.id, %action, "Container event");
        self.broadcast(&MonitorNotice::Event(ContainerEvent {
            container_id: raw.container_id,
            action,
            timestamp: raw.timestamp,
            resource_id: origin.id,
            kind: origin.kind,
            category: origin.category,
        }));
    }
}

async fn run(shared: Arc<Shared>, cancel: CancellationToken) {
    let filter = labels::shared();
    let mut attempts: u32 = 0;
    let mut connected_before = false;

    loop {
        let opened = tokio::select! {
            () = cancel.cancelled() => return,
            opened = shared.runtime.subscribe_events(&filter) => opened,
        };

        let error = match opened {
            Ok(mut stream) => {
                let resync = connected_before || attempts > 0;
                attempts = 0;
                connected_before = true;
                tracing::info!("Connected to runtime event stream");
                shared.publish_status(ConnectionStatus::connected());
                if resync {
                    shared.labels.clear();
                    shared.broadcast(&MonitorNotice::Resync);
                }

                loop {
                    let next = tokio::select! {
                        () = cancel.cancelled() => return,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(raw)) => shared.dispatch(raw).await,
                        Some(Err(e)) => break e.to_string(),
                        None => break "event stream closed".to_string(),
                    }
                }
            }
            Err(e) => e.to_string(),
        };

        attempts = attempts.saturating_add(1);
        let delay = shared.config.backoff(attempts);
        tracing::warn!(attempts, ?delay, error = %error, "Runtime event stream disconnected");
        shared.publish_status(ConnectionStatus::disconnected(attempts, Some(error)));

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}
