//! Deadline decorator for runtime backends.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use stevedore_common::{Labels, ResourceKind, StevedoreError, StevedoreResult};

use crate::client::{ContainerRuntime, EventStream, PullStream};
use crate::types::{ContainerSpec, RuntimeState};

/// Deadlines applied by [`Bounded`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Ping, inspect, list and other read-only queries.
    pub query: Duration,
    /// Start, stop, restart, remove and volume/network management.
    pub command: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            query: Duration::from_secs(3),
            command: Duration::from_secs(30),
        }
    }
}

/// Wraps a backend so no call can hang the caller.
///
/// A missed deadline is reported as
/// [`StevedoreError::RuntimeUnavailable`], exactly like a daemon that is not
/// running. Image pulls and container creation are left unbounded because
/// their duration depends on the image size; opening the event feed is
/// bounded, consuming it is not.
#[derive(Debug, Clone)]
pub struct Bounded<R> {
    inner: R,
    timeouts: Timeouts,
}

impl<R> Bounded<R> {
    /// Wrap `inner` with the default deadlines.
    pub fn new(inner: R) -> Self {
        Self::with_timeouts(inner, Timeouts::default())
    }

    /// Wrap `inner` with custom deadlines.
    pub const fn with_timeouts(inner: R, timeouts: Timeouts) -> Self {
        Self { inner, timeouts }
    }

    /// The wrapped backend.
    pub const fn inner(&self) -> &R {
        &self.inner
    }
}

async fn within<T>(
    limit: Duration,
    operation: &str,
    fut: impl Future<Output = StevedoreResult<T>> + Send,
) -> StevedoreResult<T> {
    if let Ok(result) = tokio::time::timeout(limit, fut).await {
        result
    } else {
        tracing::warn!(operation, ?limit, "Runtime call timed out");
        Err(StevedoreError::unavailable(format!(
            "{operation} timed out after {limit:?}"
        )))
    }
}

#[async_trait]
impl<R: ContainerRuntime> ContainerRuntime for Bounded<R> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn ping(&self) -> StevedoreResult<()> {
        within(self.timeouts.query, "ping", self.inner.ping()).await
    }

    async fn ensure_network(&self, name: &str, labels: &Labels) -> StevedoreResult<()> {
        within(
            self.timeouts.command,
            "ensure_network",
            self.inner.ensure_network(name, labels),
        )
        .await
    }

    async fn create_volume(&self, name: &str, labels: &Labels) -> StevedoreResult<()> {
        within(
            self.timeouts.command,
            "create_volume",
            self.inner.create_volume(name, labels),
        )
        .await
    }

    async fn volume_exists(&self, name: &str) -> StevedoreResult<bool> {
        within(self.timeouts.query, "volume_exists", self.inner.volume_exists(name)).await
    }

    async fn remove_volume(&self, name: &str) -> StevedoreResult<()> {
        within(self.timeouts.command, "remove_volume", self.inner.remove_volume(name)).await
    }

    async fn pull_image(&self, reference: &str) -> StevedoreResult<PullStream> {
        self.inner.pull_image(reference).await
    }

    async fn create_container(&self, spec: &ContainerSpec) -> StevedoreResult<String> {
        self.inner.create_container(spec).await
    }

    async fn start(&self, id: &str) -> StevedoreResult<()> {
        within(self.timeouts.command, "start", self.inner.start(id)).await
    }

    async fn stop(&self, id: &str) -> StevedoreResult<()> {
        within(self.timeouts.command, "stop", self.inner.stop(id)).await
    }

    async fn restart(&self, id: &str) -> StevedoreResult<()> {
        within(self.timeouts.command, "restart", self.inner.restart(id)).await
    }

    async fn remove(&self, id: &str) -> StevedoreResult<()> {
        within(self.timeouts.command, "remove", self.inner.remove(id)).await
    }

    async fn inspect(&self, id: &str) -> StevedoreResult<RuntimeState> {
        within(self.timeouts.query, "inspect", self.inner.inspect(id)).await
    }

    async fn list(&self, filter: &Labels) -> StevedoreResult<Vec<RuntimeState>> {
        within(self.timeouts.query, "list", self.inner.list(filter)).await
    }

    async fn subscribe_events(&self, filter: &Labels) -> StevedoreResult<EventStream> {
        within(
            self.timeouts.query,
            "subscribe_events",
            self.inner.subscribe_events(filter),
        )
        .await
    }

    async fn find_by_label(
        &self,
        key: &str,
        value: &str,
        kind: ResourceKind,
    ) -> StevedoreResult<Option<RuntimeState>> {
        within(
            self.timeouts.query,
            "find_by_label",
            self.inner.find_by_label(key, value, kind),
        )
        .await
    }

    async fn container_labels(&self, id: &str) -> StevedoreResult<Labels> {
        within(
            self.timeouts.query,
            "container_labels",
            self.inner.container_labels(id),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRuntime;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn slow_queries_become_unavailable() {
        let memory = Arc::new(MemoryRuntime::new());
        memory.set_latency(Duration::from_secs(10));
        let runtime = Bounded::new(memory.clone());

        let err = runtime.ping().await.unwrap_err();
        assert!(err.is_unavailable(), "{err}");

        let err = runtime.inspect("anything").await.unwrap_err();
        assert!(err.is_unavailable(), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn fast_queries_pass_through() {
        let memory = Arc::new(MemoryRuntime::new());
        memory.set_latency(Duration::from_millis(100));
        let runtime = Bounded::new(memory);

        runtime.ping().await.unwrap();
        let state = runtime.inspect("missing").await.unwrap();
        assert!(!state.exists);
    }
}
