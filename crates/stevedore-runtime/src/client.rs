//! The container runtime contract.

use async_trait::async_trait;
use futures::stream::BoxStream;
use stevedore_common::{Labels, ResourceKind, StevedoreResult, labels};

use crate::types::{ContainerSpec, PullProgress, RawEvent, RuntimeState};

/// Progress updates of an image pull. Ends when the pull finishes; an `Err`
/// item means the pull failed.
pub type PullStream = BoxStream<'static, StevedoreResult<PullProgress>>;

/// Runtime event feed. The stream ending, or yielding an `Err`, is the
/// disconnect signal.
pub type EventStream = BoxStream<'static, StevedoreResult<RawEvent>>;

/// Operations Stevedore needs from a container runtime.
///
/// Implementations report an unreachable daemon as
/// [`StevedoreError::RuntimeUnavailable`](stevedore_common::StevedoreError::RuntimeUnavailable)
/// and a missing container as
/// [`StevedoreError::NotFound`](stevedore_common::StevedoreError::NotFound),
/// except for [`inspect`](Self::inspect), which answers with
/// [`RuntimeState::absent`].
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Check the daemon answers.
    async fn ping(&self) -> StevedoreResult<()>;

    /// Create the network if it does not exist.
    async fn ensure_network(&self, name: &str, labels: &Labels) -> StevedoreResult<()>;

    /// Create a named volume. Existing volumes are left alone.
    async fn create_volume(&self, name: &str, labels: &Labels) -> StevedoreResult<()>;

    /// Whether a named volume exists.
    async fn volume_exists(&self, name: &str) -> StevedoreResult<bool>;

    /// Remove a named volume.
    async fn remove_volume(&self, name: &str) -> StevedoreResult<()>;

    /// Pull an image, streaming per-layer progress.
    async fn pull_image(&self, reference: &str) -> StevedoreResult<PullStream>;

    /// Create a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> StevedoreResult<String>;

    /// Start a container.
    async fn start(&self, id: &str) -> StevedoreResult<()>;

    /// Stop a container.
    async fn stop(&self, id: &str) -> StevedoreResult<()>;

    /// Restart a container.
    async fn restart(&self, id: &str) -> StevedoreResult<()>;

    /// Remove a container, stopping it first if needed.
    async fn remove(&self, id: &str) -> StevedoreResult<()>;

    /// Observe a container by id or name.
    async fn inspect(&self, id: &str) -> StevedoreResult<RuntimeState>;

    /// All containers (running or not) carrying every label in `filter`.
    async fn list(&self, filter: &Labels) -> StevedoreResult<Vec<RuntimeState>>;

    /// Subscribe to container events for containers matching `filter`.
    async fn subscribe_events(&self, filter: &Labels) -> StevedoreResult<EventStream>;

    /// Find the managed container of `kind` whose label `key` equals `value`.
    async fn find_by_label(
        &self,
        key: &str,
        value: &str,
        kind: ResourceKind,
    ) -> StevedoreResult<Option<RuntimeState>> {
        let mut filter = labels::shared();
        filter.insert(labels::TYPE.to_string(), kind.as_str().to_string());
        filter.insert(key.to_string(), value.to_string());
        Ok(self.list(&filter).await?.into_iter().next())
    }

    /// Labels of a container; empty if it no longer exists.
    async fn container_labels(&self, id: &str) -> StevedoreResult<Labels> {
        Ok(self.inspect(id).await?.labels)
    }
}

/// Whether `labels` carries every entry of `filter`.
pub(crate) fn matches_filter(labels: &Labels, filter: &Labels) -> bool {
    filter.iter().all(|(k, v)| labels.get(k) == Some(v))
}

#[async_trait]
impl<T: ContainerRuntime + ?Sized> ContainerRuntime for std::sync::Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn ping(&self) -> StevedoreResult<()> {
        (**self).ping().await
    }

    async fn ensure_network(&self, name: &str, labels: &Labels) -> StevedoreResult<()> {
        (**self).ensure_network(name, labels).await
    }

    async fn create_volume(&self, name: &str, labels: &Labels) -> StevedoreResult<()> {
        (**self).create_volume(name, labels).await
    }

    async fn volume_exists(&self, name: &str) -> StevedoreResult<bool> {
        (**self).volume_exists(name).await
    }

    async fn remove_volume(&self, name: &str) -> StevedoreResult<()> {
        (**self).remove_volume(name).await
    }

    async fn pull_image(&self, reference: &str) -> StevedoreResult<PullStream> {
        (**self).pull_image(reference).await
    }

    async fn create_container(&self, spec: &ContainerSpec) -> StevedoreResult<String> {
        (**self).create_container(spec).await
    }

    async fn start(&self, id: &str) -> StevedoreResult<()> {
        (**self).start(id).await
    }

    async fn stop(&self, id: &str) -> StevedoreResult<()> {
        (**self).stop(id).await
    }

    async fn restart(&self, id: &str) -> StevedoreResult<()> {
        (**self).restart(id).await
    }

    async fn remove(&self, id: &str) -> StevedoreResult<()> {
        (**self).remove(id).await
    }

    async fn inspect(&self, id: &str) -> StevedoreResult<RuntimeState> {
        (**self).inspect(id).await
    }

    async fn list(&self, filter: &Labels) -> StevedoreResult<Vec<RuntimeState>> {
        (**self).list(filter).await
    }

    async fn subscribe_events(&self, filter: &Labels) -> StevedoreResult<EventStream> {
        (**self).subscribe_events(filter).await
    }

    async fn find_by_label(
        &self,
        key: &str,
        value: &str,
        kind: ResourceKind,
    ) -> StevedoreResult<Option<RuntimeState>> {
        (**self).find_by_label(key, value, kind).await
    }

    async fn container_labels(&self, id: &str) -> StevedoreResult<Labels> {
        (**self).container_labels(id).await
    }
}
