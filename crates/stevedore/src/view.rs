//! Cached view of runtime state, kept current by monitor notices.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use stevedore_common::{LabelOrigin, ResourceId, StevedoreResult, labels};
use stevedore_runtime::{ContainerRuntime, EventAction, HealthStatus, RuntimeState};
use tokio::task::JoinHandle;

use crate::monitor::{MonitorNotice, Subscription};

/// Per-resource [`RuntimeState`] cache.
///
/// Events patch entries in place; a `Resync` notice (sent after the monitor
/// reconnects) throws the cache away and rebuilds it from a full listing, so
/// changes that happened while disconnected are not lost.
#[derive(Clone)]
pub struct StateView {
    runtime: Arc<dyn ContainerRuntime>,
    states: Arc<DashMap<ResourceId, RuntimeState>>,
}

impl std::fmt::Debug for StateView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateView")
            .field("resources", &self.states.len())
            .finish_non_exhaustive()
    }
}

impl StateView {
    /// Empty view.
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            states: Arc::new(DashMap::new()),
        }
    }

    /// Cached state of one resource.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<RuntimeState> {
        self.states.get(id).map(|s| s.clone())
    }

    /// Every cached state.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<ResourceId, RuntimeState> {
        self.states
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Rebuild the cache from a full listing of managed containers.
    ///
    /// # Errors
    ///
    /// Returns the runtime error; the cache is left as it was.
    pub async fn reconcile(&self) -> StevedoreResult<()> {
        let listed = self.runtime.list(&labels::shared()).await?;
        let fresh: BTreeMap<ResourceId, RuntimeState> = listed
            .into_iter()
            .filter_map(|state| LabelOrigin::from_labels(&state.labels).map(|o| (o.id, state)))
            .collect();

        self.states.retain(|id, _| fresh.contains_key(id));
        for (id, state) in fresh {
            self.states.insert(id, state);
        }
        tracing::debug!(resources = self.states.len(), "State view reconciled");
        Ok(())
    }

    /// Apply one notice.
    pub async fn apply(&self, notice: &MonitorNotice) {
        match notice {
            MonitorNotice::Event(event) => {
                let mut state = self.states.entry(event.resource_id.clone()).or_default();
                state.exists = true;
                state.container_id = Some(event.container_id.clone());
                if let Some(running) = event.action.implies_running() {
                    state.running = running;
                    if !running {
                        state.health = HealthStatus::None;
                    }
                }
                if let EventAction::HealthStatus(health) = event.action {
                    state.health = health;
                }
            }
            MonitorNotice::Resync => {
                if let Err(e) = self.reconcile().await {
                    tracing::warn!(error = %e, "State view resync failed");
                }
            }
            MonitorNotice::Status(_) => {}
        }
    }

    /// Follow `subscription` until it closes.
    #[must_use]
    pub fn follow(&self, mut subscription: Subscription) -> JoinHandle<()> {
        let view = self.clone();
        tokio::spawn(async move {
            while let Some(notice) = subscription.recv().await {
                view.apply(&notice).await;
            }
            tracing::debug!("State view subscription closed");
        })
    }
}
