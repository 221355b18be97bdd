//! Per-resource single-flight guard.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use stevedore_common::{ResourceId, StevedoreError, StevedoreResult};

/// Lifecycle operations that claim a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Install.
    Install,
    /// Uninstall.
    Uninstall,
    /// Start.
    Start,
    /// Stop.
    Stop,
    /// Restart.
    Restart,
    /// Configuration update.
    UpdateConfig,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Install => "install",
            Self::Uninstall => "uninstall",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::UpdateConfig => "update_config",
        })
    }
}

/// Registry of resources with an operation in progress.
///
/// Operations on different resources never contend; a second operation on a
/// busy resource fails immediately instead of queueing.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    running: Arc<DashMap<ResourceId, Operation>>,
}

impl InFlight {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for `operation` until the guard is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::OperationInProgress`] naming the operation
    /// already holding the resource.
    pub fn acquire(&self, id: &ResourceId, operation: Operation) -> StevedoreResult<InFlightGuard> {
        match self.running.entry(id.clone()) {
            Entry::Occupied(held) => Err(StevedoreError::OperationInProgress {
                id: id.to_string(),
                running: held.get().to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(operation);
                tracing::trace!(resource = %id, %operation, "Claimed resource");
                Ok(InFlightGuard {
                    running: Arc::clone(&self.running),
                    id: id.clone(),
                })
            }
        }
    }

    /// The operation holding `id`, if any.
    #[must_use]
    pub fn current(&self, id: &ResourceId) -> Option<Operation> {
        self.running.get(id).map(|op| *op)
    }
}

/// Releases the claim on drop, including on error paths and panics.
#[derive(Debug)]
pub struct InFlightGuard {
    running: Arc<DashMap<ResourceId, Operation>>,
    id: ResourceId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.running.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_fails_until_release() {
        let inflight = InFlight::new();
        let redis = ResourceId::new("redis").unwrap();
        let postgres = ResourceId::new("postgres").unwrap();

        let guard = inflight.acquire(&redis, Operation::Install).unwrap();
        let err = inflight.acquire(&redis, Operation::Start).unwrap_err();
        assert!(matches!(
            err,
            StevedoreError::OperationInProgress { ref running, .. } if running == "install"
        ));
        assert_eq!(inflight.current(&redis), Some(Operation::Install));

        let _other = inflight.acquire(&postgres, Operation::Start).unwrap();

        drop(guard);
        assert_eq!(inflight.current(&redis), None);
        inflight.acquire(&redis, Operation::Start).unwrap();
    }
}
