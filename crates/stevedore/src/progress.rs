//! Install progress fan-out.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stevedore_common::ResourceId;
use stevedore_runtime::PullProgress;
use tokio::sync::broadcast;

const CAPACITY: usize = 256;

/// Progress of an image pull during install, summed over layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallProgress {
    /// Resource being installed.
    pub resource_id: ResourceId,
    /// Units done across all layers seen so far.
    pub bytes_done: u64,
    /// Units in total across all layers seen so far.
    pub bytes_total: u64,
    /// Layer the update came from.
    pub layer_id: String,
}

impl InstallProgress {
    /// Completion as a percentage.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            0.0
        } else {
            self.bytes_done as f64 * 100.0 / self.bytes_total as f64
        }
    }
}

/// Broadcasts install progress to anyone listening.
///
/// Publishing never blocks; slow listeners miss intermediate updates.
#[derive(Debug, Clone)]
pub struct ProgressHub {
    sender: broadcast::Sender<InstallProgress>,
}

impl Default for ProgressHub {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(CAPACITY);
        Self { sender }
    }
}

impl ProgressHub {
    /// New hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive future updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<InstallProgress> {
        self.sender.subscribe()
    }

    /// Start tracking one pull.
    #[must_use]
    pub fn tracker(&self, resource_id: ResourceId) -> PullTracker {
        PullTracker {
            hub: self.clone(),
            resource_id,
            layers: BTreeMap::new(),
            last: None,
        }
    }

    fn publish(&self, progress: InstallProgress) {
        // No listeners is fine.
        let _ = self.sender.send(progress);
    }
}

/// Folds per-layer updates of one pull into totals.
#[derive(Debug)]
pub struct PullTracker {
    hub: ProgressHub,
    resource_id: ResourceId,
    layers: BTreeMap<String, (u64, u64)>,
    last: Option<InstallProgress>,
}

impl PullTracker {
    /// Record a layer update and publish the new totals.
    pub fn record(&mut self, update: &PullProgress) -> &InstallProgress {
        self.layers.insert(
            update.layer_id.clone(),
            (update.current.min(update.total), update.total),
        );
        let (done, total) = self
            .layers
            .values()
            .fold((0, 0), |(d, t), (cd, ct)| (d + cd, t + ct));
        let progress = InstallProgress {
            resource_id: self.resource_id.clone(),
            bytes_done: done,
            bytes_total: total,
            layer_id: update.layer_id.clone(),
        };
        self.hub.publish(progress.clone());
        self.last.insert(progress)
    }

    /// The most recent totals.
    #[must_use]
    pub const fn last(&self) -> Option<&InstallProgress> {
        self.last.as_ref()
    }
}
