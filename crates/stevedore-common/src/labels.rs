//! Label namespace used to claim runtime objects.
//!
//! Every container, volume and network Stevedore creates carries
//! `dev.stevedore.managed=true`, a `dev.stevedore.type` naming the resource
//! kind and an identifying key (`dev.stevedore.service-id` or
//! `dev.stevedore.project-id`). Anything created outside this convention is
//! invisible to the engine and to the event monitor.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::id::{Category, ResourceId, ResourceKind};

/// Prefix shared by all Stevedore labels.
pub const PREFIX: &str = "dev.stevedore.";

/// Marks an object as owned by Stevedore.
pub const MANAGED: &str = "dev.stevedore.managed";

/// Resource kind (`service` or `project`).
pub const TYPE: &str = "dev.stevedore.type";

/// Resource category.
pub const CATEGORY: &str = "dev.stevedore.category";

/// Label map attached to runtime objects.
pub type Labels = BTreeMap<String, String>;

/// Full label key holding the identifier for `kind`.
#[must_use]
pub fn id_key(kind: ResourceKind) -> String {
    format!("{PREFIX}{}", kind.id_label())
}

/// Labels for an object owned by a resource.
#[must_use]
pub fn for_resource(kind: ResourceKind, id: &ResourceId, category: Category) -> Labels {
    let mut labels = Labels::new();
    labels.insert(MANAGED.to_string(), "true".to_string());
    labels.insert(TYPE.to_string(), kind.as_str().to_string());
    labels.insert(id_key(kind), id.to_string());
    labels.insert(CATEGORY.to_string(), category.as_str().to_string());
    labels
}

/// Labels for shared objects not tied to one resource (the network).
#[must_use]
pub fn shared() -> Labels {
    let mut labels = Labels::new();
    labels.insert(MANAGED.to_string(), "true".to_string());
    labels
}

/// The resource a runtime object belongs to, recovered from its labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelOrigin {
    /// Resource identifier.
    pub id: ResourceId,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Resource category, when labelled.
    pub category: Option<Category>,
}

impl LabelOrigin {
    /// Recover the owning resource from a label map.
    ///
    /// Returns `None` for objects that are not managed or whose labels are
    /// incomplete.
    #[must_use]
    pub fn from_labels(labels: &Labels) -> Option<Self> {
        if labels.get(MANAGED).map(String::as_str) != Some("true") {
            return None;
        }

        let kind: ResourceKind = labels.get(TYPE)?.parse().ok()?;
        let id = ResourceId::new(labels.get(&id_key(kind))?.as_str()).ok()?;
        let category = labels.get(CATEGORY).and_then(|c| c.parse().ok());

        Some(Self { id, kind, category })
    }
}
