//! Resource definitions and the service catalog.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use stevedore_common::{
    Category, Labels, ResourceId, ResourceKind, StevedoreError, StevedoreResult, labels,
};
use stevedore_runtime::{ContainerSpec, HealthCheckSpec, PortMapping, VolumeBinding};

use crate::state::PersistedResourceConfig;

const BUILTIN: &str = include_str!("catalog.yaml");

/// Container settings a resource is created with unless overridden.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeDefaults {
    /// Image reference.
    pub image: String,
    /// Published ports.
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    /// Volumes; names are local to the resource.
    #[serde(default)]
    pub volumes: Vec<VolumeBinding>,
    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Command override.
    #[serde(default)]
    pub command: Vec<String>,
    /// Health check.
    #[serde(default)]
    pub healthcheck: Option<HealthCheckSpec>,
}

const fn service_kind() -> ResourceKind {
    ResourceKind::Service
}

/// Static declaration of an installable resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    /// Identifier.
    pub id: ResourceId,
    /// Service or project.
    #[serde(default = "service_kind")]
    pub kind: ResourceKind,
    /// Display name.
    pub name: String,
    /// One-line description.
    #[serde(default)]
    pub description: String,
    /// Category.
    pub category: Category,
    /// Whether the desktop client treats the resource as mandatory.
    #[serde(default)]
    pub required: bool,
    /// Default container settings.
    pub defaults: RuntimeDefaults,
}

impl ResourceDefinition {
    /// Labels claiming objects of this resource.
    #[must_use]
    pub fn labels(&self) -> Labels {
        labels::for_resource(self.kind, &self.id, self.category)
    }

    /// Runtime name of a declared volume.
    #[must_use]
    pub fn volume_name(&self, volume: &VolumeBinding) -> String {
        format!("{}-{}", self.id.container_name(), volume.name)
    }

    /// Runtime names of all declared volumes.
    #[must_use]
    pub fn volume_names(&self) -> Vec<String> {
        self.defaults
            .volumes
            .iter()
            .map(|v| self.volume_name(v))
            .collect()
    }

    /// Image to use once `custom` is applied.
    #[must_use]
    pub fn image<'a>(&'a self, custom: Option<&'a PersistedResourceConfig>) -> &'a str {
        custom
            .and_then(|c| c.image.as_deref())
            .unwrap_or(&self.defaults.image)
    }

    /// Container spec from the defaults merged with `custom`.
    #[must_use]
    pub fn container_spec(
        &self,
        custom: Option<&PersistedResourceConfig>,
        network: &str,
    ) -> ContainerSpec {
        let mut env = self.defaults.env.clone();
        let ports = match custom {
            Some(custom) => {
                env.extend(custom.env.iter().map(|(k, v)| (k.clone(), v.clone())));
                custom.apply_ports(&self.defaults.ports)
            }
            None => self.defaults.ports.clone(),
        };

        ContainerSpec {
            name: self.id.container_name(),
            image: self.image(custom).to_string(),
            command: self.defaults.command.clone(),
            env,
            ports,
            volumes: self
                .defaults
                .volumes
                .iter()
                .map(|v| VolumeBinding {
                    name: self.volume_name(v),
                    ..v.clone()
                })
                .collect(),
            labels: self.labels(),
            network: Some(network.to_string()),
            healthcheck: self.defaults.healthcheck.clone(),
        }
    }

    fn validate(&self) -> StevedoreResult<()> {
        if self.kind != ResourceKind::Service {
            return Err(StevedoreError::validation(format!(
                "catalog entry {} must be a service",
                self.id
            )));
        }
        if self.defaults.image.trim().is_empty() {
            return Err(StevedoreError::validation(format!(
                "catalog entry {} has no image",
                self.id
            )));
        }
        if let Some(health) = &self.defaults.healthcheck
            && (health.command.is_empty() || health.retries == 0)
        {
            return Err(StevedoreError::validation(format!(
                "catalog entry {} has an unusable health check",
                self.id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    services: Vec<ResourceDefinition>,
}

/// The set of installable services.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    services: BTreeMap<ResourceId, ResourceDefinition>,
}

impl Catalog {
    /// The services shipped with Stevedore.
    ///
    /// # Errors
    ///
    /// Only fails if the embedded catalog is malformed.
    pub fn builtin() -> StevedoreResult<Self> {
        Self::from_yaml(BUILTIN)
    }

    /// Parse a catalog document.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::Config`] for malformed YAML and
    /// [`StevedoreError::Validation`] for unusable entries.
    pub fn from_yaml(content: &str) -> StevedoreResult<Self> {
        let file: CatalogFile = serde_yaml::from_str(content).map_err(|e| StevedoreError::Config {
            message: format!("Failed to parse catalog: {e}"),
        })?;

        let mut services = BTreeMap::new();
        for definition in file.services {
            definition.validate()?;
            if services.insert(definition.id.clone(), definition).is_some() {
                return Err(StevedoreError::validation("duplicate catalog entry"));
            }
        }
        Ok(Self { services })
    }

    /// The built-in catalog, overlaid with `path` if given.
    ///
    /// # Errors
    ///
    /// Returns an error if the override cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> StevedoreResult<Self> {
        let mut catalog = Self::builtin()?;
        if let Some(path) = path {
            let content = std::fs::read_to_string(path).map_err(|e| StevedoreError::Config {
                message: format!("Failed to read catalog {}: {e}", path.display()),
            })?;
            let overlay = Self::from_yaml(&content)?;
            tracing::info!(
                path = %path.display(),
                services = overlay.len(),
                "Loaded catalog override"
            );
            catalog.merge(overlay);
        }
        Ok(catalog)
    }

    /// Add `other`'s services, replacing same-id entries.
    pub fn merge(&mut self, other: Self) {
        self.services.extend(other.services);
    }

    /// Look up a service.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&ResourceDefinition> {
        self.services.get(id)
    }

    /// Whether a service exists.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.services.contains_key(id)
    }

    /// All services in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ResourceDefinition> {
        self.services.values()
    }

    /// Number of services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
