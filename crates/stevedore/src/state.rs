//! Persisted orchestration entities.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stevedore_common::{Category, ResourceId, ResourceKind, StevedoreError, StevedorePaths, StevedoreResult};
use stevedore_runtime::PortMapping;
use stevedore_store::JsonStore;

use crate::catalog::{ResourceDefinition, RuntimeDefaults};

/// Run state the user asked for last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    /// Should be running.
    Running,
    /// Should be stopped.
    Stopped,
}

/// Record of an installed resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledResource {
    /// Resource identifier.
    pub id: ResourceId,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Backing container id; cleared when the container disappears.
    pub container_id: Option<String>,
    /// Backing container name.
    pub container_name: String,
    /// Image the container was created from.
    pub image: String,
    /// Volumes created for the resource.
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Last requested run state.
    pub desired: DesiredState,
    /// When the install finished.
    pub installed_at: DateTime<Utc>,
    /// When the last lifecycle transition finished.
    pub last_transition: DateTime<Utc>,
}

/// User overrides applied on top of a definition's defaults.
///
/// Consulted when a container is created, so changes only take effect on the
/// next install.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedResourceConfig {
    /// Container port to host port remaps.
    #[serde(default)]
    pub ports: BTreeMap<u16, u16>,
    /// Extra or replaced environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Replacement image reference.
    #[serde(default)]
    pub image: Option<String>,
}

impl PersistedResourceConfig {
    /// Whether the override changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty() && self.env.is_empty() && self.image.is_none()
    }

    /// Check the override against the definition it applies to.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::Validation`] for remaps of unpublished
    /// ports, host port 0 or collisions, malformed variable names and
    /// blank image references.
    pub fn validate(&self, definition: &ResourceDefinition) -> StevedoreResult<()> {
        let published: BTreeSet<u16> = definition
            .defaults
            .ports
            .iter()
            .map(|p| p.container)
            .collect();

        for (container, host) in &self.ports {
            if !published.contains(container) {
                return Err(StevedoreError::validation(format!(
                    "{} does not publish container port {container}",
                    definition.id
                )));
            }
            if *host == 0 {
                return Err(StevedoreError::validation(format!(
                    "host port for {container} must be between 1 and 65535"
                )));
            }
        }

        let mut hosts = BTreeSet::new();
        for mapping in self.apply_ports(&definition.defaults.ports) {
            if !hosts.insert((mapping.host, mapping.protocol)) {
                return Err(StevedoreError::validation(format!(
                    "host port {} is mapped twice",
                    mapping.host
                )));
            }
        }

        for key in self.env.keys() {
            validate_env_key(key)?;
        }

        if let Some(image) = &self.image
            && (image.trim().is_empty() || image.contains(char::is_whitespace))
        {
            return Err(StevedoreError::validation(format!(
                "invalid image reference: {image:?}"
            )));
        }

        Ok(())
    }

    /// Default ports with remaps applied.
    #[must_use]
    pub fn apply_ports(&self, defaults: &[PortMapping]) -> Vec<PortMapping> {
        defaults
            .iter()
            .map(|p| PortMapping {
                host: self.ports.get(&p.container).copied().unwrap_or(p.host),
                ..*p
            })
            .collect()
    }
}

fn validate_env_key(key: &str) -> StevedoreResult<()> {
    let valid = key.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_')
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StevedoreError::validation(format!(
            "invalid environment variable name: {key:?}"
        )))
    }
}

/// A project container declared by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDefinition {
    /// Resource identifier.
    pub id: ResourceId,
    /// Display name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Port the application listens on inside the container.
    pub port: u16,
    /// Host port to publish, if any.
    #[serde(default)]
    pub host_port: Option<u16>,
    /// Local domain routed to the container by the reverse proxy.
    #[serde(default)]
    pub domain: Option<String>,
    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ProjectDefinition {
    /// Check the declaration is usable.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::Validation`] describing the first problem.
    pub fn validate(&self) -> StevedoreResult<()> {
        if self.image.trim().is_empty() || self.image.contains(char::is_whitespace) {
            return Err(StevedoreError::validation(format!(
                "invalid image reference: {:?}",
                self.image
            )));
        }
        if self.port == 0 || self.host_port == Some(0) {
            return Err(StevedoreError::validation("ports must be between 1 and 65535"));
        }
        if let Some(domain) = &self.domain {
            validate_domain(domain)?;
        }
        for key in self.env.keys() {
            validate_env_key(key)?;
        }
        Ok(())
    }

    /// The resource definition this project installs as.
    #[must_use]
    pub fn to_definition(&self) -> ResourceDefinition {
        ResourceDefinition {
            id: self.id.clone(),
            kind: ResourceKind::Project,
            name: self.name.clone(),
            description: self
                .domain
                .as_ref()
                .map_or_else(|| "Project container".to_string(), |d| format!("Served at {d}")),
            category: Category::Web,
            required: false,
            defaults: RuntimeDefaults {
                image: self.image.clone(),
                ports: self
                    .host_port
                    .map(|host| vec![PortMapping::tcp(host, self.port)])
                    .unwrap_or_default(),
                volumes: Vec::new(),
                env: self.env.clone(),
                command: Vec::new(),
                healthcheck: None,
            },
        }
    }
}

fn validate_domain(domain: &str) -> StevedoreResult<()> {
    let valid = !domain.is_empty()
        && domain.len() <= 253
        && domain.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        });
    if valid {
        Ok(())
    } else {
        Err(StevedoreError::validation(format!("invalid domain: {domain:?}")))
    }
}

/// The three state envelopes the engine persists.
#[derive(Debug, Clone)]
pub struct Stores {
    /// Installed resources, keyed by resource id.
    pub installed: Arc<JsonStore<InstalledResource>>,
    /// User overrides, keyed by resource id.
    pub configs: Arc<JsonStore<PersistedResourceConfig>>,
    /// Project declarations, keyed by resource id.
    pub projects: Arc<JsonStore<ProjectDefinition>>,
}

impl Stores {
    /// Open and initialize every store under `paths`.
    ///
    /// # Errors
    ///
    /// Returns an error if the state directory cannot be created or a fresh
    /// envelope cannot be written.
    pub fn open(paths: &StevedorePaths) -> StevedoreResult<Self> {
        paths.create_dirs()?;
        let stores = Self {
            installed: Arc::new(JsonStore::new(paths.state_file("installed"))),
            configs: Arc::new(JsonStore::new(paths.state_file("configs"))),
            projects: Arc::new(JsonStore::new(paths.state_file("projects"))),
        };
        stores.installed.initialize()?;
        stores.configs.initialize()?;
        stores.projects.initialize()?;
        Ok(stores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;

    fn redis() -> ResourceDefinition {
        let catalog = Catalog::builtin().unwrap();
        catalog.get(&ResourceId::new("redis").unwrap()).unwrap().clone()
    }

    #[test]
    fn remaps_apply_to_published_ports() {
        let mut config = PersistedResourceConfig::default();
        config.ports.insert(6379, 16379);
        config.validate(&redis()).unwrap();
        let ports = config.apply_ports(&redis().defaults.ports);
        assert_eq!(ports, vec![PortMapping::tcp(16379, 6379)]);
    }

    #[test]
    fn rejects_bad_overrides() {
        let mut config = PersistedResourceConfig::default();
        config.ports.insert(80, 8080);
        assert!(config.validate(&redis()).is_err());

        let mut config = PersistedResourceConfig::default();
        config.ports.insert(6379, 0);
        assert!(config.validate(&redis()).is_err());

        let mut config = PersistedResourceConfig::default();
        config.env.insert("1BAD".into(), "x".into());
        assert!(config.validate(&redis()).is_err());

        let config = PersistedResourceConfig {
            image: Some("  ".into()),
            ..Default::default()
        };
        assert!(config.validate(&redis()).is_err());
    }

    #[test]
    fn rejects_two_ports_on_one_host_port() {
        let catalog = Catalog::builtin().unwrap();
        let mailpit = catalog.get(&ResourceId::new("mailpit").unwrap()).unwrap().clone();

        let mut config = PersistedResourceConfig::default();
        config.ports.insert(1025, 8025);
        let err = config.validate(&mailpit).unwrap_err();
        assert!(err.to_string().contains("mapped twice"), "{err}");

        config.ports.insert(1025, 2025);
        config.validate(&mailpit).unwrap();
    }

    #[test]
    fn project_becomes_web_definition() {
        let project = ProjectDefinition {
            id: ResourceId::new("shop").unwrap(),
            name: "Shop".into(),
            image: "node:22-alpine".into(),
            port: 3000,
            host_port: None,
            domain: Some("shop.test".into()),
            env: BTreeMap::new(),
        };
        project.validate().unwrap();
        let definition = project.to_definition();
        assert_eq!(definition.kind, ResourceKind::Project);
        assert_eq!(definition.category, Category::Web);
        assert!(definition.defaults.ports.is_empty());

        let bad = ProjectDefinition {
            domain: Some("Shop..test".into()),
            ..project
        };
        assert!(bad.validate().is_err());
    }
}
