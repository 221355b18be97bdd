//! Resource identifiers, kinds and categories.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{StevedoreError, StevedoreResult};

/// A validated resource identifier.
///
/// Resource IDs must:
/// - Be 1-64 characters long
/// - Contain only lowercase ASCII letters, digits, hyphens and underscores
/// - Start with a letter or digit
///
/// The same identifier names the backing container (`stevedore-<id>`), so it
/// has to be acceptable to the container runtime as well.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId(String);

impl ResourceId {
    /// Maximum length of a resource ID.
    pub const MAX_LENGTH: usize = 64;

    /// Create a new resource ID, validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::Validation`] if the format is invalid.
    pub fn new(id: impl Into<String>) -> StevedoreResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the container backing this resource.
    #[must_use]
    pub fn container_name(&self) -> String {
        format!("stevedore-{}", self.0)
    }

    fn validate(id: &str) -> StevedoreResult<()> {
        if id.is_empty() || id.len() > Self::MAX_LENGTH {
            return Err(StevedoreError::validation(format!(
                "resource id must be 1-{} characters: {id:?}",
                Self::MAX_LENGTH
            )));
        }

        if !id.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit()) {
            return Err(StevedoreError::validation(format!(
                "resource id must start with a lowercase letter or digit: {id:?}"
            )));
        }

        if let Some(bad) = id
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '_'))
        {
            return Err(StevedoreError::validation(format!(
                "resource id contains invalid character {bad:?}: {id:?}"
            )));
        }

        Ok(())
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ResourceId {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ResourceId {
    type Error = StevedoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.0
    }
}

impl AsRef<str> for ResourceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Whether a resource is a shared service or a per-project container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Shared infrastructure service (database, cache, proxy, ...).
    Service,
    /// Container belonging to a single project.
    Project,
}

impl ResourceKind {
    /// Label key carrying the identifier for this kind.
    #[must_use]
    pub const fn id_label(self) -> &'static str {
        match self {
            Self::Service => "service-id",
            Self::Project => "project-id",
        }
    }

    /// Lowercase name, as used in the `type` label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::Project => "project",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "service" => Ok(Self::Service),
            "project" => Ok(Self::Project),
            other => Err(StevedoreError::validation(format!(
                "unknown resource kind: {other}"
            ))),
        }
    }
}

/// Resource category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Web servers and reverse proxies.
    Web,
    /// Relational and document databases.
    Database,
    /// In-memory caches.
    Cache,
    /// Search engines.
    Search,
    /// Object storage.
    Storage,
    /// Message queues.
    Queue,
    /// Mail catchers.
    Email,
}

impl Category {
    /// Lowercase name, as used in the `category` label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Database => "database",
            Self::Cache => "cache",
            Self::Search => "search",
            Self::Storage => "storage",
            Self::Queue => "queue",
            Self::Email => "email",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "web" => Self::Web,
            "database" => Self::Database,
            "cache" => Self::Cache,
            "search" => Self::Search,
            "storage" => Self::Storage,
            "queue" => Self::Queue,
            "email" => Self::Email,
            other => {
                return Err(StevedoreError::validation(format!(
                    "unknown category: {other}"
                )));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_resource_ids() {
        assert!(ResourceId::new("redis").is_ok());
        assert!(ResourceId::new("postgres-16").is_ok());
        assert!(ResourceId::new("my_project").is_ok());
        assert!(ResourceId::new("1password").is_ok());
    }

    #[test]
    fn invalid_resource_ids() {
        assert!(ResourceId::new("").is_err());
        assert!(ResourceId::new("-redis").is_err());
        assert!(ResourceId::new("Redis").is_err());
        assert!(ResourceId::new("redis!").is_err());
        assert!(ResourceId::new("a".repeat(65)).is_err());
    }

    #[test]
    fn container_name_is_prefixed() {
        let id = ResourceId::new("redis").unwrap();
        assert_eq!(id.container_name(), "stevedore-redis");
    }

    #[test]
    fn deserialize_rejects_bad_ids() {
        let ok: ResourceId = serde_json::from_str("\"redis\"").unwrap();
        assert_eq!(ok.as_str(), "redis");
        assert!(serde_json::from_str::<ResourceId>("\"Bad Id\"").is_err());
    }

    #[test]
    fn kind_and_category_round_trip_through_strings() {
        assert_eq!("project".parse::<ResourceKind>().unwrap(), ResourceKind::Project);
        assert_eq!(ResourceKind::Service.id_label(), "service-id");
        assert_eq!("search".parse::<Category>().unwrap(), Category::Search);
        assert!("gpu".parse::<Category>().is_err());
    }
}
