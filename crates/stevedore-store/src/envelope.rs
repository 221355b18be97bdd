//! On-disk envelope format.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current envelope schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Versioned container for a store's full record set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    /// Records keyed by identifier.
    pub items: BTreeMap<String, T>,
    /// Schema version the envelope was written with.
    pub version: u32,
    /// Time of the last mutation.
    pub last_updated: DateTime<Utc>,
}

impl<T> Envelope<T> {
    /// A fresh, empty envelope at the current schema version.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            items: BTreeMap::new(),
            version: SCHEMA_VERSION,
            last_updated: Utc::now(),
        }
    }

    /// Check the envelope was written by a compatible schema.
    pub(crate) fn check_version(&self) -> Result<(), String> {
        if self.version == SCHEMA_VERSION {
            Ok(())
        } else {
            Err(format!(
                "unsupported schema version {} (expected {SCHEMA_VERSION})",
                self.version
            ))
        }
    }
}

impl<T> Default for Envelope<T> {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_camel_case_timestamp() {
        let env: Envelope<u32> = Envelope::empty();
        let json = serde_json::to_value(&env).unwrap();
        assert!(json.get("lastUpdated").is_some());
        assert_eq!(json["version"], SCHEMA_VERSION);
        assert!(json["items"].as_object().unwrap().is_empty());
    }

    #[test]
    fn missing_fields_fail_shape_check() {
        let err = serde_json::from_str::<Envelope<u32>>(r#"{"items": {}}"#);
        assert!(err.is_err());
    }

    #[test]
    fn version_mismatch_is_reported() {
        let mut env: Envelope<u32> = Envelope::empty();
        env.version = SCHEMA_VERSION + 1;
        assert!(env.check_version().is_err());
    }
}
