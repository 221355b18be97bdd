//! Standard filesystem paths for Stevedore.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for Stevedore data.
///
/// `STEVEDORE_ROOT` wins over the platform data directory.
pub static STEVEDORE_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("STEVEDORE_ROOT").map_or_else(
        |_| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("stevedore")
        },
        PathBuf::from,
    )
});

/// Default location of the configuration file.
pub static STEVEDORE_CONFIG: Lazy<PathBuf> = Lazy::new(|| {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/etc"))
        .join("stevedore")
        .join("stevedore.toml")
});

/// Standard paths used by Stevedore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StevedorePaths {
    /// Root data directory.
    pub root: PathBuf,
}

impl StevedorePaths {
    /// Create paths with the default root.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the state envelopes.
    #[must_use]
    pub fn state(&self) -> PathBuf {
        self.root.join("state")
    }

    /// State envelope for one entity kind (e.g. `installed`).
    #[must_use]
    pub fn state_file(&self, kind: &str) -> PathBuf {
        self.state().join(format!("{kind}.json"))
    }

    /// Directory for generated files (proxy routes, certificates).
    #[must_use]
    pub fn generated(&self) -> PathBuf {
        self.root.join("generated")
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.state())?;
        std::fs::create_dir_all(self.generated())?;
        Ok(())
    }
}

impl Default for StevedorePaths {
    fn default() -> Self {
        Self {
            root: STEVEDORE_ROOT.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_root() {
        let paths = StevedorePaths::with_root("/tmp/stevedore-test");
        assert_eq!(paths.state(), PathBuf::from("/tmp/stevedore-test/state"));
        assert_eq!(
            paths.state_file("installed"),
            PathBuf::from("/tmp/stevedore-test/state/installed.json")
        );
    }

    #[test]
    fn default_root_ends_in_stevedore() {
        let paths = StevedorePaths::new();
        if std::env::var("STEVEDORE_ROOT").is_err() {
            assert!(paths.root.ends_with("stevedore"));
        }
    }
}
