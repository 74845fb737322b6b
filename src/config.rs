//! Configuration loading and management
//!
//! Handles parsing of `lix.toml` configuration files.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LixConfig {
    /// Id/clock configuration
    #[serde(default)]
    pub clock: ClockConfig,

    /// Well-known versions created at bootstrap
    #[serde(default)]
    pub versions: VersionsConfig,

    /// Checkout configuration
    #[serde(default)]
    pub checkout: CheckoutConfig,

    /// On-disk persistence
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Change graph tuning
    #[serde(default)]
    pub graph: GraphConfig,
}

/// Clock configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClockConfig {
    /// Start a fresh engine in deterministic mode
    #[serde(default)]
    pub deterministic: bool,
}

/// Bootstrap versions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionsConfig {
    /// Id of the root version every other version inherits from by default
    #[serde(default = "default_global_id")]
    pub global_id: String,

    #[serde(default = "default_global_name")]
    pub global_name: String,

    /// Name of the version that is active after bootstrap
    #[serde(default = "default_main_name")]
    pub main_name: String,
}

fn default_global_id() -> String {
    "global".to_string()
}

fn default_global_name() -> String {
    "global".to_string()
}

fn default_main_name() -> String {
    "main".to_string()
}

impl Default for VersionsConfig {
    fn default() -> Self {
        Self {
            global_id: default_global_id(),
            global_name: default_global_name(),
            main_name: default_main_name(),
        }
    }
}

/// Checkout configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutConfig {
    /// Name prefix of the hidden versions checkouts materialize into
    #[serde(default = "default_interim_prefix")]
    pub interim_prefix: String,
}

fn default_interim_prefix() -> String {
    "checkout".to_string()
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            interim_prefix: default_interim_prefix(),
        }
    }
}

/// Persistence configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// How long to wait for the engine file lock
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_lock_timeout_ms() -> u64 {
    crate::lock::DEFAULT_LOCK_TIMEOUT_MS
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

/// Change graph configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Ancestor closures memoized before the oldest is evicted
    #[serde(default = "default_ancestry_cache_entries")]
    pub ancestry_cache_entries: usize,
}

fn default_ancestry_cache_entries() -> usize {
    crate::graph::DEFAULT_ANCESTRY_CACHE_ENTRIES
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            ancestry_cache_entries: default_ancestry_cache_entries(),
        }
    }
}

impl LixConfig {
    /// Load configuration from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: LixConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `lix.toml` from a directory, or return defaults
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join("lix.toml");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        if self.versions.global_id.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "versions.global_id cannot be empty".to_string(),
            ));
        }
        if self.versions.main_name.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "versions.main_name cannot be empty".to_string(),
            ));
        }
        if self.checkout.interim_prefix.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "checkout.interim_prefix cannot be empty".to_string(),
            ));
        }
        if self.persistence.lock_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "persistence.lock_timeout_ms must be positive".to_string(),
            ));
        }
        if self.graph.ancestry_cache_entries == 0 {
            return Err(Error::InvalidConfig(
                "graph.ancestry_cache_entries must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = LixConfig::from_toml("").unwrap();
        assert_eq!(config, LixConfig::default());
        assert_eq!(config.versions.global_id, "global");
        assert!(!config.clock.deterministic);
    }

    #[test]
    fn load_parses_overrides() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("lix.toml");
        let content = r#"
[clock]
deterministic = true

[versions]
main_name = "trunk"

[checkout]
interim_prefix = "preview"
"#;
        std::fs::write(&path, content).unwrap();

        let config = LixConfig::load_from_dir(dir.path()).unwrap();
        assert!(config.clock.deterministic);
        assert_eq!(config.versions.main_name, "trunk");
        assert_eq!(config.versions.global_id, "global");
        assert_eq!(config.checkout.interim_prefix, "preview");
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = LixConfig::load_from_dir(dir.path()).unwrap();
        assert_eq!(config, LixConfig::default());
    }

    #[test]
    fn zero_cache_entries_is_rejected() {
        let result = LixConfig::from_toml("[graph]\nancestry_cache_entries = 0\n");
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn empty_global_id_is_rejected() {
        let result = LixConfig::from_toml("[versions]\nglobal_id = \" \"\n");
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
