//! The engine handle.
//!
//! [`Lix`] owns one state store, the plugin registry and the ancestry cache.
//! Everything that mutates the graph runs inside [`Lix::transaction`], which
//! reuses an already open transaction instead of starting a nested one.

use std::cell::RefCell;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock;
use crate::config::LixConfig;
use crate::error::{Error, Result};
use crate::graph::AncestryCache;
use crate::lock;
use crate::model::Version;
use crate::plugin::{FormatPlugin, PluginRegistry};
use crate::store::{MemoryStore, StateStore};
use crate::version;

/// Key-value row holding the active version pointer.
pub const ACTIVE_VERSION_KEY: &str = "lix_active_version";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActiveVersion {
    version_id: String,
}

/// One embedded engine instance.
pub struct Lix {
    pub(crate) store: Box<dyn StateStore>,
    pub(crate) ancestry: RefCell<AncestryCache>,
    plugins: PluginRegistry,
    config: LixConfig,
}

impl std::fmt::Debug for Lix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lix")
            .field("plugins", &self.plugins.keys())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Lix {
    /// Fresh in-memory engine with default configuration.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(LixConfig::default())
    }

    /// Fresh in-memory engine.
    pub fn open(config: LixConfig) -> Result<Self> {
        Self::with_store(Box::new(MemoryStore::new()), config)
    }

    /// Wrap an existing store, bootstrapping it if it has never been used.
    pub fn with_store(store: Box<dyn StateStore>, config: LixConfig) -> Result<Self> {
        let mut lix = Self {
            store,
            ancestry: RefCell::new(AncestryCache::with_capacity(
                config.graph.ancestry_cache_entries,
            )),
            plugins: PluginRegistry::with_builtin(),
            config,
        };
        version::bootstrap(&mut lix)?;
        Ok(lix)
    }

    /// Restore an engine from [`Lix::export_blob`] output.
    pub fn import_blob(bytes: &[u8], config: LixConfig) -> Result<Self> {
        let store = MemoryStore::import_blob(bytes)?;
        let lix = Self::with_store(Box::new(store), config)?;
        info!(bytes = bytes.len(), "imported blob");
        Ok(lix)
    }

    /// Snapshot of the whole instance, clock state included.
    pub fn export_blob(&self) -> Result<Vec<u8>> {
        if self.store.in_transaction() {
            return Err(Error::InvalidArgument(
                "cannot export while a transaction is open".to_string(),
            ));
        }
        let blob = self.store.export_blob()?;
        debug!(bytes = blob.len(), "exported blob");
        Ok(blob)
    }

    /// Open an engine persisted at `path`, or a fresh one when the file is absent.
    pub fn open_file(path: impl AsRef<Path>, config: LixConfig) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Self::open(config);
        }
        let bytes = lock::read_locked(path, config.persistence.lock_timeout_ms)?;
        Self::import_blob(&bytes, config)
    }

    /// Persist the exported blob atomically under a lock.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let blob = self.export_blob()?;
        lock::write_atomic_locked(path, &blob, self.config.persistence.lock_timeout_ms)
    }

    pub fn config(&self) -> &LixConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    pub fn register_plugin(&mut self, plugin: Arc<dyn FormatPlugin>) {
        self.plugins.register(plugin);
    }

    /// Run `f` atomically. Inside an open transaction `f` simply joins it;
    /// otherwise a transaction is started, committed on `Ok` and rolled back
    /// on `Err`.
    pub fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Lix) -> Result<T>,
    {
        if self.store.in_transaction() {
            return f(self);
        }

        self.store.begin_transaction()?;
        match f(self) {
            Ok(value) => {
                self.store.commit_transaction()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.store.rollback_transaction() {
                    warn!(error = %rollback_err, "rollback failed");
                }
                self.ancestry.borrow_mut().clear();
                debug!(error = %err, "transaction rolled back");
                Err(err)
            }
        }
    }

    /// Next id from the engine clock.
    pub fn next_id(&mut self) -> Result<String> {
        self.transaction(|lix| clock::next_id(lix.store.as_mut()))
    }

    /// Current time from the engine clock.
    pub fn now(&mut self) -> Result<chrono::DateTime<chrono::Utc>> {
        self.transaction(|lix| clock::now(lix.store.as_mut()))
    }

    pub fn is_deterministic_mode(&self) -> Result<bool> {
        clock::is_deterministic(self.store.as_ref())
    }

    pub fn set_deterministic_mode(&mut self, enabled: bool) -> Result<()> {
        self.transaction(|lix| clock::set_deterministic(lix.store.as_mut(), enabled))?;
        info!(enabled, "deterministic mode toggled");
        Ok(())
    }

    /// The version currently marked active.
    pub fn active_version(&self) -> Result<Version> {
        let value = self
            .store
            .kv_get(ACTIVE_VERSION_KEY)?
            .ok_or_else(|| Error::not_found("active version", ACTIVE_VERSION_KEY))?;
        let active: ActiveVersion = serde_json::from_value(value)?;
        version::get_version(self, &active.version_id)
    }

    /// Point the active-version row at another version.
    pub fn switch_version(&mut self, version_id: &str) -> Result<Version> {
        let target = version::get_version(self, version_id)?;
        self.transaction(|lix| {
            let row = ActiveVersion {
                version_id: target.id.clone(),
            };
            lix.store
                .kv_set(ACTIVE_VERSION_KEY, serde_json::to_value(row)?)
        })?;
        info!(version = %target.id, name = %target.name, "switched active version");
        Ok(target)
    }
}
