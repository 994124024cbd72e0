//! Persistence of config snapshots keyed by serial number.
//!
//! Every config the database has run with is saved under the serial
//! number of its `NewConfig` transaction-log entry, so replay can
//! re-install the exact config that was active when each entry was
//! written. Pruning follows the TLS: once the log is pruned to serial
//! `n`, configs older than the newest one at or below `n` are dropped.

use crate::config::DocumentDbConfig;
use lodestone_core::SerialNum;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors from a config store.
#[derive(Debug, Error)]
pub enum ConfigStoreError {
    /// No config saved under the serial.
    #[error("no config stored for serial {serial}")]
    NotFound {
        /// The requested serial.
        serial: SerialNum,
    },

    /// Disk I/O failed.
    #[error("config store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored config did not deserialize.
    #[error("config store decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Store of config snapshots keyed by serial number.
pub trait ConfigStore: Send {
    /// Newest saved serial (0 = none saved).
    fn get_best_serial_num(&self) -> SerialNum;

    /// Oldest saved serial (0 = none saved).
    fn get_oldest_serial_num(&self) -> SerialNum;

    /// Largest saved serial <= `serial` (0 = none).
    fn get_prev_valid_serial(&self, serial: SerialNum) -> SerialNum;

    /// True when a config is saved under exactly `serial`.
    fn has_valid_serial(&self, serial: SerialNum) -> bool;

    /// Save a snapshot under `serial`.
    fn save_config(
        &mut self,
        config: &DocumentDbConfig,
        serial: SerialNum,
    ) -> Result<(), ConfigStoreError>;

    /// Load the snapshot saved under exactly `serial`.
    fn load_config(&self, serial: SerialNum) -> Result<Arc<DocumentDbConfig>, ConfigStoreError>;

    /// Drop configs made obsolete by a TLS prune to `serial`: everything
    /// older than the newest config at or below `serial`.
    fn prune(&mut self, serial: SerialNum);

    /// Drop configs that fail to load (startup hygiene).
    fn remove_invalid(&mut self);
}

// ============================================================================
// Memory store
// ============================================================================

/// In-memory [`ConfigStore`].
#[derive(Default)]
pub struct MemoryConfigStore {
    configs: BTreeMap<SerialNum, Arc<DocumentDbConfig>>,
}

impl MemoryConfigStore {
    /// An empty store.
    pub fn new() -> Self {
        MemoryConfigStore::default()
    }

    /// Number of stored configs.
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get_best_serial_num(&self) -> SerialNum {
        self.configs.keys().next_back().copied().unwrap_or(0)
    }

    fn get_oldest_serial_num(&self) -> SerialNum {
        self.configs.keys().next().copied().unwrap_or(0)
    }

    fn get_prev_valid_serial(&self, serial: SerialNum) -> SerialNum {
        self.configs
            .range(..=serial)
            .next_back()
            .map(|(s, _)| *s)
            .unwrap_or(0)
    }

    fn has_valid_serial(&self, serial: SerialNum) -> bool {
        self.configs.contains_key(&serial)
    }

    fn save_config(
        &mut self,
        config: &DocumentDbConfig,
        serial: SerialNum,
    ) -> Result<(), ConfigStoreError> {
        self.configs.insert(serial, Arc::new(config.clone()));
        Ok(())
    }

    fn load_config(&self, serial: SerialNum) -> Result<Arc<DocumentDbConfig>, ConfigStoreError> {
        self.configs
            .get(&serial)
            .cloned()
            .ok_or(ConfigStoreError::NotFound { serial })
    }

    fn prune(&mut self, serial: SerialNum) {
        let keep_from = self.get_prev_valid_serial(serial);
        if keep_from > 0 {
            self.configs.retain(|&s, _| s >= keep_from);
        }
    }

    fn remove_invalid(&mut self) {}
}

// ============================================================================
// File store
// ============================================================================

/// File-backed [`ConfigStore`]: one JSON file per serial under a
/// directory.
pub struct FileConfigStore {
    dir: PathBuf,
    index: BTreeMap<SerialNum, PathBuf>,
}

impl FileConfigStore {
    /// Open (or create) a store in `dir`, indexing existing files.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ConfigStoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut index = BTreeMap::new();
        for dirent in std::fs::read_dir(&dir)? {
            let path = dirent?.path();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if let Some(stem) = name
                .strip_prefix("config-")
                .and_then(|n| n.strip_suffix(".json"))
            {
                if let Ok(serial) = stem.parse::<SerialNum>() {
                    index.insert(serial, path);
                }
            }
        }
        debug!(dir = %dir.display(), configs = index.len(), "opened config store");
        Ok(FileConfigStore { dir, index })
    }

    fn path_for(&self, serial: SerialNum) -> PathBuf {
        self.dir.join(format!("config-{serial}.json"))
    }
}

impl ConfigStore for FileConfigStore {
    fn get_best_serial_num(&self) -> SerialNum {
        self.index.keys().next_back().copied().unwrap_or(0)
    }

    fn get_oldest_serial_num(&self) -> SerialNum {
        self.index.keys().next().copied().unwrap_or(0)
    }

    fn get_prev_valid_serial(&self, serial: SerialNum) -> SerialNum {
        self.index
            .range(..=serial)
            .next_back()
            .map(|(s, _)| *s)
            .unwrap_or(0)
    }

    fn has_valid_serial(&self, serial: SerialNum) -> bool {
        self.index.contains_key(&serial)
    }

    fn save_config(
        &mut self,
        config: &DocumentDbConfig,
        serial: SerialNum,
    ) -> Result<(), ConfigStoreError> {
        let path = self.path_for(serial);
        let bytes = serde_json::to_vec_pretty(config)?;
        std::fs::write(&path, bytes)?;
        self.index.insert(serial, path);
        Ok(())
    }

    fn load_config(&self, serial: SerialNum) -> Result<Arc<DocumentDbConfig>, ConfigStoreError> {
        let path = self
            .index
            .get(&serial)
            .ok_or(ConfigStoreError::NotFound { serial })?;
        let bytes = std::fs::read(path)?;
        Ok(Arc::new(serde_json::from_slice(&bytes)?))
    }

    fn prune(&mut self, serial: SerialNum) {
        let keep_from = self.get_prev_valid_serial(serial);
        if keep_from == 0 {
            return;
        }
        let doomed: Vec<SerialNum> = self.index.range(..keep_from).map(|(s, _)| *s).collect();
        for serial in doomed {
            if let Some(path) = self.index.remove(&serial) {
                let _ = std::fs::remove_file(path);
            }
        }
    }

    fn remove_invalid(&mut self) {
        let doomed: Vec<SerialNum> = self
            .index
            .iter()
            .filter(|(_, path)| {
                std::fs::read(path)
                    .ok()
                    .and_then(|bytes| {
                        serde_json::from_slice::<DocumentDbConfig>(&bytes).ok()
                    })
                    .is_none()
            })
            .map(|(s, _)| *s)
            .collect();
        for serial in doomed {
            if let Some(path) = self.index.remove(&serial) {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestone_core::{DocTypeName, DocumentTypeRepo, Schema};
    use tempfile::tempdir;

    fn config(generation: i64) -> DocumentDbConfig {
        DocumentDbConfig::new(
            generation,
            DocTypeName::new("t"),
            Schema::new(),
            DocumentTypeRepo::new(),
        )
    }

    #[test]
    fn test_memory_store_serial_queries() {
        let mut store = MemoryConfigStore::new();
        assert_eq!(store.get_best_serial_num(), 0);
        store.save_config(&config(1), 5).unwrap();
        store.save_config(&config(2), 9).unwrap();
        assert_eq!(store.get_best_serial_num(), 9);
        assert_eq!(store.get_oldest_serial_num(), 5);
        assert_eq!(store.get_prev_valid_serial(8), 5);
        assert_eq!(store.get_prev_valid_serial(9), 9);
        assert_eq!(store.get_prev_valid_serial(3), 0);
        assert!(store.has_valid_serial(5));
        assert!(!store.has_valid_serial(6));
    }

    #[test]
    fn test_memory_store_prune_keeps_baseline() {
        let mut store = MemoryConfigStore::new();
        store.save_config(&config(1), 2).unwrap();
        store.save_config(&config(2), 6).unwrap();
        store.save_config(&config(3), 10).unwrap();
        // TLS pruned to 8: config at 6 is the baseline, config at 2 goes.
        store.prune(8);
        assert!(!store.has_valid_serial(2));
        assert!(store.has_valid_serial(6));
        assert!(store.has_valid_serial(10));
    }

    #[test]
    fn test_file_store_roundtrip_and_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut store = FileConfigStore::open(dir.path()).unwrap();
            store.save_config(&config(7), 3).unwrap();
        }
        let store = FileConfigStore::open(dir.path()).unwrap();
        assert_eq!(store.get_best_serial_num(), 3);
        let loaded = store.load_config(3).unwrap();
        assert_eq!(loaded.generation, 7);
        assert!(matches!(
            store.load_config(4),
            Err(ConfigStoreError::NotFound { serial: 4 })
        ));
    }

    #[test]
    fn test_file_store_remove_invalid() {
        let dir = tempdir().unwrap();
        let mut store = FileConfigStore::open(dir.path()).unwrap();
        store.save_config(&config(1), 1).unwrap();
        std::fs::write(dir.path().join("config-2.json"), b"garbage").unwrap();
        let mut store = FileConfigStore::open(dir.path()).unwrap();
        assert!(store.has_valid_serial(2));
        store.remove_invalid();
        assert!(!store.has_valid_serial(2));
        assert!(store.has_valid_serial(1));
    }
}
