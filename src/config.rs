// FILE: src/config.rs
//! Runtime knobs for the coordinator.
//!
//! Everything has a default; a JSON file may override any subset of fields.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const VAULT_DELETE_TIMEOUT_MS: u64 = 60_000;
pub const OPERATION_CLEANUP_DELAY_MS: u64 = 2_000;

/// Environment variable that overrides the data directory.
pub const DATA_DIR_ENV: &str = "VAULTSYNC_DATA_DIR";

/// Ceilings for one directory tree load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeLimits {
    pub max_depth: usize,
    pub max_entries_per_level: usize,
    pub max_total_nodes: usize,
    pub load_timeout_ms: u64,
    /// Entry names never shown in the tree.
    pub ignored_names: Vec<String>,
}

impl Default for TreeLimits {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_entries_per_level: 500,
            max_total_nodes: 10_000,
            load_timeout_ms: 30_000,
            ignored_names: vec![
                ".git".to_string(),
                ".DS_Store".to_string(),
                ".trash".to_string(),
                "node_modules".to_string(),
            ],
        }
    }
}

impl TreeLimits {
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How long a finished operation stays visible in the record store.
    pub operation_cleanup_delay_ms: u64,
    pub default_timeout_ms: u64,
    pub vault_delete_timeout_ms: u64,
    pub tree: TreeLimits,
    /// Where the local backend keeps its registry, journal and managed vaults.
    pub data_dir: Option<PathBuf>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            operation_cleanup_delay_ms: OPERATION_CLEANUP_DELAY_MS,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            vault_delete_timeout_ms: VAULT_DELETE_TIMEOUT_MS,
            tree: TreeLimits::default(),
            data_dir: None,
        }
    }
}

impl CoordinatorConfig {
    /// Read `path` if it exists, otherwise fall back to defaults.
    /// `VAULTSYNC_DATA_DIR` wins over whatever the file says.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(p)?;
                let parsed: CoordinatorConfig = serde_json::from_str(&content)?;
                tracing::info!("[Config] Loaded configuration from {}", p.display());
                parsed
            }
            Some(p) => {
                tracing::debug!("[Config] {} not found, using defaults", p.display());
                Self::default()
            }
            None => Self::default(),
        };

        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            if !dir.trim().is_empty() {
                config.data_dir = Some(PathBuf::from(dir));
            }
        }

        Ok(config)
    }

    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.operation_cleanup_delay_ms)
    }

    /// Resolved data directory: explicit setting, else the platform data dir.
    pub fn resolved_data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("vaultsync")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "default_timeout_ms": 5000, "tree": { "max_depth": 3 } }"#).unwrap();

        let config = CoordinatorConfig::load_or_default(Some(&path)).unwrap();
        assert_eq!(config.default_timeout_ms, 5000);
        assert_eq!(config.tree.max_depth, 3);
        assert_eq!(config.tree.max_entries_per_level, 500);
        assert_eq!(config.vault_delete_timeout_ms, VAULT_DELETE_TIMEOUT_MS);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = CoordinatorConfig::load_or_default(Some(Path::new("/nonexistent/vaultsync.json"))).unwrap();
        assert_eq!(config.operation_cleanup_delay_ms, 2_000);
        assert_eq!(config.tree.load_timeout(), Duration::from_secs(30));
    }
}
