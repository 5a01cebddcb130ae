// FILE: src/storage/backend.rs
//! The backend boundary: everything that actually touches disk or the vault registry.
//!
//! The coordinator only ever sees this trait. Calls are plain async requests with no
//! cancellation contract; a call that is abandoned by a timeout may still finish.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vault {
    pub id: String,
    pub name: String,
    pub path: String,
    pub created_at: u64,
    pub last_opened: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultList {
    pub vaults: Vec<Vault>,
    pub last_vault_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokenVault {
    pub id: String,
    pub name: String,
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: Vec<String>,
    pub broken: Vec<BrokenVault>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub cleaned: usize,
    pub cleaned_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    pub path: String,
    pub is_directory: bool,
}

#[async_trait]
pub trait Backend: Send + Sync {
    // Vault registry
    async fn list_vaults(&self) -> Result<VaultList>;
    async fn create_vault(&self, name: &str) -> Result<Vault>;
    async fn add_external_vault(&self, path: &str, name: &str) -> Result<Vault>;
    async fn open_vault(&self, vault_id: &str) -> Result<Vault>;
    async fn delete_vault(&self, vault_id: &str, delete_files: bool) -> Result<()>;
    async fn remove_broken_vault(&self, vault_id: &str) -> Result<()>;
    async fn check_vault_health(&self) -> Result<HealthReport>;
    async fn cleanup_all_broken_vaults(&self) -> Result<CleanupReport>;

    // Files
    async fn read_file(&self, path: &str) -> Result<String>;
    async fn write_file(&self, path: &str, content: &str) -> Result<()>;
    async fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>>;
    async fn create_directory(&self, path: &str) -> Result<()>;
    async fn delete_path(&self, path: &str) -> Result<()>;
    async fn rename_path(&self, old_path: &str, new_path: &str) -> Result<()>;
    async fn get_canonical_path(&self, path: &str) -> Result<String>;
}

/// Join a child name onto a backend path using `/`, the separator every backend path uses.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Parent of a backend path, if it has one.
pub fn parent_path(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    trimmed.rfind('/').map(|idx| if idx == 0 { "/" } else { &trimmed[..idx] })
}
