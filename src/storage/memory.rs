// FILE: src/storage/memory.rs
//! Scripted in-memory backend for tests.
//!
//! Holds a tiny directory tree with symlinks, a vault registry, failure injection
//! and "gates" that park a call until the test releases it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::core::now_millis;
use crate::error::{CoordError, Result};
use crate::storage::backend::{
    join_path, parent_path, Backend, BrokenVault, CleanupReport, DirEntry, HealthReport, Vault,
    VaultList,
};

#[derive(Default)]
struct MemState {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, String>,
    links: HashMap<String, String>,
    vaults: Vec<Vault>,
    last_vault_id: Option<String>,
    gates: HashMap<&'static str, VecDeque<oneshot::Receiver<()>>>,
    failures: HashSet<(&'static str, String)>,
    calls: Vec<(&'static str, String)>,
}

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_dir(&self, path: &str) {
        let mut st = self.lock();
        let mut current = Some(path.to_string());
        while let Some(p) = current {
            if p == "/" || p.is_empty() {
                break;
            }
            current = parent_path(&p).map(str::to_string);
            st.dirs.insert(p);
        }
    }

    pub fn add_file(&self, path: &str, content: &str) {
        if let Some(parent) = parent_path(path) {
            self.add_dir(parent);
        }
        self.lock().files.insert(path.to_string(), content.to_string());
    }

    pub fn add_symlink(&self, path: &str, target: &str) {
        self.lock().links.insert(path.to_string(), target.to_string());
    }

    pub fn add_vault(&self, id: &str, name: &str, path: &str) {
        self.add_dir(path);
        self.lock().vaults.push(Vault {
            id: id.to_string(),
            name: name.to_string(),
            path: path.to_string(),
            created_at: now_millis(),
            last_opened: None,
        });
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.lock().files.get(path).cloned()
    }

    pub fn exists(&self, path: &str) -> bool {
        let st = self.lock();
        st.dirs.contains(path) || st.files.contains_key(path)
    }

    /// Make every call of `method` on `path` fail.
    pub fn fail_on(&self, method: &'static str, path: &str) {
        self.lock().failures.insert((method, path.to_string()));
    }

    /// Park the next call of `method` until the returned sender fires (or is dropped).
    pub fn gate(&self, method: &'static str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.lock().gates.entry(method).or_default().push_back(rx);
        tx
    }

    pub fn calls(&self, method: &str) -> usize {
        self.lock().calls.iter().filter(|(m, _)| *m == method).count()
    }

    pub fn calls_for(&self, method: &str, arg: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|(m, a)| *m == method && a == arg)
            .count()
    }

    async fn enter(&self, method: &'static str, arg: &str) -> Result<()> {
        let gate = {
            let mut st = self.lock();
            st.calls.push((method, arg.to_string()));
            st.gates.get_mut(method).and_then(VecDeque::pop_front)
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.lock().failures.contains(&(method, arg.to_string())) {
            return Err(CoordError::backend(method, format!("injected failure for {}", arg)));
        }
        Ok(())
    }

    fn resolve(st: &MemState, path: &str) -> String {
        let mut resolved = path.to_string();
        // Bounded so a self-referencing link cannot spin forever.
        for _ in 0..32 {
            let mut changed = false;
            for (link, target) in &st.links {
                if resolved == *link {
                    resolved = target.clone();
                    changed = true;
                } else if let Some(rest) = resolved.strip_prefix(&format!("{}/", link)) {
                    resolved = join_path(target, rest);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        resolved
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn list_vaults(&self) -> Result<VaultList> {
        self.enter("list_vaults", "").await?;
        let st = self.lock();
        Ok(VaultList {
            vaults: st.vaults.clone(),
            last_vault_id: st.last_vault_id.clone(),
        })
    }

    async fn create_vault(&self, name: &str) -> Result<Vault> {
        self.enter("create_vault", name).await?;
        let id = format!("vault-{}", name);
        let path = format!("/vaults/{}", name);
        self.add_vault(&id, name, &path);
        self.add_file(&join_path(&path, "Welcome.md"), "# Welcome\n");
        self.lock()
            .vaults
            .iter()
            .find(|v| v.id == id)
            .cloned()
            .ok_or_else(|| CoordError::NotFound(id))
    }

    async fn add_external_vault(&self, path: &str, name: &str) -> Result<Vault> {
        self.enter("add_external_vault", path).await?;
        if !self.lock().dirs.contains(path) {
            return Err(CoordError::NotFound(path.to_string()));
        }
        let id = format!("ext-{}", name);
        self.add_vault(&id, name, path);
        Ok(Vault {
            id,
            name: name.to_string(),
            path: path.to_string(),
            created_at: now_millis(),
            last_opened: None,
        })
    }

    async fn open_vault(&self, vault_id: &str) -> Result<Vault> {
        self.enter("open_vault", vault_id).await?;
        let mut st = self.lock();
        st.last_vault_id = Some(vault_id.to_string());
        let vault = st
            .vaults
            .iter_mut()
            .find(|v| v.id == vault_id)
            .ok_or_else(|| CoordError::NotFound(vault_id.to_string()))?;
        vault.last_opened = Some(now_millis());
        Ok(vault.clone())
    }

    async fn delete_vault(&self, vault_id: &str, delete_files: bool) -> Result<()> {
        self.enter("delete_vault", vault_id).await?;
        let mut st = self.lock();
        let idx = st
            .vaults
            .iter()
            .position(|v| v.id == vault_id)
            .ok_or_else(|| CoordError::NotFound(vault_id.to_string()))?;
        let vault = st.vaults.remove(idx);
        if delete_files {
            let prefix = format!("{}/", vault.path);
            st.dirs.retain(|d| *d != vault.path && !d.starts_with(&prefix));
            st.files.retain(|f, _| !f.starts_with(&prefix));
        }
        if st.last_vault_id.as_deref() == Some(vault_id) {
            st.last_vault_id = None;
        }
        Ok(())
    }

    async fn remove_broken_vault(&self, vault_id: &str) -> Result<()> {
        self.enter("remove_broken_vault", vault_id).await?;
        self.lock().vaults.retain(|v| v.id != vault_id);
        Ok(())
    }

    async fn check_vault_health(&self) -> Result<HealthReport> {
        self.enter("check_vault_health", "").await?;
        let st = self.lock();
        let mut report = HealthReport::default();
        for v in &st.vaults {
            if st.dirs.contains(&v.path) {
                report.healthy.push(v.id.clone());
            } else {
                report.broken.push(BrokenVault {
                    id: v.id.clone(),
                    name: v.name.clone(),
                    path: v.path.clone(),
                    reason: "folder missing".to_string(),
                });
            }
        }
        Ok(report)
    }

    async fn cleanup_all_broken_vaults(&self) -> Result<CleanupReport> {
        self.enter("cleanup_all_broken_vaults", "").await?;
        let mut st = self.lock();
        let broken: Vec<String> = st
            .vaults
            .iter()
            .filter(|v| !st.dirs.contains(&v.path))
            .map(|v| v.id.clone())
            .collect();
        st.vaults.retain(|v| !broken.contains(&v.id));
        Ok(CleanupReport {
            cleaned: broken.len(),
            cleaned_ids: broken,
        })
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        self.enter("read_file", path).await?;
        self.lock()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| CoordError::NotFound(path.to_string()))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.enter("write_file", path).await?;
        self.lock().files.insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.enter("list_directory", path).await?;
        let st = self.lock();
        let real = Self::resolve(&st, path);
        if !st.dirs.contains(&real) {
            return Err(CoordError::NotFound(path.to_string()));
        }

        let mut entries = Vec::new();
        let child_name = |candidate: &str| -> Option<String> {
            match parent_path(candidate) {
                Some(parent) if parent == real => {
                    candidate.rsplit('/').next().map(str::to_string)
                }
                _ => None,
            }
        };
        for dir in &st.dirs {
            if let Some(name) = child_name(dir) {
                entries.push(DirEntry { path: join_path(path, &name), name, is_directory: true });
            }
        }
        for file in st.files.keys() {
            if let Some(name) = child_name(file) {
                entries.push(DirEntry { path: join_path(path, &name), name, is_directory: false });
            }
        }
        for (link, target) in &st.links {
            if let Some(name) = child_name(link) {
                let is_directory = st.dirs.contains(&Self::resolve(&st, target));
                entries.push(DirEntry { path: join_path(path, &name), name, is_directory });
            }
        }
        Ok(entries)
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        self.enter("create_directory", path).await?;
        self.add_dir(path);
        Ok(())
    }

    async fn delete_path(&self, path: &str) -> Result<()> {
        self.enter("delete_path", path).await?;
        let mut st = self.lock();
        let prefix = format!("{}/", path);
        let removed_file = st.files.remove(path).is_some();
        let removed_dir = st.dirs.remove(path);
        let existed = removed_file || removed_dir;
        st.dirs.retain(|d| !d.starts_with(&prefix));
        st.files.retain(|f, _| !f.starts_with(&prefix));
        if existed {
            Ok(())
        } else {
            Err(CoordError::NotFound(path.to_string()))
        }
    }

    async fn rename_path(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.enter("rename_path", old_path).await?;
        let mut st = self.lock();
        let content = st
            .files
            .remove(old_path)
            .ok_or_else(|| CoordError::NotFound(old_path.to_string()))?;
        st.files.insert(new_path.to_string(), content);
        Ok(())
    }

    async fn get_canonical_path(&self, path: &str) -> Result<String> {
        self.enter("get_canonical_path", path).await?;
        Ok(Self::resolve(&self.lock(), path))
    }
}
