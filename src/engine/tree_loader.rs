// FILE: src/engine/tree_loader.rs
//! Bounded directory tree loader.
//!
//! Depth-first walk of a vault through the backend with hard ceilings:
//! - depth: folders past `max_depth` are listed but not expanded
//! - width: after `max_entries_per_level` entries a single "N more items" leaf is added
//! - size: once `max_total_nodes` real nodes exist, nothing more is added
//! - cycles: a folder whose canonical path was already visited is flagged, not entered
//! - time: one timer for the whole walk; on expiry the walk is told to abort and stops
//!   issuing backend calls
//!
//! A folder that fails to list gets its own `error` and the walk moves on.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::TreeLimits;
use crate::core::lock_queue::{EnqueueOptions, LockQueue, CATEGORY_TREE};
use crate::core::operations::OperationType;
use crate::error::{CoordError, Result};
use crate::storage::backend::{join_path, Backend, DirEntry};

/// Extra room for the queue timer so the loader's own timer always fires first.
const QUEUE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNode {
    pub name: String,
    pub path: String,
    pub is_directory: bool,
    /// `None` for files and for folders that were not expanded.
    pub children: Option<Vec<FileNode>>,
    pub is_cycle: bool,
    /// Synthetic "N more items" leaf.
    pub is_placeholder: bool,
    pub error: Option<String>,
}

impl FileNode {
    fn from_entry(entry: DirEntry) -> Self {
        Self {
            name: entry.name,
            path: entry.path,
            is_directory: entry.is_directory,
            children: None,
            is_cycle: false,
            is_placeholder: false,
            error: None,
        }
    }

    fn more_items(parent: &str, remaining: usize) -> Self {
        let noun = if remaining == 1 { "item" } else { "items" };
        Self {
            name: format!("{} more {}", remaining, noun),
            path: join_path(parent, "__more__"),
            is_directory: false,
            children: None,
            is_cycle: false,
            is_placeholder: true,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    Idle,
    Loading,
    Succeeded,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeSnapshot {
    pub vault_id: String,
    pub root_path: String,
    pub nodes: Vec<FileNode>,
    pub total_nodes: usize,
    /// Some ceiling (width or total size) cut the tree short.
    pub truncated: bool,
    pub elapsed_ms: u64,
}

#[derive(Clone)]
pub struct TreeLoader {
    backend: Arc<dyn Backend>,
    queue: LockQueue,
    limits: TreeLimits,
    states: Arc<Mutex<HashMap<String, LoadState>>>,
}

impl TreeLoader {
    pub fn new(backend: Arc<dyn Backend>, queue: LockQueue, limits: TreeLimits) -> Self {
        Self {
            backend,
            queue,
            limits,
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn limits(&self) -> &TreeLimits {
        &self.limits
    }

    /// State of the most recent load of `root_path`.
    pub fn load_state(&self, root_path: &str) -> LoadState {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(root_path)
            .copied()
            .unwrap_or(LoadState::Idle)
    }

    fn set_state(&self, root_path: &str, state: LoadState) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(root_path.to_string(), state);
    }

    /// Build a snapshot of `root_path`. Runs in the tree queue (no resource lock:
    /// loads of different vaults are fine) and is tracked as a `tree_load` operation.
    pub async fn load_directory(&self, vault_id: &str, root_path: &str) -> Result<TreeSnapshot> {
        self.set_state(root_path, LoadState::Loading);
        tracing::info!("[TreeLoader] Loading tree for vault {} at {}", vault_id, root_path);

        let backend = Arc::clone(&self.backend);
        let limits = self.limits.clone();
        let vault = vault_id.to_string();
        let root = root_path.to_string();
        let queue_timeout = limits.load_timeout() + QUEUE_GRACE;

        let result = self
            .queue
            .enqueue(
                CATEGORY_TREE,
                move || Self::traverse(backend, limits, vault, root),
                EnqueueOptions::default()
                    .tracked(OperationType::TreeLoad)
                    .timeout(queue_timeout)
                    .describe(format!("load tree {}", root_path))
                    .metadata(serde_json::json!({ "vaultId": vault_id, "rootPath": root_path })),
            )
            .await;

        match &result {
            Ok(snapshot) => {
                self.set_state(root_path, LoadState::Succeeded);
                tracing::info!(
                    "[TreeLoader] Loaded {} nodes for {} in {}ms{}",
                    snapshot.total_nodes,
                    root_path,
                    snapshot.elapsed_ms,
                    if snapshot.truncated { " (truncated)" } else { "" }
                );
            }
            Err(e) if e.is_timeout() => {
                self.set_state(root_path, LoadState::TimedOut);
                tracing::warn!("[TreeLoader] Load of {} timed out", root_path);
            }
            Err(e) => {
                self.set_state(root_path, LoadState::Failed);
                tracing::error!("[TreeLoader] Load of {} failed: {}", root_path, e);
            }
        }
        result
    }

    async fn traverse(
        backend: Arc<dyn Backend>,
        limits: TreeLimits,
        vault_id: String,
        root: String,
    ) -> Result<TreeSnapshot> {
        let started = Instant::now();
        let timeout = limits.load_timeout();
        let cancel = CancellationToken::new();

        let mut walk = Traversal {
            backend,
            limits,
            visited: HashSet::new(),
            total_nodes: 0,
            truncated: false,
            cancel: cancel.clone(),
        };

        let walk_root = root.clone();
        let mut handle = tokio::spawn(async move {
            let root_canonical = walk.canonical(&walk_root).await;
            walk.visited.insert(root_canonical);
            let nodes = walk.walk(&walk_root, 0).await;
            (nodes, walk.total_nodes, walk.truncated)
        });

        tokio::select! {
            joined = &mut handle => {
                let (nodes, total_nodes, truncated) = joined.map_err(|e| {
                    CoordError::Aborted(format!("tree walk of {} stopped: {}", root, e))
                })?;
                Ok(TreeSnapshot {
                    vault_id,
                    root_path: root,
                    nodes: nodes?,
                    total_nodes,
                    truncated,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
            _ = tokio::time::sleep(timeout) => {
                // The walk sees this at its next boundary and stops on its own.
                cancel.cancel();
                Err(CoordError::Timeout {
                    operation: format!("load tree {}", root),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

/// State of one walk. Owned by the walking task and lent down the recursion,
/// so two loads never share a visited set.
struct Traversal {
    backend: Arc<dyn Backend>,
    limits: TreeLimits,
    visited: HashSet<String>,
    total_nodes: usize,
    truncated: bool,
    cancel: CancellationToken,
}

impl Traversal {
    fn aborted(&self) -> CoordError {
        CoordError::Aborted("tree load cancelled".to_string())
    }

    async fn canonical(&self, path: &str) -> String {
        let resolved = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return path.to_string(),
            r = self.backend.get_canonical_path(path) => r,
        };
        match resolved {
            Ok(canonical) => canonical,
            Err(e) => {
                tracing::debug!("[TreeLoader] No canonical path for {}: {}", path, e);
                path.to_string()
            }
        }
    }

    async fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(self.aborted()),
            r = self.backend.list_directory(path) => r,
        }
    }

    fn walk<'a>(&'a mut self, path: &'a str, depth: usize) -> BoxFuture<'a, Result<Vec<FileNode>>> {
        Box::pin(async move {
            if self.cancel.is_cancelled() {
                return Err(self.aborted());
            }

            let mut entries = self.list(path).await?;
            entries.retain(|e| !self.limits.ignored_names.iter().any(|n| *n == e.name));
            entries.sort_by(|a, b| {
                b.is_directory
                    .cmp(&a.is_directory)
                    .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            });

            let total = entries.len();
            let mut nodes = Vec::with_capacity(total.min(self.limits.max_entries_per_level + 1));

            for (idx, entry) in entries.into_iter().enumerate() {
                if self.cancel.is_cancelled() {
                    return Err(self.aborted());
                }
                if idx >= self.limits.max_entries_per_level {
                    nodes.push(FileNode::more_items(path, total - idx));
                    self.truncated = true;
                    break;
                }
                if self.total_nodes >= self.limits.max_total_nodes {
                    self.truncated = true;
                    break;
                }
                self.total_nodes += 1;

                let mut node = FileNode::from_entry(entry);
                if node.is_directory && depth + 1 < self.limits.max_depth {
                    let canonical = self.canonical(&node.path).await;
                    if !self.visited.insert(canonical) {
                        tracing::debug!("[TreeLoader] Cycle at {}", node.path);
                        node.is_cycle = true;
                        node.children = Some(Vec::new());
                    } else {
                        let child_path = node.path.clone();
                        match self.walk(&child_path, depth + 1).await {
                            Ok(children) => node.children = Some(children),
                            Err(CoordError::Aborted(reason)) => return Err(CoordError::Aborted(reason)),
                            Err(e) => {
                                tracing::warn!("[TreeLoader] Could not list {}: {}", child_path, e);
                                node.error = Some(e.to_string());
                                node.children = Some(Vec::new());
                            }
                        }
                    }
                }
                nodes.push(node);
            }

            Ok(nodes)
        })
    }
}
