// FILE: src/engine/mod.rs
//! Work that runs on top of the queue: tree loading and editor/vault synchronisation.

pub mod sync_service;
pub mod tree_loader;

pub use sync_service::{ConflictCheck, ConflictKind, DeletionReadiness, SaveHandler, SaveOutcome, SyncService};
pub use tree_loader::{FileNode, LoadState, TreeLoader, TreeSnapshot};
