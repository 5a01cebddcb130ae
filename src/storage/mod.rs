// FILE: src/storage/mod.rs
pub mod backend;
pub mod local;
pub mod wal;

#[cfg(test)]
pub mod memory;

// Common exports
pub use backend::{Backend, BrokenVault, CleanupReport, DirEntry, HealthReport, Vault, VaultList};
pub use local::LocalBackend;
pub use wal::{Journal, RecoveryResult};
