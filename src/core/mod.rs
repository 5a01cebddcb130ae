// FILE: src/core/mod.rs
pub mod lock_queue;
pub mod operations;

pub use lock_queue::{EnqueueOptions, LockQueue, QueueStats};
pub use operations::{Operation, OperationId, OperationState, OperationStore, OperationType};

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch. A clock before 1970 reads as zero.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
