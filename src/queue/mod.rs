//! Durable write-behind queue.
//!
//! - Pending writes (`sync_queue`), replayed in enqueue order
//! - Records created while offline (`offline_records`), kept for audit
//! - The queue-on-failure path used by intercepted and foreground writes

mod outbox;
mod storage;
mod types;

pub use outbox::WriteQueue;
pub use storage::{QueueStorage, SqliteQueue};
pub use types::{NewQueueEntry, OfflineRecord, QueueEntry, DEFAULT_MAX_RETRIES};

#[cfg(test)]
pub(crate) use outbox::tests::BrokenStore;
