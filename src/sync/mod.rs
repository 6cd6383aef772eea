//! Deferred replay of queued writes.

mod processor;
mod trigger;

pub use processor::{DrainReport, SyncProcessor};
pub use trigger::{SyncTrigger, DEFAULT_SYNC_TAG};
