//! Offline-resilient sync engine for the Epicare backend.
//!
//! Writes that cannot reach the service are persisted in a durable queue and
//! replayed later by a background worker; idempotent reads are cached and
//! coalesced; listeners are told about sync progress over a broadcast channel.

pub mod app;
pub mod cache;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod notify;
pub mod queue;
pub mod session;
pub mod sync;
pub mod worker;

pub use error::{Result, SyncError};
