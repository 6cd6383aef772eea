//! Response caching for idempotent reads.
//!
//! This module provides:
//! - A TTL-based in-memory store keyed by request fingerprint
//! - In-flight coalescing so concurrent identical reads share one network call
//! - Stable fingerprints that ignore object key order

mod fingerprint;
mod inflight;
mod layer;
mod storage;
mod traits;

pub use fingerprint::{canonical_json, fingerprint, HashAlgorithm};
pub use inflight::Coalescer;
pub use layer::CacheLayer;
pub use storage::ResponseCache;
pub use traits::{CacheResult, CacheSource};
