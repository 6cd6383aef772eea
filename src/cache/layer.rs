//! Cache layer that orchestrates caching logic with network fetching.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use super::inflight::Coalescer;
use super::storage::ResponseCache;
use super::traits::{CacheResult, CacheSource};
use crate::error::SyncError;

/// A cached value together with when it was stored.
#[derive(Debug, Clone)]
struct Stored {
  value: Value,
  cached_at: DateTime<Utc>,
}

/// Read-through cache with in-flight coalescing.
///
/// This layer sits between the service client and the gateway: a live cache
/// entry is returned without touching the network, concurrent misses for the
/// same key share one fetch, and only successful fetches are stored.
#[derive(Clone, Default)]
pub struct CacheLayer {
  cache: ResponseCache<Stored>,
  inflight: Coalescer<Result<(Stored, CacheSource), SyncError>>,
}

impl CacheLayer {
  pub fn new() -> Self {
    Self::default()
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Live cache entry - return immediately
  /// 2. Fetch already running for `key` - await its result
  /// 3. Otherwise run `fetcher`, storing the value for `ttl` on success
  pub async fn fetch<F, Fut>(
    &self,
    key: &str,
    ttl: Duration,
    fetcher: F,
  ) -> Result<CacheResult<Value>, SyncError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, SyncError>> + Send + 'static,
  {
    if let Some(stored) = self.cache.get(key) {
      debug!(key, "Cache hit");
      return Ok(CacheResult::from_cache(stored.value, stored.cached_at));
    }

    self.fetch_shared(key, ttl, fetcher).await
  }

  /// Join or start the shared fetch for `key`.
  async fn fetch_shared<F, Fut>(
    &self,
    key: &str,
    ttl: Duration,
    fetcher: F,
  ) -> Result<CacheResult<Value>, SyncError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, SyncError>> + Send + 'static,
  {
    let cache = self.cache.clone();
    let owned_key = key.to_string();
    let (stored, source) = self
      .inflight
      .run(key, move || {
        let fetch = fetcher();
        async move {
          // A run that finished after our cache check already stored the value
          if let Some(stored) = cache.get(&owned_key) {
            debug!(key = %owned_key, "Cache filled while joining");
            return Ok((stored, CacheSource::Cache));
          }

          let value = fetch.await?;
          // Stored before the in-flight handle goes away so a late caller
          // either joins this run or sees the entry
          let stored = Stored {
            value,
            cached_at: Utc::now(),
          };
          cache.set(&owned_key, stored.clone(), ttl);
          Ok::<_, SyncError>((stored, CacheSource::Network))
        }
      })
      .await?;

    Ok(match source {
      CacheSource::Cache => CacheResult::from_cache(stored.value, stored.cached_at),
      CacheSource::Network => CacheResult::from_network(stored.value),
    })
  }

  /// Peek at a live entry without fetching.
  pub fn get(&self, key: &str) -> Option<Value> {
    self.cache.get(key).map(|stored| stored.value)
  }

  /// Drop a single entry, e.g. after a write that changes it.
  pub fn invalidate(&self, key: &str) -> bool {
    self.cache.delete(key)
  }

  pub fn clear(&self) {
    self.cache.clear();
  }

  pub fn is_in_flight(&self, key: &str) -> bool {
    self.inflight.is_in_flight(key)
  }
}
