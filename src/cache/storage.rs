//! In-memory response cache with per-entry TTL.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// A cached value and the instant it stops being served.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
  value: V,
  expires_at: Instant,
}

/// Process-lifetime cache keyed by request fingerprint.
///
/// Expired entries are evicted lazily when looked up, never swept.
#[derive(Debug)]
pub struct ResponseCache<V> {
  entries: Arc<Mutex<HashMap<String, CacheEntry<V>>>>,
}

impl<V> Clone for ResponseCache<V> {
  fn clone(&self) -> Self {
    Self {
      entries: Arc::clone(&self.entries),
    }
  }
}

impl<V> Default for ResponseCache<V> {
  fn default() -> Self {
    Self {
      entries: Arc::new(Mutex::new(HashMap::new())),
    }
  }
}

impl<V: Clone> ResponseCache<V> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Get a live value; an expired entry is removed and reported absent.
  pub fn get(&self, key: &str) -> Option<V> {
    let mut entries = self.lock();
    let expired = match entries.get(key) {
      Some(entry) => Instant::now() >= entry.expires_at,
      None => return None,
    };

    if expired {
      entries.remove(key);
      return None;
    }
    entries.get(key).map(|entry| entry.value.clone())
  }

  pub fn set(&self, key: &str, value: V, ttl: Duration) {
    let entry = CacheEntry {
      value,
      expires_at: Instant::now() + ttl,
    };
    self.lock().insert(key.to_string(), entry);
  }

  pub fn delete(&self, key: &str) -> bool {
    self.lock().remove(key).is_some()
  }

  pub fn clear(&self) {
    self.lock().clear();
  }

  /// Number of stored entries, including expired ones not yet evicted.
  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<V>>> {
    // Entries are plain data; a panic elsewhere cannot leave them half-written
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }
}
