//! In-flight coalescing: concurrent callers with the same key share one operation.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

type SharedOp<T> = Shared<BoxFuture<'static, T>>;
type InFlightMap<T> = Arc<Mutex<HashMap<String, SharedOp<T>>>>;

/// At most one live operation per key.
///
/// The first caller for a key starts the operation; callers arriving while it
/// runs await the same result. The handle is removed when the operation
/// settles, whether it succeeded or failed.
pub struct Coalescer<T> {
  inflight: InFlightMap<T>,
}

impl<T> Clone for Coalescer<T> {
  fn clone(&self) -> Self {
    Self {
      inflight: Arc::clone(&self.inflight),
    }
  }
}

impl<T> Default for Coalescer<T> {
  fn default() -> Self {
    Self {
      inflight: Arc::new(Mutex::new(HashMap::new())),
    }
  }
}

impl<T: Clone + Send + Sync + 'static> Coalescer<T> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Run `op` for `key`, or join the run already in progress.
  ///
  /// `op` is only invoked when no handle exists for `key`.
  pub async fn run<F, Fut>(&self, key: &str, op: F) -> T
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T> + Send + 'static,
  {
    let shared = {
      let mut inflight = lock(&self.inflight);
      match inflight.get(key) {
        Some(existing) => {
          debug!(key, "Reusing in-flight request");
          existing.clone()
        }
        None => {
          let guard = HandleGuard {
            inflight: Arc::clone(&self.inflight),
            key: key.to_string(),
          };
          let operation = op();
          let shared = async move {
            // Dropped when the operation settles, removing the handle
            let _guard = guard;
            operation.await
          }
          .boxed()
          .shared();
          inflight.insert(key.to_string(), shared.clone());
          shared
        }
      }
    };

    shared.await
  }

  pub fn is_in_flight(&self, key: &str) -> bool {
    lock(&self.inflight).contains_key(key)
  }

  pub fn in_flight_count(&self) -> usize {
    lock(&self.inflight).len()
  }
}

fn lock<T>(map: &InFlightMap<T>) -> MutexGuard<'_, HashMap<String, SharedOp<T>>> {
  map.lock().unwrap_or_else(PoisonError::into_inner)
}

struct HandleGuard<T> {
  inflight: InFlightMap<T>,
  key: String,
}

impl<T> Drop for HandleGuard<T> {
  fn drop(&mut self) {
    // Take the handle out before dropping it so no lock is held during its drop
    let removed = lock(&self.inflight).remove(&self.key);
    drop(removed);
  }
}
