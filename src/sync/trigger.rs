//! Deferred-processing trigger armed when a write is queued.
//!
//! Mirrors a platform background-sync registration: a tag is registered when
//! work is queued, and the reconnect signal for that tag is what resumes
//! processing without any foreground caller being around.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Tag registered for queued writes.
pub const DEFAULT_SYNC_TAG: &str = "sync-epicare-data";

#[derive(Clone, Default)]
pub struct SyncTrigger {
  registered: Arc<Mutex<BTreeSet<String>>>,
  armed: Arc<Notify>,
}

impl SyncTrigger {
  pub fn new() -> Self {
    Self::default()
  }

  /// Arm the trigger for `tag`. Registering twice is the same as once.
  pub fn register(&self, tag: &str) {
    if let Ok(mut registered) = self.registered.lock() {
      if registered.insert(tag.to_string()) {
        tracing::debug!(tag, "Registered deferred sync");
      }
    }
    self.armed.notify_one();
  }

  pub fn is_registered(&self, tag: &str) -> bool {
    self
      .registered
      .lock()
      .map(|registered| registered.contains(tag))
      .unwrap_or(false)
  }

  /// Consume the registration for `tag`, returning whether it was armed.
  pub fn take(&self, tag: &str) -> bool {
    self
      .registered
      .lock()
      .map(|mut registered| registered.remove(tag))
      .unwrap_or(false)
  }

  /// Wait until something registers.
  pub async fn armed(&self) {
    self.armed.notified().await;
  }
}
