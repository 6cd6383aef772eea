//! Notification channel for sync lifecycle events.
//!
//! Every listener gets every event. Listeners that fall behind lose the
//! oldest events rather than blocking the sync processor.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Reason reported when a queued write is dropped after its last attempt.
pub const REASON_MAX_RETRIES: &str = "max_retries_exceeded";

pub const SYNC_COMPLETE_MESSAGE: &str = "All offline data synced successfully";

const CHANNEL_CAPACITY: usize = 256;

/// Events broadcast to listeners (typically UI surfaces).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncEvent {
  /// A queued write was delivered
  SyncSuccess {
    action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
  },
  /// A queued write was dropped for good
  SyncFailed { action: String, reason: String },
  /// A drain pass left the queue empty
  SyncComplete { message: String },
  /// The service rejected the current session
  SessionExpired { message: String },
}

impl SyncEvent {
  pub fn max_retries_exceeded(action: &str) -> Self {
    SyncEvent::SyncFailed {
      action: action.to_string(),
      reason: REASON_MAX_RETRIES.to_string(),
    }
  }

  pub fn complete() -> Self {
    SyncEvent::SyncComplete {
      message: SYNC_COMPLETE_MESSAGE.to_string(),
    }
  }
}

/// One item of a status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusItem {
  pub action: String,
  /// Enqueue time in milliseconds since the Unix epoch
  pub timestamp: i64,
  pub retry_count: u32,
}

/// Answer to a `GET_SYNC_STATUS` query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "SYNC_STATUS", rename_all = "camelCase")]
pub struct SyncStatus {
  pub queue_length: usize,
  pub items: Vec<SyncStatusItem>,
}

/// Broadcast handle; clone freely.
#[derive(Debug, Clone)]
pub struct Notifier {
  tx: broadcast::Sender<SyncEvent>,
}

impl Default for Notifier {
  fn default() -> Self {
    Self::new()
  }
}

impl Notifier {
  pub fn new() -> Self {
    let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.tx.subscribe()
  }

  /// Send to all current listeners. Having none is not an error.
  pub fn notify(&self, event: SyncEvent) {
    tracing::debug!(?event, "Notifying listeners");
    let _ = self.tx.send(event);
  }

  pub fn listener_count(&self) -> usize {
    self.tx.receiver_count()
  }
}
