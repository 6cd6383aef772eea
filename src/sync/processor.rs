//! Drains the durable queue by replaying pending writes.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::SyncError;
use crate::gateway::Gateway;
use crate::notify::{Notifier, SyncEvent, SyncStatus, SyncStatusItem};
use crate::queue::{QueueEntry, QueueStorage};

/// Counts from one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
  /// Entries replayed against the service
  pub attempted: usize,
  pub succeeded: usize,
  /// Replays that failed and stay queued
  pub retried: usize,
  /// Entries dropped for exceeding their replay budget
  pub exhausted: usize,
  /// Entries left in the store after the pass
  pub remaining: usize,
}

enum Outcome {
  Succeeded,
  Retried,
  Exhausted,
  Skipped,
}

/// Replays queued writes in enqueue order.
///
/// Passes are serialized within the process. Each entry is re-read right
/// before it is handled, so an entry removed by an earlier pass is skipped
/// rather than replayed twice.
#[derive(Clone)]
pub struct SyncProcessor {
  store: Arc<dyn QueueStorage>,
  gateway: Gateway,
  notifier: Notifier,
  pass: Arc<Mutex<()>>,
}

impl SyncProcessor {
  pub fn new(store: Arc<dyn QueueStorage>, gateway: Gateway, notifier: Notifier) -> Self {
    Self {
      store,
      gateway,
      notifier,
      pass: Arc::new(Mutex::new(())),
    }
  }

  pub fn store(&self) -> &Arc<dyn QueueStorage> {
    &self.store
  }

  pub fn notifier(&self) -> &Notifier {
    &self.notifier
  }

  /// Run one drain pass over every queued entry.
  ///
  /// Emits `sync-complete` when the store is empty afterwards. Fails only if
  /// the queue cannot be listed at all; per-entry storage failures are logged
  /// and the pass moves on.
  pub async fn drain(&self) -> Result<DrainReport, SyncError> {
    let _pass = self.pass.lock().await;
    let entries = self.store.list_all()?;
    let mut report = DrainReport::default();

    if entries.is_empty() {
      debug!("Sync queue is empty");
    } else {
      info!(count = entries.len(), "Processing sync queue");
    }

    for entry in entries {
      match self.process(entry.id).await {
        Ok(Outcome::Succeeded) => {
          report.attempted += 1;
          report.succeeded += 1;
        }
        Ok(Outcome::Retried) => {
          report.attempted += 1;
          report.retried += 1;
        }
        Ok(Outcome::Exhausted) => report.exhausted += 1,
        Ok(Outcome::Skipped) => {}
        Err(e) => error!(id = entry.id, action = %entry.action, "Storage error during sync: {}", e),
      }
    }

    report.remaining = self.store.len()?;
    if report.remaining == 0 {
      info!("All items synced");
      self.notifier.notify(SyncEvent::complete());
    } else {
      info!(remaining = report.remaining, "Items remaining in sync queue");
    }

    Ok(report)
  }

  /// Snapshot of the queue for status queries.
  pub fn status(&self) -> Result<SyncStatus, SyncError> {
    let items: Vec<SyncStatusItem> = self
      .store
      .list_all()?
      .into_iter()
      .map(|entry| SyncStatusItem {
        timestamp: entry.enqueued_at.timestamp_millis(),
        action: entry.action,
        retry_count: entry.retry_count,
      })
      .collect();

    Ok(SyncStatus {
      queue_length: items.len(),
      items,
    })
  }

  async fn process(&self, id: i64) -> Result<Outcome, SyncError> {
    // Current state, not the snapshot the pass started from
    let Some(entry) = self.store.get(id)? else {
      return Ok(Outcome::Skipped);
    };

    if entry.is_exhausted() {
      let error = SyncError::MaxRetriesExceeded {
        action: entry.action.clone(),
      };
      warn!(id, %error, "Removing from queue");
      self.store.remove(id)?;
      self
        .notifier
        .notify(SyncEvent::max_retries_exceeded(&entry.action));
      return Ok(Outcome::Exhausted);
    }

    debug!(
      id,
      action = %entry.action,
      attempt = entry.retry_count + 1,
      max = entry.max_retries,
      "Attempting to sync"
    );

    match self.gateway.send_once(&entry.to_request()).await {
      Ok(response) if response.is_ok() => {
        info!(id, action = %entry.action, "Successfully synced");
        self.store.remove(id)?;
        let data = response.json();
        self.mark_record_synced(&entry, data.as_ref());
        self.notifier.notify(SyncEvent::SyncSuccess {
          action: entry.action,
          data,
        });
        Ok(Outcome::Succeeded)
      }
      Ok(response) => {
        warn!(id, action = %entry.action, status = response.status, "Server error while syncing");
        self.store.update_retry(id, entry.retry_count + 1)?;
        Ok(Outcome::Retried)
      }
      Err(e) => {
        warn!(id, action = %entry.action, "Network error while syncing: {}", e);
        self.store.update_retry(id, entry.retry_count + 1)?;
        Ok(Outcome::Retried)
      }
    }
  }

  fn mark_record_synced(&self, entry: &QueueEntry, response: Option<&Value>) {
    let Some(record_id) = entry.record_id else {
      return;
    };

    let entity_id = response
      .and_then(|body| body.get("data"))
      .and_then(|data| data.get("id"))
      .and_then(|id| match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
      });

    if let Err(e) = self.store.mark_synced(record_id, entity_id.as_deref()) {
      // The write itself went through; only the audit trail lags
      warn!(record_id, "Failed to mark offline record synced: {}", e);
    }
  }
}
