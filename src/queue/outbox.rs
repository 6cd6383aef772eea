//! Queue-on-failure path for writes that could not be delivered directly.

use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::storage::QueueStorage;
use super::types::NewQueueEntry;
use crate::gateway::Request;
use crate::sync::SyncTrigger;

/// Persists failed writes and arms the deferred sync trigger.
///
/// Never fails towards the caller: if the store is unavailable the write is
/// logged and lost.
#[derive(Clone)]
pub struct WriteQueue {
  store: Arc<dyn QueueStorage>,
  trigger: SyncTrigger,
  sync_tag: String,
  max_retries: u32,
}

impl WriteQueue {
  pub fn new(
    store: Arc<dyn QueueStorage>,
    trigger: SyncTrigger,
    sync_tag: impl Into<String>,
    max_retries: u32,
  ) -> Self {
    Self {
      store,
      trigger,
      sync_tag: sync_tag.into(),
      max_retries,
    }
  }

  pub fn store(&self) -> &Arc<dyn QueueStorage> {
    &self.store
  }

  /// Queue a failed write. Returns the entry id, or `None` if it was lost.
  pub fn queue_request(&self, request: &Request) -> Option<i64> {
    let entry = match NewQueueEntry::from_request(request, self.max_retries) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(url = %request.url, "Refusing to queue request: {}", e);
        return None;
      }
    };
    self.persist(entry)
  }

  /// Queue a failed write together with the record it creates.
  ///
  /// The record is kept for audit and flipped to synced once the write is
  /// delivered. It is only stored if the write is queued with it.
  pub fn queue_with_record(
    &self,
    request: &Request,
    record_type: &str,
    payload: &Value,
  ) -> Option<i64> {
    let entry = match NewQueueEntry::from_request(request, self.max_retries) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(url = %request.url, "Refusing to queue request: {}", e);
        return None;
      }
    };

    match self.store.enqueue_with_record(&entry, record_type, payload) {
      Ok((id, record_id)) => {
        info!(id, record_id, action = %entry.action, "Queued request for sync");
        self.trigger.register(&self.sync_tag);
        Some(id)
      }
      Err(e) => {
        // The write itself still matters more than its audit trail
        warn!(record_type, "Could not queue write with offline record: {}", e);
        self.persist(entry)
      }
    }
  }

  fn persist(&self, entry: NewQueueEntry) -> Option<i64> {
    match self.store.enqueue(&entry) {
      Ok(id) => {
        info!(id, action = %entry.action, "Queued request for sync");
        self.trigger.register(&self.sync_tag);
        Some(id)
      }
      Err(e) => {
        error!(
          action = %entry.action,
          "Error adding to sync queue, request lost: {}", e
        );
        None
      }
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::error::SyncError;
  use crate::queue::{OfflineRecord, QueueEntry, SqliteQueue};
  use crate::sync::DEFAULT_SYNC_TAG;
  use serde_json::json;

  /// A store whose every operation fails.
  pub(crate) struct BrokenStore;

  impl QueueStorage for BrokenStore {
    fn enqueue(&self, _entry: &NewQueueEntry) -> Result<i64, SyncError> {
      Err(SyncError::StorageUnavailable("disk full".into()))
    }
    fn enqueue_with_record(
      &self,
      _entry: &NewQueueEntry,
      _record_type: &str,
      _payload: &Value,
    ) -> Result<(i64, i64), SyncError> {
      Err(SyncError::StorageUnavailable("disk full".into()))
    }
    fn list_all(&self) -> Result<Vec<QueueEntry>, SyncError> {
      Err(SyncError::StorageUnavailable("disk full".into()))
    }
    fn get(&self, _id: i64) -> Result<Option<QueueEntry>, SyncError> {
      Err(SyncError::StorageUnavailable("disk full".into()))
    }
    fn remove(&self, _id: i64) -> Result<bool, SyncError> {
      Err(SyncError::StorageUnavailable("disk full".into()))
    }
    fn update_retry(&self, _id: i64, _retry_count: u32) -> Result<bool, SyncError> {
      Err(SyncError::StorageUnavailable("disk full".into()))
    }
    fn len(&self) -> Result<usize, SyncError> {
      Err(SyncError::StorageUnavailable("disk full".into()))
    }
    fn create_record(&self, _record_type: &str, _payload: &Value) -> Result<i64, SyncError> {
      Err(SyncError::StorageUnavailable("disk full".into()))
    }
    fn get_record(&self, _id: i64) -> Result<Option<OfflineRecord>, SyncError> {
      Err(SyncError::StorageUnavailable("disk full".into()))
    }
    fn mark_synced(&self, _id: i64, _entity_id: Option<&str>) -> Result<bool, SyncError> {
      Err(SyncError::StorageUnavailable("disk full".into()))
    }
    fn records_by_type(&self, _record_type: &str) -> Result<Vec<OfflineRecord>, SyncError> {
      Err(SyncError::StorageUnavailable("disk full".into()))
    }
    fn unsynced_records(&self) -> Result<Vec<OfflineRecord>, SyncError> {
      Err(SyncError::StorageUnavailable("disk full".into()))
    }
    fn records_for_entity(&self, _entity_id: &str) -> Result<Vec<OfflineRecord>, SyncError> {
      Err(SyncError::StorageUnavailable("disk full".into()))
    }
  }

  /// A working store whose writes to the queue table fail.
  struct FullQueue(SqliteQueue);

  impl QueueStorage for FullQueue {
    fn enqueue(&self, _entry: &NewQueueEntry) -> Result<i64, SyncError> {
      Err(SyncError::StorageUnavailable("disk full".into()))
    }
    fn enqueue_with_record(
      &self,
      _entry: &NewQueueEntry,
      _record_type: &str,
      _payload: &Value,
    ) -> Result<(i64, i64), SyncError> {
      Err(SyncError::StorageUnavailable("disk full".into()))
    }
    fn list_all(&self) -> Result<Vec<QueueEntry>, SyncError> {
      self.0.list_all()
    }
    fn get(&self, id: i64) -> Result<Option<QueueEntry>, SyncError> {
      self.0.get(id)
    }
    fn remove(&self, id: i64) -> Result<bool, SyncError> {
      self.0.remove(id)
    }
    fn update_retry(&self, id: i64, retry_count: u32) -> Result<bool, SyncError> {
      self.0.update_retry(id, retry_count)
    }
    fn len(&self) -> Result<usize, SyncError> {
      self.0.len()
    }
    fn create_record(&self, record_type: &str, payload: &Value) -> Result<i64, SyncError> {
      self.0.create_record(record_type, payload)
    }
    fn get_record(&self, id: i64) -> Result<Option<OfflineRecord>, SyncError> {
      self.0.get_record(id)
    }
    fn mark_synced(&self, id: i64, entity_id: Option<&str>) -> Result<bool, SyncError> {
      self.0.mark_synced(id, entity_id)
    }
    fn records_by_type(&self, record_type: &str) -> Result<Vec<OfflineRecord>, SyncError> {
      self.0.records_by_type(record_type)
    }
    fn unsynced_records(&self) -> Result<Vec<OfflineRecord>, SyncError> {
      self.0.unsynced_records()
    }
    fn records_for_entity(&self, entity_id: &str) -> Result<Vec<OfflineRecord>, SyncError> {
      self.0.records_for_entity(entity_id)
    }
  }

  fn form_request(action: &str) -> Request {
    let payload = json!({ "action": action, "patientId": "P-9" });
    Request::post_form("https://svc.test/exec", payload.as_object().unwrap())
  }

  #[test]
  fn test_queue_request_arms_trigger() {
    let store = Arc::new(SqliteQueue::open_in_memory().unwrap());
    let trigger = SyncTrigger::new();
    let queue = WriteQueue::new(store.clone(), trigger.clone(), DEFAULT_SYNC_TAG, 5);

    let id = queue.queue_request(&form_request("addFollowUp")).unwrap();

    let entry = store.get(id).unwrap().unwrap();
    assert_eq!(entry.action, "addFollowUp");
    assert_eq!(entry.retry_count, 0);
    assert_eq!(entry.max_retries, 5);
    assert!(trigger.is_registered(DEFAULT_SYNC_TAG));
  }

  #[test]
  fn test_queue_with_record_links_entry() {
    let store = Arc::new(SqliteQueue::open_in_memory().unwrap());
    let queue = WriteQueue::new(store.clone(), SyncTrigger::new(), DEFAULT_SYNC_TAG, 5);

    let id = queue
      .queue_with_record(&form_request("addPatient"), "patient", &json!({"name": "R"}))
      .unwrap();

    let record_id = store.get(id).unwrap().unwrap().record_id.unwrap();
    let record = store.get_record(record_id).unwrap().unwrap();
    assert_eq!(record.record_type, "patient");
    assert!(!record.synced);
  }

  #[test]
  fn test_lost_write_leaves_no_orphan_record() {
    let store = Arc::new(FullQueue(SqliteQueue::open_in_memory().unwrap()));
    let trigger = SyncTrigger::new();
    let queue = WriteQueue::new(store.clone(), trigger.clone(), DEFAULT_SYNC_TAG, 5);

    let id = queue.queue_with_record(&form_request("addPatient"), "patient", &json!({}));

    assert_eq!(id, None);
    assert_eq!(store.len().unwrap(), 0);
    assert!(store.unsynced_records().unwrap().is_empty());
    assert!(!trigger.is_registered(DEFAULT_SYNC_TAG));
  }

  #[test]
  fn test_storage_failure_is_swallowed() {
    let trigger = SyncTrigger::new();
    let queue = WriteQueue::new(Arc::new(BrokenStore), trigger.clone(), DEFAULT_SYNC_TAG, 5);

    assert_eq!(queue.queue_request(&form_request("addFollowUp")), None);
    assert!(!trigger.is_registered(DEFAULT_SYNC_TAG));
  }
}
