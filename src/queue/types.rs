//! Records held by the persistent queue store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::envelope;
use crate::error::SyncError;
use crate::gateway::{Method, Request};

/// Replay budget for a queued write unless configured otherwise.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// A durable record of one pending write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
  /// Store-assigned, monotonically increasing
  pub id: i64,
  pub url: String,
  pub method: Method,
  pub headers: BTreeMap<String, String>,
  /// Opaque serialized payload, replayed byte for byte
  pub body: String,
  pub action: String,
  pub enqueued_at: DateTime<Utc>,
  pub retry_count: u32,
  pub max_retries: u32,
  pub last_retry_at: Option<DateTime<Utc>>,
  /// Offline record to mark synced once this write is delivered
  pub record_id: Option<i64>,
}

impl QueueEntry {
  /// Whether the entry has used up its replay budget.
  pub fn is_exhausted(&self) -> bool {
    self.retry_count >= self.max_retries
  }

  /// Rebuild the original request for replay.
  pub fn to_request(&self) -> Request {
    Request {
      url: self.url.clone(),
      method: self.method,
      headers: self.headers.clone(),
      body: if self.body.is_empty() {
        None
      } else {
        Some(self.body.clone())
      },
    }
  }
}

/// A write about to be queued; the store fills in id and bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct NewQueueEntry {
  pub url: String,
  pub method: Method,
  pub headers: BTreeMap<String, String>,
  pub body: String,
  pub action: String,
  pub max_retries: u32,
  pub record_id: Option<i64>,
}

impl NewQueueEntry {
  /// Capture a failed write request, extracting its action name from the body.
  pub fn from_request(request: &Request, max_retries: u32) -> Result<Self, SyncError> {
    if !request.method.is_write() {
      return Err(SyncError::InvalidRequest(format!(
        "Only write requests can be queued, got {}",
        request.method
      )));
    }

    let body = request.body.clone().unwrap_or_default();
    Ok(Self {
      url: request.url.clone(),
      method: request.method,
      headers: request.headers.clone(),
      action: envelope::extract_action(&body),
      body,
      max_retries,
      record_id: None,
    })
  }

  pub fn with_record(mut self, record_id: i64) -> Self {
    self.record_id = Some(record_id);
    self
  }
}

/// Data created while disconnected, kept for audit after it syncs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineRecord {
  pub id: i64,
  #[serde(rename = "type")]
  pub record_type: String,
  /// Backend identifier, known only after sync
  pub associated_entity_id: Option<String>,
  pub payload: Value,
  pub created_at: DateTime<Utc>,
  pub synced: bool,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_from_request_extracts_action() {
    let payload = json!({"action": "addFollowUp", "patientId": "P-1"});
    let request = Request::post_form("https://svc.test/exec", payload.as_object().unwrap());

    let entry = NewQueueEntry::from_request(&request, DEFAULT_MAX_RETRIES).unwrap();
    assert_eq!(entry.action, "addFollowUp");
    assert_eq!(entry.method, Method::Post);
    assert_eq!(
      entry.headers.get("content-type").map(String::as_str),
      Some(envelope::FORM_CONTENT_TYPE)
    );
  }

  #[test]
  fn test_from_request_rejects_reads() {
    let request = Request::get("https://svc.test/exec?action=cdsGetConfig");
    assert!(matches!(
      NewQueueEntry::from_request(&request, 5),
      Err(SyncError::InvalidRequest(_))
    ));
  }

  #[test]
  fn test_exhaustion_boundary() {
    let mut entry = QueueEntry {
      id: 1,
      url: "https://svc.test".into(),
      method: Method::Post,
      headers: BTreeMap::new(),
      body: String::new(),
      action: "x".into(),
      enqueued_at: Utc::now(),
      retry_count: 4,
      max_retries: 5,
      last_retry_at: None,
      record_id: None,
    };
    assert!(!entry.is_exhausted());
    assert_eq!(entry.to_request().body, None);

    entry.retry_count = 5;
    assert!(entry.is_exhausted());
  }
}
