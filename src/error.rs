//! Error taxonomy for the sync engine.

use thiserror::Error;

/// Errors produced by the gateway, queue store and sync processor.
///
/// Cloneable so a single failure can be handed to every caller sharing a
/// coalesced operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
  /// No response was received (DNS, connection refused, reset, ...)
  #[error("Network error: {0}")]
  Network(String),

  /// The service answered with a non-2xx status
  #[error("HTTP error {status}")]
  Http { status: u16 },

  /// The attempt did not complete within the configured timeout
  #[error("Request timeout after {timeout_ms}ms")]
  Timeout { timeout_ms: u64 },

  /// The durable queue could not be read or written
  #[error("Storage unavailable: {0}")]
  StorageUnavailable(String),

  /// The service rejected the credential (structured code, never a message match)
  #[error("Authorization error: {0}")]
  Authorization(String),

  /// A queued entry ran out of replay attempts
  #[error("Max retries exceeded for {action}")]
  MaxRetriesExceeded { action: String },

  /// The service answered `{status: "error"}`
  #[error("API error: {message}")]
  Api { message: String, code: Option<String> },

  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  #[error("Failed to decode response: {0}")]
  Decode(String),
}

impl SyncError {
  /// Whether the failure means "try again later" rather than "this will never work".
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      SyncError::Network(_) | SyncError::Http { .. } | SyncError::Timeout { .. }
    )
  }

  /// Whether the failure is an authorization rejection.
  ///
  /// Only structured signals count: HTTP 401/403 or an `Authorization` error
  /// built from an envelope code.
  pub fn is_authorization(&self) -> bool {
    match self {
      SyncError::Authorization(_) => true,
      SyncError::Http { status } => *status == 401 || *status == 403,
      _ => false,
    }
  }
}

impl From<rusqlite::Error> for SyncError {
  fn from(e: rusqlite::Error) -> Self {
    SyncError::StorageUnavailable(e.to_string())
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(e: serde_json::Error) -> Self {
    SyncError::Decode(e.to_string())
  }
}

pub type Result<T> = std::result::Result<T, SyncError>;
