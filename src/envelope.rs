//! Wire formats shared by every call to the service.
//!
//! Requests go out as form-encoded key/value pairs (objects and arrays are
//! JSON-stringified into a single field) or as a JSON body with a top-level
//! `action`. Responses come back as `{status, data?, message?, code?}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SyncError;

/// Sentinel action name when none can be extracted from a body.
pub const UNKNOWN_ACTION: &str = "unknown";

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded;charset=UTF-8";
pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
  Success,
  Error,
}

/// The service's standard response wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
  pub status: EnvelopeStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub data: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
  /// Numeric (`401`) or symbolic (`"unauthorized"`) depending on the endpoint
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub code: Option<Value>,
}

impl Envelope {
  pub fn parse(body: &str) -> Result<Self, SyncError> {
    serde_json::from_str(body).map_err(|e| SyncError::Decode(e.to_string()))
  }

  pub fn is_success(&self) -> bool {
    self.status == EnvelopeStatus::Success
  }

  /// The code rendered as a string, whatever its JSON type.
  pub fn code_string(&self) -> Option<String> {
    match &self.code {
      Some(Value::String(s)) => Some(s.clone()),
      Some(Value::Number(n)) => Some(n.to_string()),
      _ => None,
    }
  }

  /// Whether the envelope reports an authorization failure.
  ///
  /// Only the structured `code` is consulted.
  pub fn is_authorization_failure(&self) -> bool {
    if self.is_success() {
      return false;
    }
    matches!(
      self.code_string().as_deref().map(str::to_ascii_lowercase).as_deref(),
      Some("401") | Some("403") | Some("unauthorized") | Some("forbidden")
    )
  }

  /// Whether the session behind the request is no longer valid.
  pub fn is_session_expired(&self) -> bool {
    !self.is_success()
      && self
        .code_string()
        .is_some_and(|c| c.eq_ignore_ascii_case("unauthorized"))
  }

  /// The payload of a success envelope, or the matching `SyncError`.
  pub fn into_result(self) -> Result<Option<Value>, SyncError> {
    if self.is_success() {
      return Ok(self.data);
    }
    Err(self.into_error())
  }

  /// Classify the envelope as an error, whatever its status.
  pub fn into_error(self) -> SyncError {
    let message = self
      .message
      .clone()
      .unwrap_or_else(|| "API returned an error".to_string());
    if self.is_authorization_failure() {
      return SyncError::Authorization(message);
    }
    SyncError::Api {
      message,
      code: self.code_string(),
    }
  }
}

/// Form-encode a payload object.
///
/// Strings are sent as-is, objects and arrays are JSON-stringified, other
/// scalars use their JSON text.
pub fn encode_form(payload: &Map<String, Value>) -> String {
  let mut serializer = url::form_urlencoded::Serializer::new(String::new());
  for (key, value) in payload {
    serializer.append_pair(key, &form_value(value));
  }
  serializer.finish()
}

fn form_value(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

/// Build the form payload for `action` plus caller data.
pub fn action_payload(action: &str, data: &Map<String, Value>) -> Map<String, Value> {
  let mut payload = data.clone();
  payload.insert("action".to_string(), Value::String(action.to_string()));
  payload
}

/// Extract the logical action name from an opaque request body.
///
/// Tries each parser in order and returns the first hit, falling back to
/// [`UNKNOWN_ACTION`].
pub fn extract_action(body: &str) -> String {
  const PARSERS: [fn(&str) -> Option<String>; 2] = [action_from_form, action_from_json];

  PARSERS
    .iter()
    .find_map(|parse| parse(body))
    .unwrap_or_else(|| UNKNOWN_ACTION.to_string())
}

fn action_from_form(body: &str) -> Option<String> {
  url::form_urlencoded::parse(body.as_bytes())
    .find(|(key, _)| key == "action")
    .map(|(_, value)| value.into_owned())
    .filter(|value| !value.is_empty())
}

fn action_from_json(body: &str) -> Option<String> {
  let value: Value = serde_json::from_str(body).ok()?;
  value
    .get("action")
    .and_then(Value::as_str)
    .filter(|action| !action.is_empty())
    .map(String::from)
}
