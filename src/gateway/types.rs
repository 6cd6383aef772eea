//! Request and response types exchanged with a [`Transport`](super::Transport).

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::envelope::{self, Envelope};
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  /// Whether the verb changes state on the service (and may be queued).
  pub fn is_write(self) -> bool {
    !matches!(self, Method::Get)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = SyncError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      other => Err(SyncError::InvalidRequest(format!(
        "Unsupported method: {}",
        other
      ))),
    }
  }
}

/// One outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub url: String,
  pub method: Method,
  pub headers: BTreeMap<String, String>,
  pub body: Option<String>,
}

impl Request {
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      method: Method::Get,
      headers: BTreeMap::new(),
      body: None,
    }
  }

  /// Form-encoded POST; avoids a CORS preflight on the service side.
  pub fn post_form(url: impl Into<String>, payload: &Map<String, Value>) -> Self {
    Self {
      url: url.into(),
      method: Method::Post,
      headers: BTreeMap::new(),
      body: Some(envelope::encode_form(payload)),
    }
    .with_header("content-type", envelope::FORM_CONTENT_TYPE)
  }

  pub fn post_json(url: impl Into<String>, payload: &Value) -> Self {
    Self {
      url: url.into(),
      method: Method::Post,
      headers: BTreeMap::new(),
      body: Some(payload.to_string()),
    }
    .with_header("content-type", envelope::JSON_CONTENT_TYPE)
  }

  /// Add a header; names are stored lowercased.
  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn content_type(&self) -> &str {
    self
      .headers
      .get("content-type")
      .map(String::as_str)
      .unwrap_or("")
  }
}

/// A response as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub body: String,
}

impl Response {
  pub fn new(status: u16, body: impl Into<String>) -> Self {
    Self {
      status,
      body: body.into(),
    }
  }

  /// Provisional answer for a write that was queued instead of delivered.
  pub fn queued(message: &str) -> Self {
    let body = json!({
      "success": false,
      "offline": true,
      "message": message,
      "status": "queued",
    });
    Self::new(202, body.to_string())
  }

  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn envelope(&self) -> Result<Envelope, SyncError> {
    Envelope::parse(&self.body)
  }

  pub fn json(&self) -> Option<Value> {
    serde_json::from_str(&self.body).ok()
  }
}
