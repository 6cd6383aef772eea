//! Session-token provider.
//!
//! Holds the current token (with optional expiry) and applies it to outbound
//! requests: as a `sessionToken` query parameter, and for writes also inside
//! the form or JSON body when the body does not carry one already.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::envelope::JSON_CONTENT_TYPE;
use crate::gateway::{Method, Request};
use crate::notify::{Notifier, SyncEvent};

const TOKEN_FIELD: &str = "sessionToken";

#[derive(Debug, Clone)]
struct SessionToken {
  token: String,
  expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Default)]
pub struct SessionStore {
  state: Arc<Mutex<Option<SessionToken>>>,
  notifier: Option<Notifier>,
}

impl SessionStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Broadcast `session-expired` when the service rejects the session.
  pub fn with_notifier(mut self, notifier: Notifier) -> Self {
    self.notifier = Some(notifier);
    self
  }

  /// Store a token; an empty token clears the session.
  pub fn set(&self, token: &str, expires_at: Option<DateTime<Utc>>) {
    let next = (!token.is_empty()).then(|| SessionToken {
      token: token.to_string(),
      expires_at,
    });
    if let Ok(mut state) = self.state.lock() {
      *state = next;
    }
  }

  pub fn clear(&self) {
    self.set("", None);
  }

  /// Current token; an expired one is cleared and reported as absent.
  pub fn token(&self) -> Option<String> {
    let mut state = self.state.lock().ok()?;
    let expired = state
      .as_ref()
      .is_some_and(|session| session.expires_at.is_some_and(|at| Utc::now() > at));
    if expired {
      *state = None;
    }
    state.as_ref().map(|session| session.token.clone())
  }

  /// Whether an authenticated variant of an operation is worth trying.
  pub fn has_credential(&self) -> bool {
    self.token().is_some_and(|token| !token.trim().is_empty())
  }

  /// Drop the session after the service answered `code: "unauthorized"`.
  pub fn handle_unauthorized(&self, message: &str) {
    warn!("Service rejected session: {}", message);
    self.clear();
    if let Some(notifier) = &self.notifier {
      notifier.notify(SyncEvent::SessionExpired {
        message: message.to_string(),
      });
    }
  }

  /// Return a copy of `request` carrying the current token.
  pub fn authorize(&self, request: &Request) -> Request {
    let Some(token) = self.token() else {
      return request.clone();
    };

    let mut authorized = request.clone();
    authorized.url = append_token_to_url(&request.url, &token);
    if request.method != Method::Get {
      inject_token_into_body(&mut authorized, &token);
    }
    authorized
  }
}

fn append_token_to_url(url: &str, token: &str) -> String {
  match url::Url::parse(url) {
    Ok(mut parsed) => {
      let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| key != TOKEN_FIELD)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
      parsed
        .query_pairs_mut()
        .clear()
        .extend_pairs(pairs)
        .append_pair(TOKEN_FIELD, token);
      parsed.to_string()
    }
    Err(e) => {
      warn!("Falling back while appending session token to URL: {}", e);
      url.to_string()
    }
  }
}

fn inject_token_into_body(request: &mut Request, token: &str) {
  let content_type = request.content_type().to_ascii_lowercase();
  let Some(body) = request.body.as_deref() else {
    return;
  };

  if content_type.contains("application/x-www-form-urlencoded") {
    let has_token = url::form_urlencoded::parse(body.as_bytes()).any(|(key, _)| key == TOKEN_FIELD);
    if !has_token {
      let mut serializer = url::form_urlencoded::Serializer::for_suffix(body.to_string(), 0);
      serializer.append_pair(TOKEN_FIELD, token);
      request.body = Some(serializer.finish());
    }
    return;
  }

  let looks_json = content_type.contains(JSON_CONTENT_TYPE) || body.trim_start().starts_with('{');
  if !looks_json {
    return;
  }

  match serde_json::from_str::<Value>(body) {
    Ok(Value::Object(mut payload)) => {
      if !payload.contains_key(TOKEN_FIELD) {
        payload.insert(TOKEN_FIELD.to_string(), Value::String(token.to_string()));
        request.body = Some(Value::Object(payload).to_string());
      }
      if !content_type.contains(JSON_CONTENT_TYPE) {
        request
          .headers
          .insert("content-type".to_string(), JSON_CONTENT_TYPE.to_string());
      }
    }
    Ok(_) => {}
    Err(e) => warn!("Failed to inject session token into request body: {}", e),
  }
}
