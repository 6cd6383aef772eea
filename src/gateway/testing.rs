//! Scripted transport double for unit tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use super::transport::Transport;
use super::types::{Request, Response};
use crate::error::SyncError;

type Responder = Box<dyn Fn(&Request) -> Result<Response, SyncError> + Send + Sync>;

/// Transport that answers from a closure and records every request.
pub struct ScriptedTransport {
  responder: Responder,
  delay: Option<Duration>,
  calls: Mutex<Vec<Request>>,
}

impl ScriptedTransport {
  pub fn new<F>(responder: F) -> Self
  where
    F: Fn(&Request) -> Result<Response, SyncError> + Send + Sync + 'static,
  {
    Self {
      responder: Box::new(responder),
      delay: None,
      calls: Mutex::new(Vec::new()),
    }
  }

  /// Answer every request the same way.
  pub fn always(result: Result<Response, SyncError>) -> Self {
    Self::new(move |_| result.clone())
  }

  /// Answer from a queue; once drained, repeat the last answer.
  pub fn sequence(results: Vec<Result<Response, SyncError>>) -> Self {
    let last = results
      .last()
      .cloned()
      .unwrap_or_else(|| Err(SyncError::Network("script exhausted".into())));
    let queue = Mutex::new(VecDeque::from(results));
    Self::new(move |_| queue.lock().unwrap().pop_front().unwrap_or_else(|| last.clone()))
  }

  /// Sleep before answering, so callers can overlap.
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  pub fn calls(&self) -> Vec<Request> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

#[async_trait]
impl Transport for ScriptedTransport {
  async fn execute(&self, request: &Request) -> Result<Response, SyncError> {
    self.calls.lock().unwrap().push(request.clone());
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    (self.responder)(request)
  }
}

pub fn ok_json(body: &str) -> Result<Response, SyncError> {
  Ok(Response::new(200, body))
}

pub fn status(code: u16) -> Result<Response, SyncError> {
  Ok(Response::new(code, ""))
}

pub fn offline() -> Result<Response, SyncError> {
  Err(SyncError::Network("connection refused".into()))
}
