//! Resilient network gateway.
//!
//! Wraps a [`Transport`] with per-attempt timeouts, bounded retry with linear
//! backoff, session-token injection, and the queue-on-failure write path.

mod transport;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use transport::{HttpTransport, Transport};
pub use types::{Method, Request, Response};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::SyncError;
use crate::queue::WriteQueue;
use crate::session::SessionStore;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(2_000);

const QUEUED_MESSAGE: &str = "Request queued for sync when connection is restored";
const OFFLINE_MESSAGE: &str =
  "You are offline. Your changes will be synced automatically when connection is restored.";

/// Retry and timeout settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayConfig {
  pub timeout: Duration,
  pub retry_attempts: u32,
  /// Base delay; attempt `n` waits `retry_delay * n` before the next try
  pub retry_delay: Duration,
}

impl Default for GatewayConfig {
  fn default() -> Self {
    Self {
      timeout: DEFAULT_TIMEOUT,
      retry_attempts: DEFAULT_RETRY_ATTEMPTS,
      retry_delay: DEFAULT_RETRY_DELAY,
    }
  }
}

/// Best-known connectivity state, flipped by network outcomes and reconnect signals.
#[derive(Debug, Clone)]
pub struct Connectivity(Arc<AtomicBool>);

impl Default for Connectivity {
  fn default() -> Self {
    Self(Arc::new(AtomicBool::new(true)))
  }
}

impl Connectivity {
  pub fn is_online(&self) -> bool {
    self.0.load(Ordering::Relaxed)
  }

  pub fn set_online(&self, online: bool) {
    let was = self.0.swap(online, Ordering::Relaxed);
    if was != online {
      if online {
        info!("Connection restored");
      } else {
        warn!("Connection lost");
      }
    }
  }
}

/// Outcome of a delivery whose result may not be observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
  /// The service acknowledged the write
  Confirmed,
  /// The service answered but did not accept the write
  Rejected,
  /// Handed to the fire-and-forget channel; success is assumed, never verified
  Unconfirmed,
  /// Not attempted (known offline)
  Skipped,
}

impl Delivery {
  /// Optimistic view: unconfirmed deliveries count as success.
  pub fn is_success(self) -> bool {
    matches!(self, Delivery::Confirmed | Delivery::Unconfirmed)
  }
}

/// Session credentials applied to requests aimed at the service.
#[derive(Clone)]
struct SessionBinding {
  store: SessionStore,
  base_url: String,
}

impl SessionBinding {
  /// Same origin as the service, and at or below its path.
  fn covers(&self, url: &str) -> bool {
    let (Ok(base), Ok(target)) = (Url::parse(&self.base_url), Url::parse(url)) else {
      return false;
    };
    if base.origin() != target.origin() {
      return false;
    }

    let base_path = base.path().trim_end_matches('/');
    let path = target.path();
    path == base_path
      || path
        .strip_prefix(base_path)
        .is_some_and(|rest| rest.starts_with('/'))
  }
}

#[derive(Clone)]
pub struct Gateway {
  transport: Arc<dyn Transport>,
  config: GatewayConfig,
  session: Option<SessionBinding>,
  connectivity: Connectivity,
}

impl Gateway {
  pub fn new(transport: Arc<dyn Transport>, config: GatewayConfig) -> Self {
    Self {
      transport,
      config,
      session: None,
      connectivity: Connectivity::default(),
    }
  }

  /// Inject the session token into requests aimed at `base_url`.
  pub fn with_session(mut self, store: SessionStore, base_url: impl Into<String>) -> Self {
    self.session = Some(SessionBinding {
      store,
      base_url: base_url.into(),
    });
    self
  }

  pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
    self.connectivity = connectivity;
    self
  }

  pub fn config(&self) -> &GatewayConfig {
    &self.config
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  /// Send with the configured timeout, retrying until a 2xx arrives.
  pub async fn send(&self, request: &Request) -> Result<Response, SyncError> {
    self.send_with_timeout(request, self.config.timeout).await
  }

  /// Send with retry and linear backoff.
  ///
  /// Returns the first 2xx response. After `retry_attempts` failures, returns
  /// the last observed error (`Http`, `Timeout` or `Network`).
  pub async fn send_with_timeout(
    &self,
    request: &Request,
    timeout: Duration,
  ) -> Result<Response, SyncError> {
    let request = self.prepare(request);
    let attempts = self.config.retry_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
      match self.attempt(&request, timeout).await {
        Ok(response) if response.is_ok() => return Ok(response),
        Ok(response) => {
          debug!(attempt, status = response.status, url = %request.url, "Non-ok response");
          last_error = Some(SyncError::Http {
            status: response.status,
          });
        }
        Err(e) => {
          debug!(attempt, url = %request.url, "Attempt failed: {}", e);
          last_error = Some(e);
        }
      }

      if attempt < attempts {
        tokio::time::sleep(self.config.retry_delay * attempt).await;
      }
    }

    Err(last_error.unwrap_or_else(|| {
      SyncError::Network("Failed to fetch after multiple attempts".to_string())
    }))
  }

  /// One attempt with the configured timeout, whatever the status.
  ///
  /// `Err` only when no response arrived.
  pub async fn send_once(&self, request: &Request) -> Result<Response, SyncError> {
    let request = self.prepare(request);
    self.attempt(&request, self.config.timeout).await
  }

  /// Write path of the background process.
  ///
  /// A single direct attempt; on a non-ok status or no response the request is
  /// queued and a provisional 202 is returned so the caller never blocks.
  pub async fn intercept_write(
    &self,
    request: &Request,
    outbox: &WriteQueue,
  ) -> Result<Response, SyncError> {
    if !request.method.is_write() {
      return Err(SyncError::InvalidRequest(format!(
        "{} requests are not intercepted",
        request.method
      )));
    }

    match self.send_once(request).await {
      Ok(response) if response.is_ok() => {
        debug!(url = %request.url, "Write delivered directly");
        Ok(response)
      }
      Ok(response) => {
        warn!(status = response.status, url = %request.url, "Write failed, queuing for retry");
        outbox.queue_request(request);
        Ok(Response::queued(QUEUED_MESSAGE))
      }
      Err(e) => {
        info!(url = %request.url, "Write failed ({}), queuing", e);
        outbox.queue_request(request);
        Ok(Response::queued(OFFLINE_MESSAGE))
      }
    }
  }

  /// Fire-and-forget delivery whose outcome is never observed.
  ///
  /// Always reports [`Delivery::Unconfirmed`]; use only for write-only
  /// payloads where loss is acceptable.
  pub fn send_unconfirmed(&self, request: &Request) -> Delivery {
    let gateway = self.clone();
    let request = request.clone();

    tokio::spawn(async move {
      match gateway.send_once(&request).await {
        Ok(response) => debug!(status = response.status, "Unconfirmed delivery answered"),
        Err(e) => debug!("Unconfirmed delivery failed: {}", e),
      }
    });

    Delivery::Unconfirmed
  }

  fn prepare(&self, request: &Request) -> Request {
    match &self.session {
      Some(binding) if binding.covers(&request.url) => {
        binding.store.authorize(request)
      }
      _ => request.clone(),
    }
  }

  async fn attempt(&self, request: &Request, timeout: Duration) -> Result<Response, SyncError> {
    let result = match tokio::time::timeout(timeout, self.transport.execute(request)).await {
      Ok(result) => result,
      Err(_) => Err(SyncError::Timeout {
        timeout_ms: timeout.as_millis() as u64,
      }),
    };

    match &result {
      Ok(response) => {
        self.connectivity.set_online(true);
        self.inspect(request, response);
      }
      Err(SyncError::Network(_)) | Err(SyncError::Timeout { .. }) => {
        self.connectivity.set_online(false);
      }
      Err(_) => {}
    }

    result
  }

  /// Clear the session when the service reports it unauthorized.
  fn inspect(&self, request: &Request, response: &Response) {
    let Some(binding) = &self.session else {
      return;
    };
    if !binding.covers(&request.url) {
      return;
    }
    if let Ok(envelope) = response.envelope() {
      if envelope.is_session_expired() {
        binding.store.handle_unauthorized(
          envelope
            .message
            .as_deref()
            .unwrap_or("Session expired. Please log in again."),
        );
      }
    }
  }
}
