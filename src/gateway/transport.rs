//! The network-request primitive the engine consumes.

use async_trait::async_trait;
use std::time::Duration;

use super::types::{Request, Response};
use crate::error::SyncError;

/// A single network attempt with no retry, timeout or queueing of its own.
///
/// `Ok` means a response arrived, whatever its status. `Err` means no
/// response was received at all.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn execute(&self, request: &Request) -> Result<Response, SyncError>;
}

/// reqwest-backed transport.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new(connect_timeout: Duration) -> Result<Self, SyncError> {
    let client = reqwest::Client::builder()
      .connect_timeout(connect_timeout)
      .user_agent(concat!("epicare-sync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| SyncError::Network(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn execute(&self, request: &Request) -> Result<Response, SyncError> {
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
      .map_err(|e| SyncError::InvalidRequest(e.to_string()))?;

    let mut builder = self.client.request(method, &request.url);
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(|e| {
      if e.is_builder() {
        SyncError::InvalidRequest(e.to_string())
      } else {
        SyncError::Network(e.to_string())
      }
    })?;

    let status = response.status().as_u16();
    let body = response
      .text()
      .await
      .map_err(|e| SyncError::Network(format!("Failed to read response body: {}", e)))?;

    Ok(Response::new(status, body))
  }
}
