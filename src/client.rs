//! Service client with transparent caching and offline write queuing.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cache::{fingerprint, CacheLayer, HashAlgorithm};
use crate::envelope::{action_payload, Envelope};
use crate::error::SyncError;
use crate::gateway::{Delivery, Gateway, Request};
use crate::queue::WriteQueue;
use crate::session::SessionStore;

pub const CONFIG_CACHE_KEY: &str = "cds_config";
pub const METADATA_CACHE_KEY: &str = "cds_kb_metadata";

const AUTHENTICATED_EVALUATE: &str = "cdsEvaluate";
const PUBLIC_EVALUATE: &str = "publicCdsEvaluate";
const GET_CONFIG: &str = "cdsGetConfig";
const SET_CONFIG: &str = "cdsSetConfig";
const LOG_EVENTS: &str = "cdsLogEvents";

/// Evaluations run the rule engine server-side and get a longer budget.
const EVALUATE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long each kind of read stays cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
  pub evaluate: Duration,
  pub config: Duration,
  pub metadata: Duration,
}

impl Default for CacheTtls {
  fn default() -> Self {
    Self {
      evaluate: Duration::from_secs(5 * 60),
      config: Duration::from_secs(15 * 60),
      metadata: Duration::from_secs(60 * 60),
    }
  }
}

/// One guidance item in an evaluation report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
  pub id: String,
  #[serde(default)]
  pub severity: String,
  #[serde(default)]
  pub message: String,
  #[serde(default)]
  pub rationale: String,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Result of an evaluation, or the structured report standing in for one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuidanceReport {
  #[serde(default)]
  pub version: String,
  #[serde(default)]
  pub warnings: Vec<Value>,
  #[serde(default)]
  pub prompts: Vec<Prompt>,
  #[serde(default)]
  pub dose_findings: Vec<Value>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl GuidanceReport {
  fn failure(id: &str, message: String, rationale: String) -> Self {
    Self {
      version: "error".to_string(),
      warnings: Vec::new(),
      prompts: vec![Prompt {
        id: id.to_string(),
        severity: "medium".to_string(),
        message,
        rationale,
        extra: Map::new(),
      }],
      dose_findings: Vec::new(),
      extra: Map::new(),
    }
  }

  /// The service answered with an error envelope.
  pub fn api_error(message: &str) -> Self {
    Self::failure(
      "apiError",
      format!("Failed to get clinical guidance: {}", message),
      "API error".to_string(),
    )
  }

  /// No usable answer arrived.
  pub fn connection_error(cause: &SyncError) -> Self {
    Self::failure(
      "connectionError",
      "Failed to get clinical guidance due to connection issues".to_string(),
      format!("Connection error: {}", cause),
    )
  }

  pub fn from_error(e: &SyncError) -> Self {
    match e {
      SyncError::Api { message, .. }
      | SyncError::Authorization(message)
      | SyncError::Decode(message) => Self::api_error(message),
      other => Self::connection_error(other),
    }
  }

  pub fn is_error(&self) -> bool {
    self.version == "error"
  }
}

/// What happened to a foreground write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
  /// The service accepted the write
  Delivered(Envelope),
  /// Delivery failed; the write waits in the durable queue
  Queued { id: i64 },
  /// Delivery failed and the queue could not take it either
  Lost,
}

/// Client for the service with caching, coalescing and queue-on-failure writes.
///
/// Reads go through the [`CacheLayer`]; writes that cannot be delivered are
/// handed to the [`WriteQueue`] for the sync processor to replay.
#[derive(Clone)]
pub struct ServiceClient {
  gateway: Gateway,
  base_url: String,
  session: SessionStore,
  outbox: WriteQueue,
  cache: CacheLayer,
  ttls: CacheTtls,
  hash: HashAlgorithm,
}

impl ServiceClient {
  pub fn new(
    gateway: Gateway,
    base_url: impl Into<String>,
    session: SessionStore,
    outbox: WriteQueue,
  ) -> Self {
    Self {
      gateway,
      base_url: base_url.into(),
      session,
      outbox,
      cache: CacheLayer::new(),
      ttls: CacheTtls::default(),
      hash: HashAlgorithm::default(),
    }
  }

  pub fn with_ttls(mut self, ttls: CacheTtls) -> Self {
    self.ttls = ttls;
    self
  }

  pub fn with_hash_algorithm(mut self, hash: HashAlgorithm) -> Self {
    self.hash = hash;
    self
  }

  pub fn cache(&self) -> &CacheLayer {
    &self.cache
  }

  /// Post `action` with `data` as a form and return the success envelope.
  pub async fn call(&self, action: &str, data: &Map<String, Value>) -> Result<Envelope, SyncError> {
    let request = self.action_request(action, data);
    let envelope = self.gateway.send(&request).await?.envelope()?;
    if !envelope.is_success() {
      error!(action, "API call failed: {:?}", envelope.message);
      return Err(envelope.into_error());
    }
    Ok(envelope)
  }

  /// Deliver a write now, or queue it for replay when the service is unreachable.
  ///
  /// An error envelope is returned as `Err`: the service saw the write and
  /// refused it, so replaying would not help.
  pub async fn submit_write(
    &self,
    action: &str,
    data: &Map<String, Value>,
  ) -> Result<WriteOutcome, SyncError> {
    self.submit(action, data, None).await
  }

  /// Like [`submit_write`](Self::submit_write), also keeping an offline record
  /// of `record_type` when the write has to be queued.
  pub async fn submit_write_with_record(
    &self,
    action: &str,
    data: &Map<String, Value>,
    record_type: &str,
  ) -> Result<WriteOutcome, SyncError> {
    self.submit(action, data, Some(record_type)).await
  }

  async fn submit(
    &self,
    action: &str,
    data: &Map<String, Value>,
    record_type: Option<&str>,
  ) -> Result<WriteOutcome, SyncError> {
    let request = self.action_request(action, data);

    match self.gateway.send(&request).await {
      Ok(response) => {
        let envelope = response.envelope()?;
        if !envelope.is_success() {
          warn!(action, "Write rejected: {:?}", envelope.message);
          return Err(envelope.into_error());
        }
        Ok(WriteOutcome::Delivered(envelope))
      }
      Err(e) if e.is_retryable() => {
        info!(action, "Write failed ({}), queuing for sync", e);
        let queued = match record_type {
          Some(record_type) => {
            let payload = Value::Object(data.clone());
            self.outbox.queue_with_record(&request, record_type, &payload)
          }
          None => self.outbox.queue_request(&request),
        };
        Ok(queued.map_or(WriteOutcome::Lost, |id| WriteOutcome::Queued { id }))
      }
      Err(e) => Err(e),
    }
  }

  /// Evaluate a subject's context against the rule engine.
  ///
  /// Never fails: errors come back as a report with a single `apiError` or
  /// `connectionError` prompt. Successful reports are cached per subject and
  /// context, and concurrent identical evaluations share one request.
  pub async fn evaluate(&self, subject_id: &str, context: &Value) -> GuidanceReport {
    let key = fingerprint(context, &format!("cds_evaluate_{}", subject_id), self.hash);
    let authenticated = self.session.has_credential();
    let gateway = self.gateway.clone();
    let url = self.base_url.clone();
    let context = normalize_context(context);

    let result = self
      .cache
      .fetch(&key, self.ttls.evaluate, move || {
        evaluate_with_fallback(gateway, url, context, authenticated)
      })
      .await;

    match result {
      Ok(cached) => serde_json::from_value::<GuidanceReport>(cached.data).unwrap_or_else(|e| {
        error!("Evaluation returned an unexpected shape: {}", e);
        GuidanceReport::api_error(&e.to_string())
      }),
      Err(e) => {
        error!(subject_id, "Failed to evaluate: {}", e);
        GuidanceReport::from_error(&e)
      }
    }
  }

  /// Service configuration, cached.
  pub async fn get_config(&self) -> Option<Value> {
    self.cached_get(CONFIG_CACHE_KEY, self.ttls.config).await
  }

  /// Update the service configuration and drop the cached copy.
  pub async fn set_config(&self, config: &Value) -> Result<Option<Value>, SyncError> {
    let mut data = Map::new();
    data.insert("config".to_string(), config.clone());
    data.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));

    let envelope = self.call(SET_CONFIG, &data).await?;
    self.cache.invalidate(CONFIG_CACHE_KEY);
    Ok(envelope.data)
  }

  /// Knowledge-base metadata, cached. Served by the config action.
  pub async fn knowledge_base_metadata(&self) -> Option<Value> {
    self.cached_get(METADATA_CACHE_KEY, self.ttls.metadata).await
  }

  /// Best-effort event logging.
  ///
  /// Skipped while offline. If the send fails the payload goes out once more
  /// over the unconfirmed channel and is assumed delivered.
  pub async fn log_events(&self, events: Vec<Value>) -> Delivery {
    if !self.gateway.connectivity().is_online() {
      debug!("Cannot log events: offline mode");
      return Delivery::Skipped;
    }

    let mut data = Map::new();
    data.insert("events".to_string(), Value::Array(events));
    data.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));
    let request = self.action_request(LOG_EVENTS, &data);

    match self.gateway.send(&request).await {
      Ok(response) => match response.envelope() {
        Ok(envelope) if envelope.is_success() => Delivery::Confirmed,
        _ => Delivery::Rejected,
      },
      Err(e) => {
        warn!("Event logging failed ({}), falling back to unconfirmed delivery", e);
        self.gateway.send_unconfirmed(&request)
      }
    }
  }

  async fn cached_get(&self, key: &str, ttl: Duration) -> Option<Value> {
    let gateway = self.gateway.clone();
    let url = self.action_url(GET_CONFIG);

    let result = self
      .cache
      .fetch(key, ttl, move || fetch_data(gateway, url))
      .await;

    match result {
      Ok(cached) => Some(cached.data),
      Err(e) => {
        error!(key, "Error fetching: {}", e);
        None
      }
    }
  }

  fn action_request(&self, action: &str, data: &Map<String, Value>) -> Request {
    Request::post_form(self.base_url.clone(), &action_payload(action, data))
  }

  fn action_url(&self, action: &str) -> String {
    match url::Url::parse(&self.base_url) {
      Ok(mut url) => {
        url.query_pairs_mut().append_pair("action", action);
        url.to_string()
      }
      Err(_) => format!("{}?action={}", self.base_url, action),
    }
  }
}

async fn fetch_data(gateway: Gateway, url: String) -> Result<Value, SyncError> {
  let envelope = gateway.send(&Request::get(url)).await?.envelope()?;
  Ok(envelope.into_result()?.unwrap_or(Value::Null))
}

/// Try the authenticated action first when a credential exists, then the
/// public one exactly once on an authorization failure.
async fn evaluate_with_fallback(
  gateway: Gateway,
  url: String,
  context: Value,
  authenticated: bool,
) -> Result<Value, SyncError> {
  if !authenticated {
    debug!("No session token, using public evaluation");
    return post_evaluate(&gateway, &url, PUBLIC_EVALUATE, &context).await;
  }

  match post_evaluate(&gateway, &url, AUTHENTICATED_EVALUATE, &context).await {
    Err(e) if e.is_authorization() => {
      warn!("Authenticated evaluation rejected ({}), retrying public evaluation", e);
      post_evaluate(&gateway, &url, PUBLIC_EVALUATE, &context).await
    }
    other => other,
  }
}

async fn post_evaluate(
  gateway: &Gateway,
  url: &str,
  action: &str,
  context: &Value,
) -> Result<Value, SyncError> {
  let mut data = Map::new();
  data.insert("patientContext".to_string(), Value::String(context.to_string()));
  data.insert("clientVersion".to_string(), json!(env!("CARGO_PKG_VERSION")));
  data.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));

  debug!(action, "Posting evaluation");
  let request = Request::post_form(url, &action_payload(action, &data));
  let response = gateway.send_with_timeout(&request, EVALUATE_TIMEOUT).await?;

  // Only a real report may reach the cache
  match response.envelope()?.into_result()? {
    Some(data @ Value::Object(_)) => {
      serde_json::from_value::<GuidanceReport>(data.clone())?;
      Ok(data)
    }
    _ => Err(SyncError::Decode("Evaluation succeeded without a report".to_string())),
  }
}

/// Coerce demographics into what the rule engine validates: a numeric or null
/// `age` and a canonical `gender`. Top-level `age`/`gender` fill in when the
/// demographics block lacks them.
fn normalize_context(context: &Value) -> Value {
  let mut normalized = context.as_object().cloned().unwrap_or_default();
  let top_age = normalized.get("age").cloned();
  let top_gender = normalized.get("gender").cloned();

  let mut demographics = normalized
    .get("demographics")
    .and_then(Value::as_object)
    .cloned()
    .unwrap_or_default();

  let raw_age = demographics
    .get("age")
    .filter(|age| !age.is_null())
    .cloned()
    .or(top_age);
  let age = raw_age.as_ref().and_then(numeric).unwrap_or(Value::Null);

  let raw_gender = [demographics.get("gender"), top_gender.as_ref()]
    .into_iter()
    .flatten()
    .filter_map(|gender| match gender {
      Value::String(s) => Some(s.trim().to_string()),
      Value::Null | Value::Bool(false) => None,
      other => Some(other.to_string()),
    })
    .find(|gender| !gender.is_empty());
  let gender = match raw_gender.as_deref().map(str::to_ascii_lowercase).as_deref() {
    Some("m") | Some("male") => json!("Male"),
    Some("f") | Some("female") => json!("Female"),
    Some(_) => json!("Other"),
    None => Value::Null,
  };

  demographics.insert("age".to_string(), age);
  demographics.insert("gender".to_string(), gender);
  normalized.insert("demographics".to_string(), Value::Object(demographics));
  Value::Object(normalized)
}

fn numeric(value: &Value) -> Option<Value> {
  match value {
    Value::Number(_) => Some(value.clone()),
    Value::String(s) => {
      let parsed: f64 = s.trim().parse().ok()?;
      if !parsed.is_finite() {
        return None;
      }
      if parsed.fract() == 0.0 && parsed.abs() < i64::MAX as f64 {
        Some(json!(parsed as i64))
      } else {
        serde_json::Number::from_f64(parsed).map(Value::Number)
      }
    }
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::envelope::extract_action;
  use crate::gateway::testing::{offline, ok_json, ScriptedTransport};
  use crate::gateway::{GatewayConfig, Response};
  use crate::queue::{BrokenStore, QueueStorage, SqliteQueue};
  use crate::sync::{SyncTrigger, DEFAULT_SYNC_TAG};
  use std::sync::Arc;

  const BASE_URL: &str = "https://svc.test/exec";

  struct Fixture {
    client: ServiceClient,
    transport: Arc<ScriptedTransport>,
    store: Arc<dyn QueueStorage>,
    trigger: SyncTrigger,
  }

  fn fixture_with_store(
    transport: ScriptedTransport,
    token: Option<&str>,
    store: Arc<dyn QueueStorage>,
  ) -> Fixture {
    let transport = Arc::new(transport);
    let session = SessionStore::new();
    if let Some(token) = token {
      session.set(token, None);
    }
    let config = GatewayConfig {
      timeout: Duration::from_secs(1),
      retry_attempts: 3,
      retry_delay: Duration::ZERO,
    };
    let gateway = Gateway::new(transport.clone(), config).with_session(session.clone(), BASE_URL);
    let trigger = SyncTrigger::new();
    let outbox = WriteQueue::new(store.clone(), trigger.clone(), DEFAULT_SYNC_TAG, 5);

    Fixture {
      client: ServiceClient::new(gateway, BASE_URL, session, outbox),
      transport,
      store,
      trigger,
    }
  }

  fn fixture(transport: ScriptedTransport, token: Option<&str>) -> Fixture {
    let store: Arc<dyn QueueStorage> = Arc::new(SqliteQueue::open_in_memory().unwrap());
    fixture_with_store(transport, token, store)
  }

  fn actions(transport: &ScriptedTransport) -> Vec<String> {
    transport
      .calls()
      .iter()
      .map(|request| extract_action(request.body.as_deref().unwrap_or("")))
      .collect()
  }

  fn report_json() -> String {
    json!({
      "status": "success",
      "data": {
        "version": "1.4",
        "warnings": [],
        "prompts": [{"id": "doseCheck", "severity": "low", "message": "ok", "rationale": "r"}],
        "doseFindings": []
      }
    })
    .to_string()
  }

  fn context() -> Value {
    json!({"patientId": "P-1", "demographics": {"age": "42", "gender": "f"}, "weightKg": 60})
  }

  #[tokio::test]
  async fn test_auth_rejection_falls_back_to_public_once() {
    let transport = ScriptedTransport::new(|request| {
      match extract_action(request.body.as_deref().unwrap_or("")).as_str() {
        AUTHENTICATED_EVALUATE => {
          ok_json(r#"{"status":"error","code":401,"message":"Authentication required"}"#)
        }
        _ => ok_json(&report_json()),
      }
    });
    let f = fixture(transport, Some("session-token-123"));

    let report = f.client.evaluate("P-1", &context()).await;

    assert!(!report.is_error());
    assert_eq!(report.version, "1.4");
    assert_eq!(report.prompts[0].id, "doseCheck");
    assert_eq!(actions(&f.transport), vec![AUTHENTICATED_EVALUATE, PUBLIC_EVALUATE]);
  }

  #[tokio::test]
  async fn test_public_failure_yields_api_error_report() {
    let transport = ScriptedTransport::new(|request| {
      match extract_action(request.body.as_deref().unwrap_or("")).as_str() {
        AUTHENTICATED_EVALUATE => {
          ok_json(r#"{"status":"error","code":"unauthorized","message":"expired"}"#)
        }
        _ => ok_json(r#"{"status":"error","message":"Rule engine down"}"#),
      }
    });
    let f = fixture(transport, Some("session-token-123"));

    let report = f.client.evaluate("P-1", &context()).await;

    assert!(report.is_error());
    assert_eq!(report.prompts.len(), 1);
    assert_eq!(report.prompts[0].id, "apiError");
    assert_eq!(report.prompts[0].message, "Failed to get clinical guidance: Rule engine down");
    assert_eq!(f.transport.call_count(), 2);
    // Failures are not cached
    let key = fingerprint(&context(), "cds_evaluate_P-1", HashAlgorithm::Sha256);
    assert!(f.client.cache().get(&key).is_none());
  }

  #[tokio::test]
  async fn test_success_without_report_is_not_cached() {
    let f = fixture(ScriptedTransport::always(ok_json(r#"{"status":"success"}"#)), None);

    let first = f.client.evaluate("P-1", &context()).await;
    let second = f.client.evaluate("P-1", &context()).await;

    assert_eq!(first.prompts[0].id, "apiError");
    assert_eq!(second.prompts[0].id, "apiError");
    assert_eq!(f.transport.call_count(), 2);
  }

  #[tokio::test]
  async fn test_non_auth_error_does_not_fall_back() {
    let f = fixture(
      ScriptedTransport::always(ok_json(
        r#"{"status":"error","code":"bad_input","message":"Missing weight"}"#,
      )),
      Some("session-token-123"),
    );

    let report = f.client.evaluate("P-1", &context()).await;
    assert_eq!(report.prompts[0].id, "apiError");
    assert_eq!(actions(&f.transport), vec![AUTHENTICATED_EVALUATE]);
  }

  #[tokio::test]
  async fn test_transport_failure_yields_connection_error_report() {
    let f = fixture(ScriptedTransport::always(offline()), None);

    let report = f.client.evaluate("P-1", &context()).await;

    assert_eq!(report.prompts[0].id, "connectionError");
    assert!(report.prompts[0].rationale.starts_with("Connection error: "));
    assert_eq!(report.dose_findings, Vec::<Value>::new());
    // Three gateway attempts of the public action only
    assert_eq!(actions(&f.transport), vec![PUBLIC_EVALUATE; 3]);
  }

  #[tokio::test]
  async fn test_concurrent_evaluations_share_one_request() {
    let f = fixture(
      ScriptedTransport::always(ok_json(&report_json())).with_delay(Duration::from_millis(20)),
      None,
    );
    let reordered = json!({
      "weightKg": 60,
      "demographics": {"gender": "f", "age": "42"},
      "patientId": "P-1"
    });

    let runs = (0..5).map(|i| {
      let client = f.client.clone();
      let ctx = if i % 2 == 0 { context() } else { reordered.clone() };
      async move { client.evaluate("P-1", &ctx).await }
    });
    let reports = futures::future::join_all(runs).await;

    assert!(reports.iter().all(|r| r.version == "1.4"));
    assert_eq!(f.transport.call_count(), 1);

    // Served from cache afterwards
    f.client.evaluate("P-1", &reordered).await;
    assert_eq!(f.transport.call_count(), 1);
  }

  #[tokio::test]
  async fn test_evaluation_posts_normalized_context() {
    let f = fixture(ScriptedTransport::always(ok_json(&report_json())), None);
    f.client.evaluate("P-1", &json!({"age": " 7 ", "gender": "Male"})).await;

    let body = f.transport.calls()[0].body.clone().unwrap();
    let sent: Value = url::form_urlencoded::parse(body.as_bytes())
      .find(|(key, _)| key == "patientContext")
      .map(|(_, value)| serde_json::from_str(&value).unwrap())
      .unwrap();
    assert_eq!(sent["demographics"], json!({"age": 7, "gender": "Male"}));
  }

  #[test]
  fn test_normalize_context_edge_cases() {
    let normalized = normalize_context(&json!({"demographics": {"age": "n/a", "gender": "  "}}));
    assert_eq!(normalized["demographics"], json!({"age": null, "gender": null}));

    let normalized = normalize_context(&json!({"demographics": {"age": 3.5, "gender": "X"}}));
    assert_eq!(normalized["demographics"], json!({"age": 3.5, "gender": "Other"}));

    let normalized = normalize_context(&json!(null));
    assert_eq!(normalized, json!({"demographics": {"age": null, "gender": null}}));
  }

  #[tokio::test]
  async fn test_config_cached_until_set() {
    let f = fixture(
      ScriptedTransport::new(|request| {
        if request.url.contains("action=cdsGetConfig") {
          ok_json(r#"{"status":"success","data":{"enabled":true}}"#)
        } else {
          ok_json(r#"{"status":"success","data":{"enabled":false}}"#)
        }
      }),
      None,
    );

    assert_eq!(f.client.get_config().await, Some(json!({"enabled": true})));
    assert_eq!(f.client.get_config().await, Some(json!({"enabled": true})));
    assert_eq!(f.transport.call_count(), 1);

    let updated = f.client.set_config(&json!({"enabled": false})).await.unwrap();
    assert_eq!(updated, Some(json!({"enabled": false})));
    assert!(f.client.cache().get(CONFIG_CACHE_KEY).is_none());

    f.client.get_config().await;
    assert_eq!(f.transport.call_count(), 3);
    assert_eq!(actions(&f.transport)[1], SET_CONFIG);
  }

  #[tokio::test]
  async fn test_metadata_failure_is_none() {
    let f = fixture(
      ScriptedTransport::always(ok_json(r#"{"status":"error","message":"nope"}"#)),
      None,
    );
    assert_eq!(f.client.knowledge_base_metadata().await, None);
    assert!(f.client.cache().get(METADATA_CACHE_KEY).is_none());
  }

  #[tokio::test]
  async fn test_call_surfaces_api_errors() {
    let f = fixture(
      ScriptedTransport::always(ok_json(
        r#"{"status":"error","code":"conflict","message":"Duplicate"}"#,
      )),
      None,
    );
    let err = f.client.call("addPatient", &Map::new()).await.unwrap_err();
    assert_eq!(
      err,
      SyncError::Api {
        message: "Duplicate".into(),
        code: Some("conflict".into())
      }
    );
  }

  #[tokio::test]
  async fn test_submit_write_delivered() {
    let f = fixture(
      ScriptedTransport::always(ok_json(r#"{"status":"success","data":{"id":9}}"#)),
      None,
    );
    let outcome = f.client.submit_write("addFollowUp", &Map::new()).await.unwrap();

    match outcome {
      WriteOutcome::Delivered(envelope) => assert_eq!(envelope.data, Some(json!({"id": 9}))),
      other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(f.store.len().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_submit_write_queues_when_unreachable() {
    let f = fixture(ScriptedTransport::always(offline()), None);
    let data = json!({"patientId": "P-3", "notes": "stable"});

    let outcome = f
      .client
      .submit_write_with_record("addFollowUp", data.as_object().unwrap(), "follow_up")
      .await
      .unwrap();

    let WriteOutcome::Queued { id } = outcome else {
      panic!("expected queued, got {:?}", outcome);
    };
    let entry = f.store.get(id).unwrap().unwrap();
    assert_eq!(entry.action, "addFollowUp");
    assert!(entry.record_id.is_some());
    assert!(f.trigger.is_registered(DEFAULT_SYNC_TAG));
    assert_eq!(f.store.unsynced_records().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_submit_write_lost_when_store_broken() {
    let f = fixture_with_store(ScriptedTransport::always(offline()), None, Arc::new(BrokenStore));
    let outcome = f.client.submit_write("addFollowUp", &Map::new()).await.unwrap();
    assert_eq!(outcome, WriteOutcome::Lost);
  }

  #[tokio::test]
  async fn test_submit_write_rejection_is_not_queued() {
    let f = fixture(
      ScriptedTransport::always(ok_json(r#"{"status":"error","message":"Invalid patient"}"#)),
      None,
    );
    let err = f.client.submit_write("addFollowUp", &Map::new()).await.unwrap_err();
    assert!(matches!(err, SyncError::Api { .. }));
    assert_eq!(f.store.len().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_log_events_skipped_offline() {
    let f = fixture(ScriptedTransport::always(ok_json(r#"{"status":"success"}"#)), None);
    f.client.gateway.connectivity().set_online(false);

    assert_eq!(f.client.log_events(vec![json!({"e": 1})]).await, Delivery::Skipped);
    assert_eq!(f.transport.call_count(), 0);
  }

  #[tokio::test]
  async fn test_log_events_confirmed_and_unconfirmed() {
    let f = fixture(ScriptedTransport::always(ok_json(r#"{"status":"success"}"#)), None);
    assert_eq!(f.client.log_events(vec![json!({"e": 1})]).await, Delivery::Confirmed);

    let f = fixture(ScriptedTransport::always(Ok(Response::new(503, ""))), None);
    let delivery = f.client.log_events(vec![json!({"e": 1})]).await;
    assert_eq!(delivery, Delivery::Unconfirmed);
    assert!(delivery.is_success());
  }
}
