use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::info;

use crate::client::ServiceClient;
use crate::config::Config;
use crate::gateway::{Connectivity, Gateway, HttpTransport};
use crate::notify::Notifier;
use crate::queue::{QueueStorage, SqliteQueue, WriteQueue};
use crate::session::SessionStore;
use crate::sync::{SyncProcessor, SyncTrigger};
use crate::worker::{Worker, WorkerHandle};

/// Every service object of a running process, wired from one [`Config`].
pub struct App {
  pub config: Config,
  pub store: Arc<dyn QueueStorage>,
  pub notifier: Notifier,
  pub session: SessionStore,
  pub connectivity: Connectivity,
  pub trigger: SyncTrigger,
  pub gateway: Gateway,
  pub outbox: WriteQueue,
  pub processor: SyncProcessor,
  pub client: ServiceClient,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let store: Arc<dyn QueueStorage> = Arc::new(match &config.queue.path {
      Some(path) => SqliteQueue::open(path),
      None => SqliteQueue::open_default(),
    }?);

    let notifier = Notifier::new();
    let session = SessionStore::new().with_notifier(notifier.clone());
    if let Some(token) = Config::get_session_token() {
      session.set(&token, None);
    }

    let connectivity = Connectivity::default();
    let gateway_config = config.gateway();
    let transport = HttpTransport::new(gateway_config.timeout)
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;
    let gateway = Gateway::new(Arc::new(transport), gateway_config)
      .with_session(session.clone(), config.service.url.clone())
      .with_connectivity(connectivity.clone());

    let trigger = SyncTrigger::new();
    let outbox = WriteQueue::new(
      store.clone(),
      trigger.clone(),
      config.worker.sync_tag.clone(),
      config.queue.max_retries,
    );
    let processor = SyncProcessor::new(store.clone(), gateway.clone(), notifier.clone());
    let client = ServiceClient::new(
      gateway.clone(),
      config.service.url.clone(),
      session.clone(),
      outbox.clone(),
    )
    .with_ttls(config.cache_ttls())
    .with_hash_algorithm(config.cache.fingerprint);

    info!(url = %config.service.url, pending = store.len()?, "Sync engine ready");

    Ok(Self {
      config,
      store,
      notifier,
      session,
      connectivity,
      trigger,
      gateway,
      outbox,
      processor,
      client,
    })
  }

  /// Build the background worker for this app.
  pub fn worker(&self) -> (Worker, WorkerHandle) {
    let (worker, handle) = Worker::new(
      self.processor.clone(),
      self.trigger.clone(),
      self.connectivity.clone(),
      self.config.worker.sync_tag.clone(),
    );
    match self.config.poll_interval() {
      Some(interval) => (worker.with_poll_interval(interval), handle),
      None => (worker, handle),
    }
  }
}
