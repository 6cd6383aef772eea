//! Background worker that owns the sync processor.
//!
//! Drains happen in response to explicit commands (`SYNC_NOW`), reconnect
//! signals for the registered sync tag, trigger registrations while online,
//! and an optional periodic tick.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::error::SyncError;
use crate::gateway::Connectivity;
use crate::notify::SyncStatus;
use crate::sync::{SyncProcessor, SyncTrigger};

/// Messages accepted from clients, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
  #[serde(rename = "SYNC_NOW")]
  SyncNow,
  #[serde(rename = "GET_SYNC_STATUS")]
  GetSyncStatus,
  /// Platform reconnect signal for a registered tag
  #[serde(rename = "sync")]
  Sync { tag: String },
}

impl ClientMessage {
  pub fn parse(line: &str) -> Result<Self, SyncError> {
    serde_json::from_str(line.trim())
      .map_err(|e| SyncError::InvalidRequest(format!("unrecognized message: {}", e)))
  }
}

/// Worker commands
#[derive(Debug)]
pub enum WorkerCommand {
  /// Drain now, whatever the connectivity state
  SyncNow,
  /// Reply with a queue snapshot
  GetSyncStatus(oneshot::Sender<Result<SyncStatus, SyncError>>),
  /// Reconnect signal carrying a sync tag
  Signal(String),
}

/// Sends commands to a running [`Worker`]. The worker stops once every handle is dropped.
#[derive(Clone)]
pub struct WorkerHandle {
  tx: mpsc::UnboundedSender<WorkerCommand>,
}

impl WorkerHandle {
  pub fn sync_now(&self) -> Result<(), SyncError> {
    self.send(WorkerCommand::SyncNow)
  }

  pub fn signal(&self, tag: &str) -> Result<(), SyncError> {
    self.send(WorkerCommand::Signal(tag.to_string()))
  }

  pub async fn status(&self) -> Result<SyncStatus, SyncError> {
    let (reply, rx) = oneshot::channel();
    self.send(WorkerCommand::GetSyncStatus(reply))?;
    rx.await
      .map_err(|_| SyncError::InvalidRequest("worker stopped".to_string()))?
  }

  /// Forward a client message. Status requests return the snapshot.
  pub async fn dispatch(&self, message: ClientMessage) -> Result<Option<SyncStatus>, SyncError> {
    match message {
      ClientMessage::SyncNow => self.sync_now().map(|_| None),
      ClientMessage::GetSyncStatus => self.status().await.map(Some),
      ClientMessage::Sync { tag } => self.signal(&tag).map(|_| None),
    }
  }

  fn send(&self, command: WorkerCommand) -> Result<(), SyncError> {
    self
      .tx
      .send(command)
      .map_err(|_| SyncError::InvalidRequest("worker stopped".to_string()))
  }
}

/// Event loop around a [`SyncProcessor`].
pub struct Worker {
  processor: SyncProcessor,
  trigger: SyncTrigger,
  connectivity: Connectivity,
  sync_tag: String,
  poll_interval: Option<Duration>,
  rx: mpsc::UnboundedReceiver<WorkerCommand>,
}

impl Worker {
  pub fn new(
    processor: SyncProcessor,
    trigger: SyncTrigger,
    connectivity: Connectivity,
    sync_tag: impl Into<String>,
  ) -> (Self, WorkerHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = Self {
      processor,
      trigger,
      connectivity,
      sync_tag: sync_tag.into(),
      poll_interval: None,
      rx,
    };
    (worker, WorkerHandle { tx })
  }

  /// Also drain on a timer while online and the queue is not empty.
  pub fn with_poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = Some(interval).filter(|i| !i.is_zero());
    self
  }

  /// Run until every [`WorkerHandle`] is dropped.
  pub async fn run(mut self) {
    let mut ticker = self.poll_interval.map(|period| {
      let mut interval = tokio::time::interval(period);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
      interval
    });

    loop {
      tokio::select! {
        command = self.rx.recv() => match command {
          Some(command) => self.handle(command).await,
          None => break,
        },
        _ = self.trigger.armed() => {
          if self.connectivity.is_online() && self.trigger.take(&self.sync_tag) {
            debug!(tag = %self.sync_tag, "Trigger armed while online");
            self.drain().await;
          }
        }
        _ = tick(&mut ticker) => {
          if self.connectivity.is_online() && self.has_pending() {
            self.drain().await;
          }
        }
      }
    }

    info!("Sync worker stopped");
  }

  async fn handle(&self, command: WorkerCommand) {
    match command {
      WorkerCommand::SyncNow => {
        info!("Manual sync requested");
        self.drain().await;
      }
      WorkerCommand::GetSyncStatus(reply) => {
        let _ = reply.send(self.processor.status());
      }
      WorkerCommand::Signal(tag) if tag == self.sync_tag => {
        self.connectivity.set_online(true);
        let registered = self.trigger.take(&tag);
        if registered || self.has_pending() {
          info!(tag, "Background sync event");
          self.drain().await;
        }
      }
      WorkerCommand::Signal(tag) => debug!(tag, "Ignoring signal for unknown tag"),
    }
  }

  async fn drain(&self) {
    match self.processor.drain().await {
      Ok(report) => debug!(?report, "Drain pass finished"),
      Err(e) => error!("Sync pass failed: {}", e),
    }
  }

  fn has_pending(&self) -> bool {
    self
      .processor
      .store()
      .is_empty()
      .map(|empty| !empty)
      .unwrap_or(false)
  }
}

async fn tick(ticker: &mut Option<Interval>) {
  match ticker {
    Some(interval) => {
      interval.tick().await;
    }
    None => std::future::pending().await,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::gateway::testing::{ok_json, ScriptedTransport};
  use crate::gateway::{Gateway, GatewayConfig, Request};
  use crate::notify::{Notifier, SyncEvent};
  use crate::queue::{NewQueueEntry, QueueStorage, SqliteQueue};
  use crate::sync::DEFAULT_SYNC_TAG;
  use serde_json::json;
  use std::sync::Arc;
  use tokio::sync::broadcast::Receiver;

  struct Fixture {
    handle: WorkerHandle,
    store: Arc<SqliteQueue>,
    transport: Arc<ScriptedTransport>,
    trigger: SyncTrigger,
    connectivity: Connectivity,
    events: Receiver<SyncEvent>,
    worker: Option<Worker>,
  }

  fn fixture() -> Fixture {
    let transport = Arc::new(ScriptedTransport::always(ok_json(r#"{"status":"success"}"#)));
    let store = Arc::new(SqliteQueue::open_in_memory().unwrap());
    let notifier = Notifier::new();
    let events = notifier.subscribe();
    let connectivity = Connectivity::default();
    let gateway = Gateway::new(transport.clone(), GatewayConfig::default())
      .with_connectivity(connectivity.clone());
    let processor = SyncProcessor::new(store.clone(), gateway, notifier);
    let trigger = SyncTrigger::new();
    let (worker, handle) = Worker::new(
      processor,
      trigger.clone(),
      connectivity.clone(),
      DEFAULT_SYNC_TAG,
    );

    Fixture {
      handle,
      store,
      transport,
      trigger,
      connectivity,
      events,
      worker: Some(worker),
    }
  }

  fn enqueue(store: &SqliteQueue, action: &str) {
    let payload = json!({"action": action});
    let request = Request::post_form("https://svc.test/exec", payload.as_object().unwrap());
    store
      .enqueue(&NewQueueEntry::from_request(&request, 5).unwrap())
      .unwrap();
  }

  #[test]
  fn test_parse_client_messages() {
    assert_eq!(ClientMessage::parse(r#"{"type":"SYNC_NOW"}"#).unwrap(), ClientMessage::SyncNow);
    assert_eq!(
      ClientMessage::parse(r#" {"type":"GET_SYNC_STATUS"} "#).unwrap(),
      ClientMessage::GetSyncStatus
    );
    assert_eq!(
      ClientMessage::parse(r#"{"type":"sync","tag":"sync-epicare-data"}"#).unwrap(),
      ClientMessage::Sync {
        tag: DEFAULT_SYNC_TAG.into()
      }
    );
    assert!(matches!(
      ClientMessage::parse(r#"{"type":"REBOOT"}"#),
      Err(SyncError::InvalidRequest(_))
    ));
  }

  #[tokio::test]
  async fn test_sync_now_drains() {
    let mut f = fixture();
    enqueue(&f.store, "addPatient");
    tokio::spawn(f.worker.take().unwrap().run());

    f.handle.sync_now().unwrap();

    assert_eq!(
      f.events.recv().await.unwrap(),
      SyncEvent::SyncSuccess {
        action: "addPatient".into(),
        data: Some(json!({"status": "success"}))
      }
    );
    assert_eq!(f.events.recv().await.unwrap(), SyncEvent::complete());
    assert_eq!(f.handle.status().await.unwrap().queue_length, 0);
  }

  #[tokio::test]
  async fn test_status_reports_queue() {
    let mut f = fixture();
    enqueue(&f.store, "addFollowUp");
    f.connectivity.set_online(false);
    tokio::spawn(f.worker.take().unwrap().run());

    let status = f
      .handle
      .dispatch(ClientMessage::GetSyncStatus)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(status.queue_length, 1);
    assert_eq!(status.items[0].action, "addFollowUp");
    assert_eq!(f.transport.call_count(), 0);
  }

  #[tokio::test]
  async fn test_reconnect_signal_restores_connectivity_and_drains() {
    let mut f = fixture();
    enqueue(&f.store, "addFollowUp");
    f.connectivity.set_online(false);
    f.trigger.register(DEFAULT_SYNC_TAG);
    tokio::spawn(f.worker.take().unwrap().run());

    f.handle
      .dispatch(ClientMessage::Sync {
        tag: DEFAULT_SYNC_TAG.into(),
      })
      .await
      .unwrap();

    f.events.recv().await.unwrap();
    assert_eq!(f.events.recv().await.unwrap(), SyncEvent::complete());
    assert!(f.connectivity.is_online());
    assert!(!f.trigger.is_registered(DEFAULT_SYNC_TAG));
  }

  #[tokio::test]
  async fn test_unknown_tag_is_ignored() {
    let mut f = fixture();
    enqueue(&f.store, "addFollowUp");
    f.connectivity.set_online(false);
    tokio::spawn(f.worker.take().unwrap().run());

    f.handle.signal("some-other-tag").unwrap();
    // Status is answered after the signal, so the signal has been handled
    assert_eq!(f.handle.status().await.unwrap().queue_length, 1);
    assert_eq!(f.transport.call_count(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_poll_interval_drains_pending_work() {
    let mut f = fixture();
    let worker = f.worker.take().unwrap().with_poll_interval(Duration::from_secs(30));
    tokio::spawn(worker.run());

    // First tick fires immediately with nothing to do
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(f.transport.call_count(), 0);

    enqueue(&f.store, "addPatient");
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(f.transport.call_count(), 1);
    assert_eq!(f.store.len().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_worker_stops_when_handles_dropped() {
    let mut f = fixture();
    let task = tokio::spawn(f.worker.take().unwrap().run());
    drop(f.handle);
    task.await.unwrap();
  }
}
