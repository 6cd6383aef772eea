//! Queue storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::types::{NewQueueEntry, OfflineRecord, QueueEntry};
use crate::error::SyncError;
use crate::gateway::Method;

/// Trait for durable queue backends.
///
/// Removing or updating an id that no longer exists is a no-op returning
/// `false`: a concurrent drain may already have removed it.
pub trait QueueStorage: Send + Sync {
  /// Persist a pending write and return its store-assigned id.
  fn enqueue(&self, entry: &NewQueueEntry) -> Result<i64, SyncError>;

  /// Persist a pending write together with the offline record it creates.
  ///
  /// Both rows are stored or neither is. Returns `(entry_id, record_id)`.
  fn enqueue_with_record(
    &self,
    entry: &NewQueueEntry,
    record_type: &str,
    payload: &Value,
  ) -> Result<(i64, i64), SyncError>;

  /// All pending writes in enqueue order.
  fn list_all(&self) -> Result<Vec<QueueEntry>, SyncError>;

  /// Current state of a single entry.
  fn get(&self, id: i64) -> Result<Option<QueueEntry>, SyncError>;

  fn remove(&self, id: i64) -> Result<bool, SyncError>;

  /// Record a failed replay: set the retry count and stamp `last_retry_at`.
  fn update_retry(&self, id: i64, retry_count: u32) -> Result<bool, SyncError>;

  fn len(&self) -> Result<usize, SyncError>;

  fn is_empty(&self) -> Result<bool, SyncError> {
    Ok(self.len()? == 0)
  }

  /// Store a record created while offline.
  fn create_record(&self, record_type: &str, payload: &Value) -> Result<i64, SyncError>;

  fn get_record(&self, id: i64) -> Result<Option<OfflineRecord>, SyncError>;

  /// Flag a record as delivered, attaching the backend's identifier if known.
  fn mark_synced(&self, id: i64, entity_id: Option<&str>) -> Result<bool, SyncError>;

  fn records_by_type(&self, record_type: &str) -> Result<Vec<OfflineRecord>, SyncError>;

  fn unsynced_records(&self) -> Result<Vec<OfflineRecord>, SyncError>;

  fn records_for_entity(&self, entity_id: &str) -> Result<Vec<OfflineRecord>, SyncError>;
}

/// SQLite-based queue store.
pub struct SqliteQueue {
  conn: Mutex<Connection>,
}

/// Schema for queue tables.
const QUEUE_SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

-- Pending writes awaiting confirmed delivery
CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    body TEXT NOT NULL,
    action TEXT NOT NULL,
    enqueued_at TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL,
    last_retry_at TEXT,
    record_id INTEGER
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_enqueued ON sync_queue(enqueued_at);
CREATE INDEX IF NOT EXISTS idx_sync_queue_action ON sync_queue(action);
CREATE INDEX IF NOT EXISTS idx_sync_queue_retry ON sync_queue(retry_count);

-- Records created while offline, retained for audit
CREATE TABLE IF NOT EXISTS offline_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_type TEXT NOT NULL,
    associated_entity_id TEXT,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_offline_records_type ON offline_records(record_type);
CREATE INDEX IF NOT EXISTS idx_offline_records_entity ON offline_records(associated_entity_id);
CREATE INDEX IF NOT EXISTS idx_offline_records_created ON offline_records(created_at);
CREATE INDEX IF NOT EXISTS idx_offline_records_synced ON offline_records(synced);
"#;

const ENTRY_COLUMNS: &str = "id, url, method, headers, body, action, enqueued_at, \
   retry_count, max_retries, last_retry_at, record_id";

const RECORD_COLUMNS: &str =
  "id, record_type, associated_entity_id, payload, created_at, synced";

impl SqliteQueue {
  /// Open the queue at the default location.
  pub fn open_default() -> Result<Self, SyncError> {
    Self::open(&Self::default_path()?)
  }

  /// Open or create the queue database at `path`.
  pub fn open(path: &Path) -> Result<Self, SyncError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        SyncError::StorageUnavailable(format!("Failed to create queue directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      SyncError::StorageUnavailable(format!(
        "Failed to open queue database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::from_connection(conn)
  }

  /// Volatile queue, used by tests and dry runs.
  pub fn open_in_memory() -> Result<Self, SyncError> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> Result<Self, SyncError> {
    // Foreground enqueue and background drain may hold the file concurrently
    conn.busy_timeout(Duration::from_secs(5))?;

    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf, SyncError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| {
        SyncError::StorageUnavailable("Could not determine data directory".into())
      })?;

    Ok(data_dir.join("epicare-sync").join("queue.db"))
  }

  fn run_migrations(&self) -> Result<(), SyncError> {
    self.lock()?.execute_batch(QUEUE_SCHEMA).map_err(|e| {
      SyncError::StorageUnavailable(format!("Failed to run queue migrations: {}", e))
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, SyncError> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::StorageUnavailable(format!("Lock poisoned: {}", e)))
  }

  fn insert_entry(conn: &Connection, entry: &NewQueueEntry) -> Result<i64, SyncError> {
    let headers = serde_json::to_string(&entry.headers)?;

    conn
      .execute(
        "INSERT INTO sync_queue
           (url, method, headers, body, action, enqueued_at, retry_count, max_retries, record_id)
         VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)",
        params![
          entry.url,
          entry.method.as_str(),
          headers,
          entry.body,
          entry.action,
          Utc::now().to_rfc3339(),
          entry.max_retries,
          entry.record_id,
        ],
      )
      .map_err(|e| SyncError::StorageUnavailable(format!("Failed to enqueue write: {}", e)))?;

    Ok(conn.last_insert_rowid())
  }

  fn insert_record(
    conn: &Connection,
    record_type: &str,
    payload: &Value,
  ) -> Result<i64, SyncError> {
    conn
      .execute(
        "INSERT INTO offline_records (record_type, payload, created_at, synced)
         VALUES (?, ?, ?, 0)",
        params![record_type, payload.to_string(), Utc::now().to_rfc3339()],
      )
      .map_err(|e| {
        SyncError::StorageUnavailable(format!("Failed to store offline record: {}", e))
      })?;

    Ok(conn.last_insert_rowid())
  }

  fn query_records(
    &self,
    filter: &str,
    param: Option<&dyn rusqlite::ToSql>,
  ) -> Result<Vec<OfflineRecord>, SyncError> {
    let conn = self.lock()?;
    let sql = format!(
      "SELECT {} FROM offline_records {} ORDER BY id",
      RECORD_COLUMNS, filter
    );
    let mut stmt = conn.prepare(&sql)?;

    let params: Vec<&dyn rusqlite::ToSql> = param.into_iter().collect();
    let rows = stmt
      .query_map(params.as_slice(), RecordRow::read)?
      .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(RecordRow::into_record).collect()
  }
}

impl QueueStorage for SqliteQueue {
  fn enqueue(&self, entry: &NewQueueEntry) -> Result<i64, SyncError> {
    let conn = self.lock()?;
    Self::insert_entry(&conn, entry)
  }

  fn enqueue_with_record(
    &self,
    entry: &NewQueueEntry,
    record_type: &str,
    payload: &Value,
  ) -> Result<(i64, i64), SyncError> {
    let mut conn = self.lock()?;
    // Dropping the transaction without commit rolls the record back
    let tx = conn.transaction()?;

    let record_id = Self::insert_record(&tx, record_type, payload)?;
    let entry_id = Self::insert_entry(&tx, &entry.clone().with_record(record_id))?;

    tx.commit()?;
    Ok((entry_id, record_id))
  }

  fn list_all(&self) -> Result<Vec<QueueEntry>, SyncError> {
    let conn = self.lock()?;
    let sql = format!("SELECT {} FROM sync_queue ORDER BY id", ENTRY_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;

    let rows = stmt
      .query_map([], EntryRow::read)?
      .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(EntryRow::into_entry).collect()
  }

  fn get(&self, id: i64) -> Result<Option<QueueEntry>, SyncError> {
    let conn = self.lock()?;
    let sql = format!("SELECT {} FROM sync_queue WHERE id = ?", ENTRY_COLUMNS);

    let row = conn
      .query_row(&sql, params![id], EntryRow::read)
      .optional()?;

    row.map(EntryRow::into_entry).transpose()
  }

  fn remove(&self, id: i64) -> Result<bool, SyncError> {
    let conn = self.lock()?;
    let changed = conn
      .execute("DELETE FROM sync_queue WHERE id = ?", params![id])
      .map_err(|e| {
        SyncError::StorageUnavailable(format!("Failed to remove entry {}: {}", id, e))
      })?;

    Ok(changed > 0)
  }

  fn update_retry(&self, id: i64, retry_count: u32) -> Result<bool, SyncError> {
    let conn = self.lock()?;
    // Clamped so retry_count never exceeds max_retries
    let changed = conn
      .execute(
        "UPDATE sync_queue SET retry_count = MIN(?, max_retries), last_retry_at = ? WHERE id = ?",
        params![retry_count, Utc::now().to_rfc3339(), id],
      )
      .map_err(|e| {
        SyncError::StorageUnavailable(format!("Failed to update entry {}: {}", id, e))
      })?;

    Ok(changed > 0)
  }

  fn len(&self) -> Result<usize, SyncError> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
    Ok(count as usize)
  }

  fn create_record(&self, record_type: &str, payload: &Value) -> Result<i64, SyncError> {
    let conn = self.lock()?;
    Self::insert_record(&conn, record_type, payload)
  }

  fn get_record(&self, id: i64) -> Result<Option<OfflineRecord>, SyncError> {
    let conn = self.lock()?;
    let sql = format!("SELECT {} FROM offline_records WHERE id = ?", RECORD_COLUMNS);

    let row = conn
      .query_row(&sql, params![id], RecordRow::read)
      .optional()?;

    row.map(RecordRow::into_record).transpose()
  }

  fn mark_synced(&self, id: i64, entity_id: Option<&str>) -> Result<bool, SyncError> {
    let conn = self.lock()?;
    let changed = conn.execute(
      "UPDATE offline_records
       SET synced = 1, associated_entity_id = COALESCE(?, associated_entity_id)
       WHERE id = ?",
      params![entity_id, id],
    )?;

    Ok(changed > 0)
  }

  fn records_by_type(&self, record_type: &str) -> Result<Vec<OfflineRecord>, SyncError> {
    self.query_records(
      "WHERE record_type = ?",
      Some(&record_type as &dyn rusqlite::ToSql),
    )
  }

  fn unsynced_records(&self) -> Result<Vec<OfflineRecord>, SyncError> {
    self.query_records("WHERE synced = 0", None)
  }

  fn records_for_entity(&self, entity_id: &str) -> Result<Vec<OfflineRecord>, SyncError> {
    self.query_records(
      "WHERE associated_entity_id = ?",
      Some(&entity_id as &dyn rusqlite::ToSql),
    )
  }
}

/// Raw `sync_queue` row before decoding.
struct EntryRow {
  id: i64,
  url: String,
  method: String,
  headers: String,
  body: String,
  action: String,
  enqueued_at: String,
  retry_count: u32,
  max_retries: u32,
  last_retry_at: Option<String>,
  record_id: Option<i64>,
}

impl EntryRow {
  fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      url: row.get(1)?,
      method: row.get(2)?,
      headers: row.get(3)?,
      body: row.get(4)?,
      action: row.get(5)?,
      enqueued_at: row.get(6)?,
      retry_count: row.get(7)?,
      max_retries: row.get(8)?,
      last_retry_at: row.get(9)?,
      record_id: row.get(10)?,
    })
  }

  fn into_entry(self) -> Result<QueueEntry, SyncError> {
    let method: Method = self.method.parse()?;
    let headers: BTreeMap<String, String> = serde_json::from_str(&self.headers)?;

    Ok(QueueEntry {
      id: self.id,
      url: self.url,
      method,
      headers,
      body: self.body,
      action: self.action,
      enqueued_at: parse_datetime(&self.enqueued_at)?,
      retry_count: self.retry_count,
      max_retries: self.max_retries,
      last_retry_at: self.last_retry_at.as_deref().map(parse_datetime).transpose()?,
      record_id: self.record_id,
    })
  }
}

/// Raw `offline_records` row before decoding.
struct RecordRow {
  id: i64,
  record_type: String,
  associated_entity_id: Option<String>,
  payload: String,
  created_at: String,
  synced: bool,
}

impl RecordRow {
  fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      record_type: row.get(1)?,
      associated_entity_id: row.get(2)?,
      payload: row.get(3)?,
      created_at: row.get(4)?,
      synced: row.get(5)?,
    })
  }

  fn into_record(self) -> Result<OfflineRecord, SyncError> {
    Ok(OfflineRecord {
      id: self.id,
      record_type: self.record_type,
      associated_entity_id: self.associated_entity_id,
      payload: serde_json::from_str(&self.payload)?,
      created_at: parse_datetime(&self.created_at)?,
      synced: self.synced,
    })
  }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, SyncError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| {
      SyncError::StorageUnavailable(format!("Failed to parse datetime '{}': {}", s, e))
    })
}
