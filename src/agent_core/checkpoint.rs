//! Checkpoint persistence for sessions and pipeline runs.
//!
//! A checkpoint is one JSON record per `(namespace, thread_id)`:
//! `{schema_version, thread_id, created_at, history, step_count, pipeline_context?}`.
//! Unknown fields are ignored and missing optional fields take defaults, so
//! records written by older versions still load. A record that cannot be
//! parsed at all surfaces as `CheckpointCorruption`.
//!
//! Writers must be serialized per thread id; [`ThreadLeases`] enforces one
//! active engine or pipeline per thread id without any global lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use super::errors::AgentError;
use super::orchestrator::PipelineContext;
use super::types::Session;
use crate::inference::types::Message;

/// Current record layout version.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

// ─── Record ─────────────────────────────────────────────────────────────────

/// Persisted state of one thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    #[serde(default = "legacy_schema_version")]
    pub schema_version: u32,
    pub thread_id: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<Message>,
    #[serde(default)]
    pub step_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_context: Option<PipelineContext>,
}

/// Records written before versioning carry no `schema_version`.
fn legacy_schema_version() -> u32 {
    0
}

impl CheckpointRecord {
    pub fn from_session(session: &Session) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            thread_id: session.thread_id().to_string(),
            created_at: session.created_at(),
            history: session.history().to_vec(),
            step_count: session.step_count(),
            pipeline_context: None,
        }
    }

    /// A record holding only pipeline state.
    pub fn for_pipeline(run_id: &str, context: PipelineContext, created_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            thread_id: run_id.to_string(),
            created_at,
            history: Vec::new(),
            step_count: 0,
            pipeline_context: Some(context),
        }
    }

    pub fn into_session(self) -> Session {
        Session::restore(self.thread_id, self.history, self.step_count, self.created_at)
    }

    pub fn to_json(&self) -> Result<String, AgentError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a stored record. Any parse failure is `CheckpointCorruption`.
    pub fn from_json(thread_id: &str, raw: &str) -> Result<Self, AgentError> {
        let record: Self =
            serde_json::from_str(raw).map_err(|e| AgentError::CheckpointCorruption {
                thread_id: thread_id.to_string(),
                reason: e.to_string(),
            })?;
        if record.thread_id != thread_id {
            return Err(AgentError::CheckpointCorruption {
                thread_id: thread_id.to_string(),
                reason: format!("record belongs to thread '{}'", record.thread_id),
            });
        }
        if record.schema_version > CHECKPOINT_SCHEMA_VERSION {
            tracing::warn!(
                thread_id,
                schema_version = record.schema_version,
                supported = CHECKPOINT_SCHEMA_VERSION,
                "checkpoint written by a newer version; unknown fields ignored"
            );
        }
        Ok(record)
    }
}

// ─── Store Interface ────────────────────────────────────────────────────────

/// Durable storage for checkpoint records.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Insert or replace the record for `record.thread_id`.
    async fn save(&self, record: &CheckpointRecord) -> Result<(), AgentError>;

    /// Load the record for `thread_id`, if any.
    async fn load(&self, thread_id: &str) -> Result<Option<CheckpointRecord>, AgentError>;

    /// All thread ids in this store's namespace, sorted.
    async fn list_threads(&self) -> Result<Vec<String>, AgentError>;

    /// Delete a thread. Returns whether a record existed.
    async fn purge(&self, thread_id: &str) -> Result<bool, AgentError>;
}

// ─── MemoryCheckpointStore ──────────────────────────────────────────────────

/// In-process store. Records are kept in their serialized form so loads go
/// through the same decoding path as durable stores.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    records: Mutex<HashMap<String, String>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store raw JSON for `thread_id` (for imports and tests).
    pub fn insert_raw(&self, thread_id: &str, raw: &str) {
        self.lock().insert(thread_id.to_string(), raw.to_string());
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, record: &CheckpointRecord) -> Result<(), AgentError> {
        let raw = record.to_json()?;
        self.lock().insert(record.thread_id.clone(), raw);
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<CheckpointRecord>, AgentError> {
        let raw = self.lock().get(thread_id).cloned();
        raw.map(|r| CheckpointRecord::from_json(thread_id, &r))
            .transpose()
    }

    async fn list_threads(&self) -> Result<Vec<String>, AgentError> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn purge(&self, thread_id: &str) -> Result<bool, AgentError> {
        Ok(self.lock().remove(thread_id).is_some())
    }
}

// ─── SqliteCheckpointStore ──────────────────────────────────────────────────

/// Connections kept per file-backed store.
const FILE_POOL_SIZE: usize = 4;

/// How long a writer waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed store. WAL mode; one row per `(namespace, thread_id)`.
///
/// Statements run on the blocking pool over a small set of connections, so
/// independent threads never wait on one shared handle. An in-memory
/// database lives in a single connection and is therefore used serially.
pub struct SqliteCheckpointStore {
    path: String,
    namespace: String,
    idle: Arc<Mutex<Vec<Connection>>>,
    permits: Arc<Semaphore>,
}

impl SqliteCheckpointStore {
    /// Open (or create) the checkpoint database at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str, namespace: &str) -> Result<Self, AgentError> {
        let conn = open_connection(path)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS checkpoints (
                namespace TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                schema_version INTEGER NOT NULL,
                record TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (namespace, thread_id)
            );
            ",
        )?;

        let pool_size = if path == ":memory:" { 1 } else { FILE_POOL_SIZE };
        tracing::info!(path, namespace, pool_size, "checkpoint store opened");
        Ok(Self {
            path: path.to_string(),
            namespace: namespace.to_string(),
            idle: Arc::new(Mutex::new(vec![conn])),
            permits: Arc::new(Semaphore::new(pool_size)),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Overwrite the raw record column (for imports and tests).
    pub async fn insert_raw(&self, thread_id: &str, raw: &str) -> Result<(), AgentError> {
        let (namespace, thread_id, raw) = (self.namespace.clone(), thread_id.to_string(), raw.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO checkpoints (namespace, thread_id, schema_version, record, updated_at)
                 VALUES (?1, ?2, 0, ?3, datetime('now'))",
                params![namespace, thread_id, raw],
            )?;
            Ok(())
        })
        .await
    }

    /// Run `op` on a pooled connection inside `spawn_blocking`.
    async fn with_conn<T, F>(&self, op: F) -> Result<T, AgentError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, AgentError> + Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AgentError::DatabaseError {
                reason: "checkpoint connection pool closed".into(),
            })?;
        let idle = self.idle.clone();
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let pooled = idle.lock().unwrap_or_else(|p| p.into_inner()).pop();
            let conn = match pooled {
                Some(conn) => conn,
                None => open_connection(&path)?,
            };
            let result = op(&conn);
            idle.lock().unwrap_or_else(|p| p.into_inner()).push(conn);
            result
        })
        .await
        .map_err(|e| AgentError::DatabaseError {
            reason: format!("checkpoint task failed: {e}"),
        })?
    }
}

fn open_connection(path: &str) -> Result<Connection, AgentError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // Enable WAL mode for concurrent reads
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, record: &CheckpointRecord) -> Result<(), AgentError> {
        let raw = record.to_json()?;
        let namespace = self.namespace.clone();
        let thread_id = record.thread_id.clone();
        let schema_version = record.schema_version;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO checkpoints (namespace, thread_id, schema_version, record, updated_at)
                 VALUES (?1, ?2, ?3, ?4, datetime('now'))
                 ON CONFLICT(namespace, thread_id) DO UPDATE SET
                    schema_version = excluded.schema_version,
                    record = excluded.record,
                    updated_at = excluded.updated_at",
                params![namespace, thread_id, schema_version, raw],
            )?;
            Ok(())
        })
        .await?;
        tracing::debug!(
            thread_id = %record.thread_id,
            messages = record.history.len(),
            step_count = record.step_count,
            "checkpoint saved"
        );
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<CheckpointRecord>, AgentError> {
        let (namespace, key) = (self.namespace.clone(), thread_id.to_string());
        let raw: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT record FROM checkpoints WHERE namespace = ?1 AND thread_id = ?2",
                        params![namespace, key],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        raw.map(|r| CheckpointRecord::from_json(thread_id, &r))
            .transpose()
    }

    async fn list_threads(&self) -> Result<Vec<String>, AgentError> {
        let namespace = self.namespace.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT thread_id FROM checkpoints WHERE namespace = ?1 ORDER BY thread_id",
            )?;
            let ids = stmt
                .query_map(params![namespace], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .await
    }

    async fn purge(&self, thread_id: &str) -> Result<bool, AgentError> {
        let (namespace, key) = (self.namespace.clone(), thread_id.to_string());
        let deleted = self
            .with_conn(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM checkpoints WHERE namespace = ?1 AND thread_id = ?2",
                    params![namespace, key],
                )?)
            })
            .await?;
        if deleted > 0 {
            tracing::info!(thread_id, namespace = %self.namespace, "thread purged");
        }
        Ok(deleted > 0)
    }
}

// ─── Thread Leases ──────────────────────────────────────────────────────────

/// Registry of thread ids currently driven by an engine or pipeline.
#[derive(Debug, Clone, Default)]
pub struct ThreadLeases {
    active: Arc<Mutex<HashSet<String>>>,
}

impl ThreadLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `thread_id`. Fails with `ThreadBusy` while another lease is held.
    pub fn acquire(&self, thread_id: &str) -> Result<ThreadLease, AgentError> {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if !active.insert(thread_id.to_string()) {
            return Err(AgentError::ThreadBusy {
                thread_id: thread_id.to_string(),
            });
        }
        Ok(ThreadLease {
            thread_id: thread_id.to_string(),
            active: self.active.clone(),
        })
    }

    pub fn is_active(&self, thread_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(thread_id)
    }
}

/// Exclusive claim on a thread id; released on drop.
#[derive(Debug)]
pub struct ThreadLease {
    thread_id: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl ThreadLease {
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }
}

impl Drop for ThreadLease {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.thread_id);
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
