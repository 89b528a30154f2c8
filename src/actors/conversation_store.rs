//! Conversation Store Actor - thread-keyed checkpoint persistence.
//!
//! This actor handles:
//! - Loading and saving per-conversation checkpoint blobs in an embedded
//!   SQLite file (WAL mode, so concurrent readers never block)
//! - Compare-and-swap writes on a per-thread version counter
//! - TTL cleanup of stale threads, driven by a background task
//!
//! The checkpoint timestamp lives inside the persisted blob, not in a
//! separate column; cleanup reads it back with `json_extract`. Blocking
//! SQLite calls run in `spawn_blocking` with a bounded retry loop for
//! lock contention.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::protocol::Message;
use crate::settings::ConversationSettings;

/// Distinguishable error for a stale CAS write.
pub const VERSION_CONFLICT: &str = "checkpoint version conflict";

pub fn is_version_conflict(error: &str) -> bool {
    error.contains(VERSION_CONFLICT)
}

/// One persisted conversation snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub messages: Vec<Message>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VersionedCheckpoint {
    pub version: i64,
    pub checkpoint: Checkpoint,
}

/// Messages for the Conversation Store Actor
pub enum ConversationMsg {
    Get {
        conversation_id: String,
        respond_to: oneshot::Sender<Result<Option<VersionedCheckpoint>, String>>,
    },
    /// Compare-and-swap write: `expected_version` 0 means "new thread".
    /// Returns the new version, or a version-conflict error for a stale
    /// writer.
    Put {
        conversation_id: String,
        checkpoint: Checkpoint,
        expected_version: i64,
        respond_to: oneshot::Sender<Result<i64, String>>,
    },
    /// Remove threads older than the configured max age. Returns the
    /// number of threads reaped.
    Cleanup {
        respond_to: oneshot::Sender<Result<usize, String>>,
    },
}

#[derive(Clone)]
pub struct ConversationHandle {
    tx: mpsc::Sender<ConversationMsg>,
}

impl ConversationHandle {
    pub fn from_channel(tx: mpsc::Sender<ConversationMsg>) -> Self {
        Self { tx }
    }

    pub fn spawn(settings: ConversationSettings) -> Self {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(ConversationStoreActor::new(rx, settings).run());
        Self { tx }
    }

    pub async fn get(
        &self,
        conversation_id: &str,
    ) -> Result<Option<VersionedCheckpoint>, String> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ConversationMsg::Get {
                conversation_id: conversation_id.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|_| "conversation store stopped".to_string())?;
        rx.await
            .map_err(|_| "conversation store dropped the reply".to_string())?
    }

    pub async fn put(
        &self,
        conversation_id: &str,
        checkpoint: Checkpoint,
        expected_version: i64,
    ) -> Result<i64, String> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ConversationMsg::Put {
                conversation_id: conversation_id.to_string(),
                checkpoint,
                expected_version,
                respond_to: tx,
            })
            .await
            .map_err(|_| "conversation store stopped".to_string())?;
        rx.await
            .map_err(|_| "conversation store dropped the reply".to_string())?
    }

    pub async fn cleanup(&self) -> Result<usize, String> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ConversationMsg::Cleanup { respond_to: tx })
            .await
            .map_err(|_| "conversation store stopped".to_string())?;
        rx.await
            .map_err(|_| "conversation store dropped the reply".to_string())?
    }
}

/// Background task reaping stale threads on the configured interval.
pub fn spawn_cleanup_task(handle: ConversationHandle, interval_hours: u64) {
    tokio::spawn(async move {
        let period = Duration::from_secs(interval_hours.max(1) * 3600);
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            match handle.cleanup().await {
                Ok(reaped) if reaped > 0 => {
                    tracing::info!(reaped, "conversation cleanup");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "conversation cleanup failed"),
            }
        }
    });
}

/// Conversation Store Actor
pub struct ConversationStoreActor {
    rx: mpsc::Receiver<ConversationMsg>,
    settings: ConversationSettings,
}

impl ConversationStoreActor {
    pub fn new(rx: mpsc::Receiver<ConversationMsg>, settings: ConversationSettings) -> Self {
        Self { rx, settings }
    }

    pub async fn run(mut self) {
        if let Err(e) = self.with_retries(init_schema).await {
            tracing::error!(error = %e, "conversation store failed to initialize");
            return;
        }
        tracing::info!(path = %self.settings.db_path.display(), "conversation store started");

        while let Some(msg) = self.rx.recv().await {
            match msg {
                ConversationMsg::Get {
                    conversation_id,
                    respond_to,
                } => {
                    let result = self
                        .with_retries(move |conn| get_checkpoint(conn, &conversation_id))
                        .await;
                    let _ = respond_to.send(result);
                }
                ConversationMsg::Put {
                    conversation_id,
                    checkpoint,
                    expected_version,
                    respond_to,
                } => {
                    let result = self
                        .with_retries(move |conn| {
                            put_checkpoint(conn, &conversation_id, &checkpoint, expected_version)
                        })
                        .await;
                    let _ = respond_to.send(result);
                }
                ConversationMsg::Cleanup { respond_to } => {
                    let max_age_hours = self.settings.max_age_hours;
                    let result = self
                        .with_retries(move |conn| cleanup(conn, max_age_hours))
                        .await;
                    let _ = respond_to.send(result);
                }
            }
        }

        tracing::info!("conversation store stopped");
    }

    /// Run a blocking store operation with bounded retries on lock
    /// contention. Version conflicts are not retried: the caller must
    /// reload and merge.
    async fn with_retries<T, F>(&self, op: F) -> Result<T, String>
    where
        T: Send + 'static,
        F: Fn(&Connection) -> Result<T, String> + Send + Sync + 'static,
    {
        let path = self.settings.db_path.clone();
        let attempts = self.settings.db_retry_attempts.max(1);
        let delay = Duration::from_millis(self.settings.db_retry_delay_ms);

        tokio::task::spawn_blocking(move || {
            let mut last_error = String::new();
            for attempt in 0..attempts {
                match open_connection(&path).and_then(|conn| op(&conn)) {
                    Ok(value) => return Ok(value),
                    Err(e) if is_version_conflict(&e) => return Err(e),
                    Err(e) => {
                        last_error = e;
                        if attempt + 1 < attempts {
                            std::thread::sleep(delay);
                        }
                    }
                }
            }
            Err(last_error)
        })
        .await
        .map_err(|e| format!("store task panicked: {}", e))?
    }
}

// ========== Blocking Store Operations ==========

fn open_connection(path: &PathBuf) -> Result<Connection, String> {
    let conn = Connection::open(path)
        .map_err(|e| format!("failed to open conversation store: {}", e))?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| format!("failed to enable WAL: {}", e))?;
    conn.busy_timeout(Duration::from_millis(250))
        .map_err(|e| format!("failed to set busy timeout: {}", e))?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<(), String> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS checkpoints (
            conversation_id TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            payload TEXT NOT NULL
        )",
        [],
    )
    .map_err(|e| format!("failed to create checkpoints table: {}", e))?;
    Ok(())
}

fn get_checkpoint(
    conn: &Connection,
    conversation_id: &str,
) -> Result<Option<VersionedCheckpoint>, String> {
    let mut stmt = conn
        .prepare("SELECT version, payload FROM checkpoints WHERE conversation_id = ?1")
        .map_err(|e| format!("failed to prepare get: {}", e))?;

    let row = stmt
        .query_row([conversation_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(format!("failed to read checkpoint: {}", other)),
        })?;

    match row {
        None => Ok(None),
        Some((version, payload)) => {
            let checkpoint: Checkpoint = serde_json::from_str(&payload)
                .map_err(|e| format!("corrupt checkpoint blob: {}", e))?;
            Ok(Some(VersionedCheckpoint {
                version,
                checkpoint,
            }))
        }
    }
}

fn put_checkpoint(
    conn: &Connection,
    conversation_id: &str,
    checkpoint: &Checkpoint,
    expected_version: i64,
) -> Result<i64, String> {
    let payload = serde_json::to_string(checkpoint)
        .map_err(|e| format!("failed to serialize checkpoint: {}", e))?;

    if expected_version == 0 {
        match conn.execute(
            "INSERT INTO checkpoints (conversation_id, version, payload) VALUES (?1, 1, ?2)",
            rusqlite::params![conversation_id, payload],
        ) {
            Ok(_) => Ok(1),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(format!("{}: thread already exists", VERSION_CONFLICT))
            }
            Err(e) => Err(format!("failed to insert checkpoint: {}", e)),
        }
    } else {
        let updated = conn
            .execute(
                "UPDATE checkpoints SET payload = ?1, version = version + 1 \
                 WHERE conversation_id = ?2 AND version = ?3",
                rusqlite::params![payload, conversation_id, expected_version],
            )
            .map_err(|e| format!("failed to update checkpoint: {}", e))?;
        if updated == 1 {
            Ok(expected_version + 1)
        } else {
            Err(format!(
                "{}: expected version {} is stale",
                VERSION_CONFLICT, expected_version
            ))
        }
    }
}

fn cleanup(conn: &Connection, max_age_hours: i64) -> Result<usize, String> {
    let cutoff = Utc::now().timestamp() - max_age_hours * 3600;
    conn.execute(
        "DELETE FROM checkpoints WHERE json_extract(payload, '$.updated_at') < ?1",
        [cutoff],
    )
    .map_err(|e| format!("failed to reap stale threads: {}", e))
}
