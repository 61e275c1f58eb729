//! SQLite-backed `CheckpointStore` with durable persistence.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::{
    Checkpoint, CheckpointStore, CheckpointStoreError, NewCheckpoint, SessionState, StoreResult,
};

const CHECKPOINT_COLUMNS: &str = "id, session_id, timestamp, token_count, message_count, \
     context_hash, state, compressed, created_at";

/// Persistent SQLite checkpoint backend.
///
/// Checkpoints reference a row in `sessions`; deleting the session cascades
/// to its checkpoints.
#[derive(Debug)]
pub struct SqliteCheckpointStore {
    db_path: PathBuf,
}

impl SqliteCheckpointStore {
    /// Opens or creates the database at `path`, creating schema if needed.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self { db_path };
        let connection = store.open_connection()?;
        initialize_schema(&connection)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Inserts or refreshes the session row checkpoints hang off.
    pub fn upsert_session(&self, session: &SessionState) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            r#"
            INSERT INTO sessions (
                id, parent_session_id, title, message_count, prompt_tokens,
                completion_tokens, cost, summary_message_id, created_at_ms, updated_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
                parent_session_id = excluded.parent_session_id,
                title = excluded.title,
                message_count = excluded.message_count,
                prompt_tokens = excluded.prompt_tokens,
                completion_tokens = excluded.completion_tokens,
                cost = excluded.cost,
                summary_message_id = excluded.summary_message_id,
                updated_at_ms = excluded.updated_at_ms
            "#,
            params![
                session.id,
                session.parent_session_id,
                session.title,
                count_to_db("message_count", session.message_count)?,
                count_to_db("prompt_tokens", session.prompt_tokens)?,
                count_to_db("completion_tokens", session.completion_tokens)?,
                session.cost,
                session.summary_message_id,
                session.created_at_ms,
                session.updated_at_ms,
            ],
        )?;
        Ok(())
    }

    /// Deletes a session row and, through the foreign key, its checkpoints.
    pub fn delete_session(&self, session_id: &str) -> StoreResult<bool> {
        let connection = self.open_connection()?;
        let removed = connection.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        Ok(removed > 0)
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        Ok(connection)
    }
}

fn initialize_schema(connection: &Connection) -> StoreResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            parent_session_id TEXT NULL,
            title TEXT NOT NULL DEFAULT '',
            message_count INTEGER NOT NULL DEFAULT 0 CHECK (message_count >= 0),
            prompt_tokens INTEGER NOT NULL DEFAULT 0 CHECK (prompt_tokens >= 0),
            completion_tokens INTEGER NOT NULL DEFAULT 0 CHECK (completion_tokens >= 0),
            cost REAL NOT NULL DEFAULT 0,
            summary_message_id TEXT NULL,
            created_at_ms INTEGER NOT NULL DEFAULT 0,
            updated_at_ms INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS checkpoints (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            timestamp TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            token_count INTEGER NOT NULL DEFAULT 0 CHECK (token_count >= 0),
            message_count INTEGER NOT NULL DEFAULT 0 CHECK (message_count >= 0),
            context_hash TEXT NOT NULL,
            state BLOB NOT NULL,
            compressed INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_checkpoints_session_created
            ON checkpoints (session_id, created_at);
        "#,
    )?;
    Ok(())
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn insert_checkpoint(&self, checkpoint: NewCheckpoint) -> StoreResult<Checkpoint> {
        let connection = self.open_connection()?;
        let created_at = Utc::now();
        connection.execute(
            r#"
            INSERT INTO checkpoints (
                id, session_id, timestamp, token_count, message_count,
                context_hash, state, compressed, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                checkpoint.id,
                checkpoint.session_id,
                timestamp_to_db(checkpoint.timestamp),
                count_to_db("token_count", checkpoint.token_count)?,
                count_to_db("message_count", checkpoint.message_count)?,
                checkpoint.context_hash,
                checkpoint.state,
                checkpoint.compressed,
                timestamp_to_db(created_at),
            ],
        )?;
        Ok(Checkpoint {
            id: checkpoint.id,
            session_id: checkpoint.session_id,
            timestamp: truncate_to_db_precision(checkpoint.timestamp)?,
            token_count: checkpoint.token_count,
            message_count: checkpoint.message_count,
            context_hash: checkpoint.context_hash,
            state: checkpoint.state,
            compressed: checkpoint.compressed,
            created_at: truncate_to_db_precision(created_at)?,
        })
    }

    async fn get_checkpoint(&self, id: &str) -> StoreResult<Option<Checkpoint>> {
        let connection = self.open_connection()?;
        let row = connection
            .query_row(
                &format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE id = ?1"),
                params![id],
                CheckpointRow::from_row,
            )
            .optional()?;
        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    async fn list_checkpoints(&self, session_id: &str) -> StoreResult<Vec<Checkpoint>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE session_id = ?1 \
             ORDER BY created_at DESC, rowid DESC"
        ))?;
        let rows = statement
            .query_map(params![session_id], CheckpointRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(CheckpointRow::into_checkpoint).collect()
    }

    async fn latest_checkpoint(&self, session_id: &str) -> StoreResult<Option<Checkpoint>> {
        let connection = self.open_connection()?;
        let row = connection
            .query_row(
                &format!(
                    "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE session_id = ?1 \
                     ORDER BY created_at DESC, rowid DESC LIMIT 1"
                ),
                params![session_id],
                CheckpointRow::from_row,
            )
            .optional()?;
        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    async fn delete_checkpoint(&self, id: &str) -> StoreResult<bool> {
        let connection = self.open_connection()?;
        let removed = connection.execute("DELETE FROM checkpoints WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    async fn delete_oldest_beyond(&self, session_id: &str, keep: usize) -> StoreResult<usize> {
        let keep = i64::try_from(keep).map_err(|_| CheckpointStoreError::InvalidPersistedValue {
            field: "keep",
            value: keep.to_string(),
        })?;
        let connection = self.open_connection()?;
        let removed = connection.execute(
            r#"
            DELETE FROM checkpoints
            WHERE session_id = ?1
              AND id NOT IN (
                SELECT id FROM checkpoints
                WHERE session_id = ?1
                ORDER BY created_at DESC, rowid DESC
                LIMIT ?2
              )
            "#,
            params![session_id, keep],
        )?;
        Ok(removed)
    }
}

struct CheckpointRow {
    id: String,
    session_id: String,
    timestamp: String,
    token_count: i64,
    message_count: i64,
    context_hash: String,
    state: Vec<u8>,
    compressed: bool,
    created_at: String,
}

impl CheckpointRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            timestamp: row.get(2)?,
            token_count: row.get(3)?,
            message_count: row.get(4)?,
            context_hash: row.get(5)?,
            state: row.get(6)?,
            compressed: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn into_checkpoint(self) -> StoreResult<Checkpoint> {
        Ok(Checkpoint {
            id: self.id,
            session_id: self.session_id,
            timestamp: timestamp_from_db(&self.timestamp)?,
            token_count: count_from_db("token_count", self.token_count)?,
            message_count: count_from_db("message_count", self.message_count)?,
            context_hash: self.context_hash,
            state: self.state,
            compressed: self.compressed,
            created_at: timestamp_from_db(&self.created_at)?,
        })
    }
}

// Millisecond precision with a `Z` suffix matches the column defaults and sorts lexically.
fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn timestamp_from_db(value: &str) -> StoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn truncate_to_db_precision(value: DateTime<Utc>) -> StoreResult<DateTime<Utc>> {
    timestamp_from_db(&timestamp_to_db(value))
}

fn count_to_db(field: &'static str, value: u64) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| CheckpointStoreError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}

fn count_from_db(field: &'static str, value: i64) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| CheckpointStoreError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}
