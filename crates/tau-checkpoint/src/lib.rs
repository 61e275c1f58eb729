//! Session checkpoints: immutable, integrity-hashed snapshots of resumable session state.
//!
//! [`CheckpointService`] serializes a [`SessionState`] into a versioned JSON
//! envelope, optionally gzips it, hashes the persisted bytes and stores the
//! record through a [`CheckpointStore`] backend.
use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tau_core::{bool_from_env, integer_from_env, EnvConfigError};
use thiserror::Error;

mod codec;
mod memory;
mod service;
mod sqlite;

pub use codec::CHECKPOINT_SCHEMA_VERSION;
pub use memory::InMemoryCheckpointStore;
pub use service::{interval_elapsed, should_checkpoint, CheckpointService};
pub use sqlite::SqliteCheckpointStore;

pub const CHECKPOINT_ENABLED_ENV: &str = "TAU_CHECKPOINT_ENABLED";
pub const CHECKPOINT_TOKEN_THRESHOLD_ENV: &str = "TAU_CHECKPOINT_TOKEN_THRESHOLD";
pub const CHECKPOINT_INTERVAL_SECONDS_ENV: &str = "TAU_CHECKPOINT_INTERVAL_SECONDS";
pub const CHECKPOINT_MAX_CHECKPOINTS_ENV: &str = "TAU_CHECKPOINT_MAX_CHECKPOINTS";
pub const CHECKPOINT_COMPRESSION_LEVEL_ENV: &str = "TAU_CHECKPOINT_COMPRESSION_LEVEL";

/// Retention used when `max_checkpoints` is zero or negative.
pub const DEFAULT_MAX_CHECKPOINTS: usize = 10;

pub type StoreResult<T> = Result<T, CheckpointStoreError>;

/// Resumable fields of a session, captured verbatim by a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub id: String,
    #[serde(default)]
    pub parent_session_id: Option<String>,
    #[serde(default)]
    pub title: String,
    pub message_count: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub summary_message_id: Option<String>,
    #[serde(default)]
    pub created_at_ms: i64,
    #[serde(default)]
    pub updated_at_ms: i64,
}

impl SessionState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Prompt plus completion tokens.
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// Persisted snapshot record. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    /// Token total as of snapshot time.
    pub token_count: u64,
    pub message_count: u64,
    /// Lowercase hex SHA-256 of `state` exactly as persisted.
    pub context_hash: String,
    pub state: Vec<u8>,
    pub compressed: bool,
    pub created_at: DateTime<Utc>,
}

/// Insert payload handed to a [`CheckpointStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCheckpoint {
    pub id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub token_count: u64,
    pub message_count: u64,
    pub context_hash: String,
    pub state: Vec<u8>,
    pub compressed: bool,
}

/// Checkpoint policy. Swappable at runtime via [`CheckpointService::set_config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointConfig {
    pub enabled: bool,
    /// Token total at which a checkpoint is due. Zero or negative never triggers.
    pub token_threshold: i64,
    /// Minimum seconds between interval-triggered checkpoints. Zero or negative disables.
    pub interval_seconds: i64,
    pub max_checkpoints: i64,
    /// Gzip level; values above 9 are clamped and zero or negative stores raw bytes.
    pub compression_level: i32,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            token_threshold: 50_000,
            interval_seconds: 300,
            max_checkpoints: DEFAULT_MAX_CHECKPOINTS as i64,
            compression_level: 6,
        }
    }
}

impl CheckpointConfig {
    pub fn from_env_map(env: &BTreeMap<String, String>) -> Result<Self, EnvConfigError> {
        let defaults = Self::default();
        Ok(Self {
            enabled: bool_from_env(env, CHECKPOINT_ENABLED_ENV, defaults.enabled)?,
            token_threshold: integer_from_env(
                env,
                CHECKPOINT_TOKEN_THRESHOLD_ENV,
                defaults.token_threshold,
            )?,
            interval_seconds: integer_from_env(
                env,
                CHECKPOINT_INTERVAL_SECONDS_ENV,
                defaults.interval_seconds,
            )?,
            max_checkpoints: integer_from_env(
                env,
                CHECKPOINT_MAX_CHECKPOINTS_ENV,
                defaults.max_checkpoints,
            )?,
            compression_level: integer_from_env(
                env,
                CHECKPOINT_COMPRESSION_LEVEL_ENV,
                defaults.compression_level,
            )?,
        })
    }

    /// Number of checkpoints `cleanup` keeps per session.
    pub fn retained_checkpoints(&self) -> usize {
        usize::try_from(self.max_checkpoints)
            .ok()
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_CHECKPOINTS)
    }
}

/// Errors returned by [`CheckpointService`] operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint '{0}' not found")]
    NotFound(String),
    #[error("session '{0}' has no checkpoints")]
    NoCheckpoints(String),
    #[error("failed to serialize session state")]
    Encode(#[source] serde_json::Error),
    #[error("failed to compress session state")]
    Compress(#[source] std::io::Error),
    #[error("failed to decompress checkpoint state")]
    Decompress(#[source] std::io::Error),
    #[error("failed to deserialize checkpoint state")]
    Decode(#[source] serde_json::Error),
    #[error("unsupported checkpoint schema version {found}; supported version is {supported}")]
    UnsupportedSchema { found: u32, supported: u32 },
    #[error("checkpoint '{checkpoint_id}' failed integrity check: expected {expected}, got {actual}")]
    IntegrityMismatch {
        checkpoint_id: String,
        expected: String,
        actual: String,
    },
    #[error("failed to {context}")]
    Store {
        context: &'static str,
        #[source]
        source: CheckpointStoreError,
    },
}

impl CheckpointError {
    /// True for both unknown ids and sessions without checkpoints.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::NoCheckpoints(_))
    }
}

/// Errors raised by persistence backends.
#[derive(Debug, Error)]
pub enum CheckpointStoreError {
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Persistence contract for checkpoint records, keyed by session.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn insert_checkpoint(&self, checkpoint: NewCheckpoint) -> StoreResult<Checkpoint>;
    async fn get_checkpoint(&self, id: &str) -> StoreResult<Option<Checkpoint>>;
    /// Checkpoints for `session_id`, newest first.
    async fn list_checkpoints(&self, session_id: &str) -> StoreResult<Vec<Checkpoint>>;
    async fn latest_checkpoint(&self, session_id: &str) -> StoreResult<Option<Checkpoint>> {
        Ok(self.list_checkpoints(session_id).await?.into_iter().next())
    }
    /// Returns whether a record was removed. Unknown ids are not an error.
    async fn delete_checkpoint(&self, id: &str) -> StoreResult<bool>;
    /// Deletes all but the `keep` newest checkpoints of a session and returns how many went.
    async fn delete_oldest_beyond(&self, session_id: &str, keep: usize) -> StoreResult<usize>;
}
