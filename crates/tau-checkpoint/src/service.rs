use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::{
    codec::{decode_state, encode_state, sha256_hex, EncodedState},
    Checkpoint, CheckpointConfig, CheckpointError, CheckpointStore, CheckpointStoreError,
    NewCheckpoint, SessionState,
};

/// Creates, lists, restores and retires session checkpoints.
///
/// Holds no cached checkpoint data; every read goes to the store.
pub struct CheckpointService {
    store: Arc<dyn CheckpointStore>,
    config: RwLock<CheckpointConfig>,
}

impl CheckpointService {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self::with_config(store, CheckpointConfig::default())
    }

    pub fn with_config(store: Arc<dyn CheckpointStore>, config: CheckpointConfig) -> Self {
        Self {
            store,
            config: RwLock::new(config),
        }
    }

    /// Replaces the active policy for all subsequent calls.
    pub fn set_config(&self, config: CheckpointConfig) {
        *write_or_recover(&self.config) = config;
    }

    pub fn config(&self) -> CheckpointConfig {
        *read_or_recover(&self.config)
    }

    /// See [`should_checkpoint`].
    pub fn should_checkpoint(&self, session: &SessionState, config: &CheckpointConfig) -> bool {
        should_checkpoint(session, config)
    }

    /// Snapshots `session` and persists the record.
    #[tracing::instrument(
        name = "checkpoint.create",
        skip(self, session),
        fields(session_id = %session.id)
    )]
    pub async fn create(&self, session: &SessionState) -> Result<Checkpoint, CheckpointError> {
        let encoded = encode_state(session, self.config().compression_level)?;
        self.persist(session, encoded).await
    }

    pub async fn get_latest(&self, session_id: &str) -> Result<Checkpoint, CheckpointError> {
        self.store
            .latest_checkpoint(session_id)
            .await
            .map_err(store_error("load latest checkpoint"))?
            .ok_or_else(|| CheckpointError::NoCheckpoints(session_id.to_string()))
    }

    pub async fn get(&self, id: &str) -> Result<Checkpoint, CheckpointError> {
        self.store
            .get_checkpoint(id)
            .await
            .map_err(store_error("load checkpoint"))?
            .ok_or_else(|| CheckpointError::NotFound(id.to_string()))
    }

    /// Checkpoints for the session, newest first.
    pub async fn list(&self, session_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        self.store
            .list_checkpoints(session_id)
            .await
            .map_err(store_error("list checkpoints"))
    }

    /// Decodes a checkpoint into a fresh session value. Never touches a live session.
    #[tracing::instrument(name = "checkpoint.restore", skip(self))]
    pub async fn restore(&self, checkpoint_id: &str) -> Result<SessionState, CheckpointError> {
        let checkpoint = self.get(checkpoint_id).await?;
        Self::verify(&checkpoint)?;
        let session = decode_state(&checkpoint.state, checkpoint.compressed)?;
        tracing::debug!(
            session_id = %session.id,
            state_bytes = checkpoint.state.len(),
            compressed = checkpoint.compressed,
            "restored checkpoint"
        );
        Ok(session)
    }

    /// Removes one checkpoint. Unknown ids succeed.
    pub async fn delete(&self, id: &str) -> Result<(), CheckpointError> {
        let removed = self
            .store
            .delete_checkpoint(id)
            .await
            .map_err(store_error("delete checkpoint"))?;
        if !removed {
            tracing::debug!(checkpoint_id = id, "delete of unknown checkpoint ignored");
        }
        Ok(())
    }

    /// Keeps the newest `max_checkpoints` for the session and returns how many were removed.
    #[tracing::instrument(name = "checkpoint.cleanup", skip(self))]
    pub async fn cleanup(&self, session_id: &str) -> Result<usize, CheckpointError> {
        let keep = self.config().retained_checkpoints();
        let removed = self
            .store
            .delete_oldest_beyond(session_id, keep)
            .await
            .map_err(store_error("clean up checkpoints"))?;
        if removed > 0 {
            tracing::debug!(removed, keep, "retired old checkpoints");
        }
        Ok(removed)
    }

    /// Recomputes the content hash of the persisted bytes.
    pub fn verify(checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let actual = sha256_hex(&checkpoint.state);
        if actual != checkpoint.context_hash {
            return Err(CheckpointError::IntegrityMismatch {
                checkpoint_id: checkpoint.id.clone(),
                expected: checkpoint.context_hash.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Creates a checkpoint when the token or interval trigger fires, then runs cleanup.
    ///
    /// Returns `None` when nothing is due or the snapshot is identical to the
    /// latest checkpoint.
    #[tracing::instrument(
        name = "checkpoint.checkpoint_if_due",
        skip(self, session),
        fields(session_id = %session.id)
    )]
    pub async fn checkpoint_if_due(
        &self,
        session: &SessionState,
        now: DateTime<Utc>,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        let config = self.config();
        if !config.enabled {
            return Ok(None);
        }
        let latest = self
            .store
            .latest_checkpoint(&session.id)
            .await
            .map_err(store_error("load latest checkpoint"))?;
        let since = latest
            .as_ref()
            .map(|checkpoint| checkpoint.timestamp)
            .or_else(|| session_started_at(session));

        let token_due = should_checkpoint(session, &config);
        let interval_due = since.is_some_and(|since| interval_elapsed(&config, since, now));
        if !token_due && !interval_due {
            return Ok(None);
        }

        let encoded = encode_state(session, config.compression_level)?;
        if latest
            .as_ref()
            .is_some_and(|checkpoint| checkpoint.context_hash == encoded.context_hash)
        {
            tracing::debug!("session unchanged since latest checkpoint; skipping");
            return Ok(None);
        }

        let checkpoint = self.persist(session, encoded).await?;
        self.cleanup(&session.id).await?;
        Ok(Some(checkpoint))
    }

    async fn persist(
        &self,
        session: &SessionState,
        encoded: EncodedState,
    ) -> Result<Checkpoint, CheckpointError> {
        let state_bytes = encoded.bytes.len();
        let checkpoint = self
            .store
            .insert_checkpoint(NewCheckpoint {
                id: Uuid::new_v4().to_string(),
                session_id: session.id.clone(),
                timestamp: Utc::now(),
                token_count: session.total_tokens(),
                message_count: session.message_count,
                context_hash: encoded.context_hash,
                state: encoded.bytes,
                compressed: encoded.compressed,
            })
            .await
            .map_err(store_error("create checkpoint"))?;
        tracing::debug!(
            checkpoint_id = %checkpoint.id,
            token_count = checkpoint.token_count,
            state_bytes,
            compressed = checkpoint.compressed,
            "created checkpoint"
        );
        Ok(checkpoint)
    }
}

/// Pure token-threshold trigger, safe to call on every tool-loop iteration.
///
/// False when disabled or when the threshold is zero or negative.
pub fn should_checkpoint(session: &SessionState, config: &CheckpointConfig) -> bool {
    if !config.enabled {
        return false;
    }
    match u64::try_from(config.token_threshold) {
        Ok(threshold) if threshold > 0 => session.total_tokens() >= threshold,
        _ => false,
    }
}

/// True once `interval_seconds` have passed since `since`. Disabled for non-positive intervals.
pub fn interval_elapsed(config: &CheckpointConfig, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    if config.interval_seconds <= 0 {
        return false;
    }
    (now - since).num_seconds() >= config.interval_seconds
}

fn session_started_at(session: &SessionState) -> Option<DateTime<Utc>> {
    if session.created_at_ms <= 0 {
        return None;
    }
    Utc.timestamp_millis_opt(session.created_at_ms).single()
}

fn store_error(context: &'static str) -> impl FnOnce(CheckpointStoreError) -> CheckpointError {
    move |source| CheckpointError::Store { context, source }
}

fn read_or_recover<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_or_recover<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
