use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{Checkpoint, CheckpointStore, NewCheckpoint, StoreResult};

/// In-memory implementation for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    // Insertion order doubles as creation order.
    checkpoints: RwLock<Vec<Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the persisted bytes of a record, simulating on-disk corruption.
    #[cfg(test)]
    pub(crate) async fn overwrite_state(&self, id: &str, state: Vec<u8>) -> bool {
        let mut checkpoints = self.checkpoints.write().await;
        match checkpoints.iter_mut().find(|checkpoint| checkpoint.id == id) {
            Some(checkpoint) => {
                checkpoint.state = state;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn insert_checkpoint(&self, checkpoint: NewCheckpoint) -> StoreResult<Checkpoint> {
        let record = Checkpoint {
            id: checkpoint.id,
            session_id: checkpoint.session_id,
            timestamp: checkpoint.timestamp,
            token_count: checkpoint.token_count,
            message_count: checkpoint.message_count,
            context_hash: checkpoint.context_hash,
            state: checkpoint.state,
            compressed: checkpoint.compressed,
            created_at: Utc::now(),
        };
        self.checkpoints.write().await.push(record.clone());
        Ok(record)
    }

    async fn get_checkpoint(&self, id: &str) -> StoreResult<Option<Checkpoint>> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints
            .iter()
            .find(|checkpoint| checkpoint.id == id)
            .cloned())
    }

    async fn list_checkpoints(&self, session_id: &str) -> StoreResult<Vec<Checkpoint>> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints
            .iter()
            .rev()
            .filter(|checkpoint| checkpoint.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn latest_checkpoint(&self, session_id: &str) -> StoreResult<Option<Checkpoint>> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints
            .iter()
            .rev()
            .find(|checkpoint| checkpoint.session_id == session_id)
            .cloned())
    }

    async fn delete_checkpoint(&self, id: &str) -> StoreResult<bool> {
        let mut checkpoints = self.checkpoints.write().await;
        let before = checkpoints.len();
        checkpoints.retain(|checkpoint| checkpoint.id != id);
        Ok(checkpoints.len() != before)
    }

    async fn delete_oldest_beyond(&self, session_id: &str, keep: usize) -> StoreResult<usize> {
        let mut checkpoints = self.checkpoints.write().await;
        let total = checkpoints
            .iter()
            .filter(|checkpoint| checkpoint.session_id == session_id)
            .count();
        let mut excess = total.saturating_sub(keep);
        let removed = excess;
        checkpoints.retain(|checkpoint| {
            if excess > 0 && checkpoint.session_id == session_id {
                excess -= 1;
                return false;
            }
            true
        });
        Ok(removed)
    }
}
