//! Checkpoint manager: persists the dispatcher's position for crash recovery.
//!
//! A checkpoint stores the last fully processed block, the headers of processed
//! blocks that are not final yet (needed to detect forks after a restart) and
//! the parameters of every dynamic datasource created so far. On restart the
//! dispatcher resumes at `block_height + 1`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::types::Header;

/// A persisted checkpoint for an indexer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Chain id (genesis hash).
    pub chain_id: String,
    /// Unique indexer identifier.
    pub indexer_id: String,
    /// Last fully processed block height.
    pub block_height: u64,
    /// Last fully processed block hash.
    pub block_hash: String,
    /// Processed headers above the finalized height.
    #[serde(default)]
    pub unfinalized: Vec<Header>,
    /// Serialized dynamic datasource parameters, in creation order.
    #[serde(default)]
    pub dynamic_datasources: Vec<serde_json::Value>,
    /// Unix timestamp of when this checkpoint was saved.
    pub updated_at: i64,
}

/// Trait for storing and loading checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the latest checkpoint for a given chain + indexer pair.
    async fn load(
        &self,
        chain_id: &str,
        indexer_id: &str,
    ) -> Result<Option<Checkpoint>, IndexerError>;

    /// Save (upsert) a checkpoint.
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError>;

    /// Delete a checkpoint (e.g. when resetting an indexer).
    async fn delete(&self, chain_id: &str, indexer_id: &str) -> Result<(), IndexerError>;
}

/// What the dispatcher hands over when a checkpoint is written.
#[derive(Debug, Clone, Default)]
pub struct CheckpointState {
    pub block_height: u64,
    pub block_hash: String,
    pub unfinalized: Vec<Header>,
    pub dynamic_datasources: Vec<serde_json::Value>,
}

/// Manages checkpoint reads/writes for an indexer.
pub struct CheckpointManager {
    store: std::sync::Arc<dyn CheckpointStore>,
    chain_id: String,
    indexer_id: String,
    /// How often to save (every N blocks).
    save_interval: u64,
    /// Block counter since last save.
    counter: u64,
}

impl CheckpointManager {
    pub fn new(
        store: std::sync::Arc<dyn CheckpointStore>,
        chain_id: impl Into<String>,
        indexer_id: impl Into<String>,
        save_interval: u64,
    ) -> Self {
        Self {
            store,
            chain_id: chain_id.into(),
            indexer_id: indexer_id.into(),
            save_interval: save_interval.max(1),
            counter: 0,
        }
    }

    /// Load the saved checkpoint (returns `None` if none exists).
    pub async fn load(&self) -> Result<Option<Checkpoint>, IndexerError> {
        self.store.load(&self.chain_id, &self.indexer_id).await
    }

    /// Conditionally save a checkpoint every `save_interval` blocks.
    ///
    /// Call this after each block is fully processed.
    pub async fn maybe_save(&mut self, state: CheckpointState) -> Result<(), IndexerError> {
        self.counter += 1;
        if self.counter >= self.save_interval {
            self.force_save(state).await?;
            self.counter = 0;
        }
        Ok(())
    }

    /// Immediately save a checkpoint (used on shutdown / rewind).
    pub async fn force_save(&self, state: CheckpointState) -> Result<(), IndexerError> {
        let cp = Checkpoint {
            chain_id: self.chain_id.clone(),
            indexer_id: self.indexer_id.clone(),
            block_height: state.block_height,
            block_hash: state.block_hash,
            unfinalized: state.unfinalized,
            dynamic_datasources: state.dynamic_datasources,
            updated_at: chrono::Utc::now().timestamp(),
        };
        tracing::debug!(height = cp.block_height, "Saving checkpoint");
        self.store.save(cp).await
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory checkpoint store for tests and ephemeral indexers.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    data: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(chain_id: &str, indexer_id: &str) -> String {
        format!("{chain_id}:{indexer_id}")
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Checkpoint>>, IndexerError> {
        self.data
            .lock()
            .map_err(|_| IndexerError::Storage("checkpoint store lock poisoned".into()))
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(
        &self,
        chain_id: &str,
        indexer_id: &str,
    ) -> Result<Option<Checkpoint>, IndexerError> {
        Ok(self.lock()?.get(&Self::key(chain_id, indexer_id)).cloned())
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        let key = Self::key(&checkpoint.chain_id, &checkpoint.indexer_id);
        self.lock()?.insert(key, checkpoint);
        Ok(())
    }

    async fn delete(&self, chain_id: &str, indexer_id: &str) -> Result<(), IndexerError> {
        self.lock()?.remove(&Self::key(chain_id, indexer_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn state(height: u64, hash: &str) -> CheckpointState {
        CheckpointState {
            block_height: height,
            block_hash: hash.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let mgr = CheckpointManager::new(store, "genesis", "my-indexer", 10);

        assert!(mgr.load().await.unwrap().is_none());

        let mut s = state(1000, "abc");
        s.unfinalized = vec![Header::new(1000, "abc", "abb")];
        mgr.force_save(s).await.unwrap();

        let cp = mgr.load().await.unwrap().unwrap();
        assert_eq!(cp.block_height, 1000);
        assert_eq!(cp.block_hash, "abc");
        assert_eq!(cp.chain_id, "genesis");
        assert_eq!(cp.unfinalized.len(), 1);
    }

    #[tokio::test]
    async fn checkpoint_save_interval() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut mgr = CheckpointManager::new(store, "genesis", "idx", 5);

        for i in 1..=4 {
            mgr.maybe_save(state(i, "hash")).await.unwrap();
        }
        assert!(mgr.load().await.unwrap().is_none());

        mgr.maybe_save(state(5, "hash5")).await.unwrap();
        let cp = mgr.load().await.unwrap().unwrap();
        assert_eq!(cp.block_height, 5);
    }
}
