//! In-memory storage backend.
//!
//! Stages entity writes per block height, commits them on flush and discards
//! them on rewind. Also keeps checkpoints in RAM. All data is lost when the
//! process exits.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use ccdindex_core::checkpoint::{Checkpoint, CheckpointStore};
use ccdindex_core::error::IndexerError;
use ccdindex_core::store::StoreCache;

#[derive(Default)]
struct Entities {
    staged: BTreeMap<u64, Vec<Value>>,
    committed: BTreeMap<u64, Vec<Value>>,
    last_flushed: Option<u64>,
    flushes: Vec<u64>,
    rewinds: Vec<u64>,
}

/// In-memory store cache and checkpoint store.
#[derive(Default)]
pub struct InMemoryStore {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
    entities: Mutex<Entities>,
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, IndexerError> {
    m.lock()
        .map_err(|_| IndexerError::Storage("in-memory store lock poisoned".into()))
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage an entity written by a handler while processing `height`.
    pub fn stage(&self, height: u64, entity: Value) -> Result<(), IndexerError> {
        lock(&self.entities)?
            .staged
            .entry(height)
            .or_default()
            .push(entity);
        Ok(())
    }

    /// Committed entities in height order.
    pub fn committed(&self) -> Vec<(u64, Value)> {
        self.entities
            .lock()
            .map(|e| {
                e.committed
                    .iter()
                    .flat_map(|(h, values)| values.iter().map(move |v| (*h, v.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every `flush` height seen, in call order.
    pub fn flushed_heights(&self) -> Vec<u64> {
        self.entities
            .lock()
            .map(|e| e.flushes.clone())
            .unwrap_or_default()
    }

    /// Every `rewind` target seen, in call order.
    pub fn rewinds(&self) -> Vec<u64> {
        self.entities
            .lock()
            .map(|e| e.rewinds.clone())
            .unwrap_or_default()
    }

    /// Highest committed height, if any flush has happened since the last rewind below it.
    pub fn last_flushed(&self) -> Option<u64> {
        self.entities.lock().ok().and_then(|e| e.last_flushed)
    }

    fn key(chain_id: &str, indexer_id: &str) -> String {
        format!("{chain_id}:{indexer_id}")
    }
}

#[async_trait]
impl StoreCache for InMemoryStore {
    async fn flush(&self, up_to: u64) -> Result<(), IndexerError> {
        let mut e = lock(&self.entities)?;
        if let Some(last) = e.last_flushed {
            if up_to <= last {
                return Err(IndexerError::Storage(format!(
                    "flush at {up_to} is not above last flushed height {last}"
                )));
            }
        }
        let pending = e.staged.split_off(&(up_to + 1));
        let ready = std::mem::replace(&mut e.staged, pending);
        let entities: usize = ready.values().map(Vec::len).sum();
        for (height, values) in ready {
            e.committed.entry(height).or_default().extend(values);
        }
        e.last_flushed = Some(up_to);
        e.flushes.push(up_to);
        tracing::trace!(height = up_to, entities, "Flushed store cache");
        Ok(())
    }

    async fn rewind(&self, to: u64) -> Result<(), IndexerError> {
        let mut e = lock(&self.entities)?;
        e.staged.retain(|h, _| *h <= to);
        e.committed.retain(|h, _| *h <= to);
        e.last_flushed = e.last_flushed.map(|last| last.min(to));
        e.rewinds.push(to);
        tracing::debug!(height = to, "Rewound store cache");
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStore {
    async fn load(
        &self,
        chain_id: &str,
        indexer_id: &str,
    ) -> Result<Option<Checkpoint>, IndexerError> {
        Ok(lock(&self.checkpoints)?
            .get(&Self::key(chain_id, indexer_id))
            .cloned())
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        let key = Self::key(&checkpoint.chain_id, &checkpoint.indexer_id);
        lock(&self.checkpoints)?.insert(key, checkpoint);
        Ok(())
    }

    async fn delete(&self, chain_id: &str, indexer_id: &str) -> Result<(), IndexerError> {
        lock(&self.checkpoints)?.remove(&Self::key(chain_id, indexer_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn flush_commits_staged_heights() {
        let store = InMemoryStore::new();
        store.stage(1, json!({"id": "a"})).unwrap();
        store.stage(2, json!({"id": "b"})).unwrap();
        store.stage(3, json!({"id": "c"})).unwrap();

        store.flush(2).await.unwrap();
        let heights: Vec<u64> = store.committed().into_iter().map(|(h, _)| h).collect();
        assert_eq!(heights, vec![1, 2]);
        assert_eq!(store.last_flushed(), Some(2));

        store.flush(3).await.unwrap();
        assert_eq!(store.committed().len(), 3);
        assert_eq!(store.flushed_heights(), vec![2, 3]);
    }

    #[tokio::test]
    async fn out_of_order_flush_is_rejected() {
        let store = InMemoryStore::new();
        store.flush(5).await.unwrap();
        let err = store.flush(4).await.unwrap_err();
        assert!(matches!(err, IndexerError::Storage(_)));
        assert!(store.flush(5).await.is_err());
    }

    #[tokio::test]
    async fn rewind_drops_writes_above_target() {
        let store = InMemoryStore::new();
        for h in 10..=12 {
            store.stage(h, json!({"height": h})).unwrap();
        }
        store.flush(12).await.unwrap();
        store.stage(13, json!({"height": 13})).unwrap();

        store.rewind(10).await.unwrap();
        let heights: Vec<u64> = store.committed().into_iter().map(|(h, _)| h).collect();
        assert_eq!(heights, vec![10]);
        assert_eq!(store.last_flushed(), Some(10));
        assert_eq!(store.rewinds(), vec![10]);

        // Heights above the rewind target can be committed again.
        store.stage(11, json!({"height": 11, "fork": true})).unwrap();
        store.flush(11).await.unwrap();
        assert_eq!(store.committed().last().unwrap().1["fork"], true);
    }

    #[tokio::test]
    async fn checkpoint_roundtrip() {
        let store = InMemoryStore::new();
        let cp = Checkpoint {
            chain_id: "testnet".into(),
            indexer_id: "pools".into(),
            block_height: 1000,
            block_hash: "abc".into(),
            ..Default::default()
        };
        store.save(cp).await.unwrap();
        let loaded = store.load("testnet", "pools").await.unwrap().unwrap();
        assert_eq!(loaded.block_height, 1000);

        store.delete("testnet", "pools").await.unwrap();
        assert!(store.load("testnet", "pools").await.unwrap().is_none());
    }
}
