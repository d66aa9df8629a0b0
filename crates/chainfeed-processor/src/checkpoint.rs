//! Checkpoint manager: persists the latest processed block so a restarted
//! ingestion task resumes without reprocessing or skipping blocks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use chainfeed_core::{BlockHeight, FeedError};

/// A persisted checkpoint for one processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub chain_id: u64,
    /// Unique processor identifier.
    pub processor_id: String,
    /// Latest block whose logs were fully delivered.
    pub block_number: BlockHeight,
    /// Unix timestamp of when this checkpoint was saved.
    pub updated_at: i64,
}

/// Trait for storing and loading checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for a given chain + processor pair.
    async fn load(&self, chain_id: u64, processor_id: &str) -> Result<Option<Checkpoint>, FeedError>;

    /// Save (upsert) a checkpoint.
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), FeedError>;

    /// Delete a checkpoint (e.g. when resetting a processor).
    async fn delete(&self, chain_id: u64, processor_id: &str) -> Result<(), FeedError>;
}

/// Manages checkpoint reads/writes for a processor.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    chain_id: u64,
    processor_id: String,
    /// Save every N advances.
    save_interval: u64,
    counter: u64,
}

impl CheckpointManager {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        chain_id: u64,
        processor_id: impl Into<String>,
        save_interval: u64,
    ) -> Self {
        Self {
            store,
            chain_id,
            processor_id: processor_id.into(),
            save_interval: save_interval.max(1),
            counter: 0,
        }
    }

    /// Load the saved checkpoint (returns `None` if none exists).
    pub async fn load(&self) -> Result<Option<Checkpoint>, FeedError> {
        self.store.load(self.chain_id, &self.processor_id).await
    }

    /// Save every `save_interval` calls. Call this each time the processed height advances.
    pub async fn maybe_save(&mut self, block: BlockHeight) -> Result<(), FeedError> {
        self.counter += 1;
        if self.counter >= self.save_interval {
            self.force_save(block).await?;
            self.counter = 0;
        }
        Ok(())
    }

    /// Immediately save a checkpoint (used on shutdown).
    pub async fn force_save(&self, block: BlockHeight) -> Result<(), FeedError> {
        let cp = Checkpoint {
            chain_id: self.chain_id,
            processor_id: self.processor_id.clone(),
            block_number: block,
            updated_at: chrono::Utc::now().timestamp(),
        };
        self.store.save(cp).await
    }
}

// ─── In-memory store ──────────────────────────────────────────────────────────

/// In-memory checkpoint store. Survives task restarts, not process restarts.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    data: Mutex<HashMap<(u64, String), Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, chain_id: u64, processor_id: &str) -> Result<Option<Checkpoint>, FeedError> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(data.get(&(chain_id, processor_id.to_string())).cloned())
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), FeedError> {
        let key = (checkpoint.chain_id, checkpoint.processor_id.clone());
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, checkpoint);
        Ok(())
    }

    async fn delete(&self, chain_id: u64, processor_id: &str) -> Result<(), FeedError> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(chain_id, processor_id.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let mgr = CheckpointManager::new(store.clone(), 1, "feed", 10);

        assert!(mgr.load().await.unwrap().is_none());

        mgr.force_save(BlockHeight::new(1_000)).await.unwrap();
        let cp = mgr.load().await.unwrap().unwrap();
        assert_eq!(cp.block_number, BlockHeight::new(1_000));
        assert_eq!(cp.chain_id, 1);

        store.delete(1, "feed").await.unwrap();
        assert!(mgr.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn checkpoint_save_interval() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut mgr = CheckpointManager::new(store, 137, "feed", 5);

        for i in 1..=4 {
            mgr.maybe_save(BlockHeight::new(i)).await.unwrap();
        }
        assert!(mgr.load().await.unwrap().is_none());

        mgr.maybe_save(BlockHeight::new(5)).await.unwrap();
        let cp = mgr.load().await.unwrap().unwrap();
        assert_eq!(cp.block_number, BlockHeight::new(5));
    }

    #[tokio::test]
    async fn chains_do_not_share_checkpoints() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let mainnet = CheckpointManager::new(Arc::clone(&store), 1, "feed", 1);
        let polygon = CheckpointManager::new(store, 137, "feed", 1);
        mainnet.force_save(BlockHeight::new(42)).await.unwrap();
        assert!(polygon.load().await.unwrap().is_none());
    }
}
