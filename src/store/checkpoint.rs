use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

use crate::domain::{Checkpoint, Metadata};
use crate::error::StoreError;

/// Durable storage of thread checkpoints.
///
/// Failures are reported as [`StoreError::Unavailable`] and treated as
/// transient by the worker.
#[async_trait]
pub trait CheckpointStore: Send + Sync + std::fmt::Debug {
    /// Fetch a checkpoint by id, or the latest root checkpoint when `checkpoint_id` is `None`.
    async fn get(
        &self,
        thread_id: Uuid,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<Checkpoint>, StoreError>;

    /// Insert or replace a checkpoint. `metadata` is merged into the stored copy.
    async fn put(
        &self,
        thread_id: Uuid,
        checkpoint: &Checkpoint,
        metadata: &Metadata,
    ) -> Result<(), StoreError>;

    /// All checkpoints of a thread, oldest first.
    async fn list(&self, thread_id: Uuid) -> Result<Vec<Checkpoint>, StoreError>;

    /// Remove every checkpoint written by `run_id`. Returns how many were removed.
    async fn delete_for_run(&self, thread_id: Uuid, run_id: Uuid) -> Result<usize, StoreError>;

    async fn delete_thread(&self, thread_id: Uuid) -> Result<(), StoreError>;
}

/// Merges write-time metadata into a checkpoint before it is stored.
pub(crate) fn stamped(checkpoint: &Checkpoint, metadata: &Metadata) -> Checkpoint {
    let mut stored = checkpoint.clone();
    for (key, value) in metadata {
        stored.metadata.insert(key.clone(), value.clone());
    }
    stored
}

/// In-process checkpoint store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    threads: RwLock<HashMap<Uuid, Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(
        &self,
        thread_id: Uuid,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let threads = self.threads.read().unwrap_or_else(PoisonError::into_inner);
        let Some(checkpoints) = threads.get(&thread_id) else {
            return Ok(None);
        };
        let found = match checkpoint_id {
            Some(id) => checkpoints.iter().find(|cp| cp.checkpoint_id == id),
            None => checkpoints
                .iter()
                .rev()
                .find(|cp| cp.checkpoint_ns.is_empty()),
        };
        Ok(found.cloned())
    }

    async fn put(
        &self,
        thread_id: Uuid,
        checkpoint: &Checkpoint,
        metadata: &Metadata,
    ) -> Result<(), StoreError> {
        let stored = stamped(checkpoint, metadata);
        let mut threads = self.threads.write().unwrap_or_else(PoisonError::into_inner);
        let checkpoints = threads.entry(thread_id).or_default();
        match checkpoints.iter_mut().find(|cp| {
            cp.checkpoint_id == stored.checkpoint_id && cp.checkpoint_ns == stored.checkpoint_ns
        }) {
            Some(existing) => *existing = stored,
            None => checkpoints.push(stored),
        }
        Ok(())
    }

    async fn list(&self, thread_id: Uuid) -> Result<Vec<Checkpoint>, StoreError> {
        Ok(self
            .threads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&thread_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_for_run(&self, thread_id: Uuid, run_id: Uuid) -> Result<usize, StoreError> {
        let run_id = run_id.to_string();
        let mut threads = self.threads.write().unwrap_or_else(PoisonError::into_inner);
        let Some(checkpoints) = threads.get_mut(&thread_id) else {
            return Ok(0);
        };
        let before = checkpoints.len();
        checkpoints.retain(|cp| cp.run_id() != Some(run_id.as_str()));
        Ok(before - checkpoints.len())
    }

    async fn delete_thread(&self, thread_id: Uuid) -> Result<(), StoreError> {
        self.threads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&thread_id);
        Ok(())
    }
}
