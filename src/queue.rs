//! A single FIFO queue shard.
//!
//! Entries are serialized [`RequestSet`]s appended at the tail of a backend
//! list and consumed from the head in batches: [`Queue::peek_batch`] reads
//! without removing, [`Queue::mark_processed`] trims the same number of
//! entries once the batch is done. Both use the queue's configured batch size,
//! so a peek followed by a trim always removes exactly what was read.

use std::sync::Arc;

use crate::backend::Backend;
use crate::error::QueueError;
use crate::request_set::{DecodeError, RequestSet};

/// List key of the base shard; other shards append `_<id>`.
pub const QUEUE_LIST_KEY: &str = "trackingQueueV1";

/// Returns the list key for a shard id. Shard 0 uses the base key.
pub fn list_key(shard_id: u32) -> String {
    if shard_id == 0 {
        QUEUE_LIST_KEY.to_string()
    } else {
        format!("{}_{}", QUEUE_LIST_KEY, shard_id)
    }
}

/// One queue shard.
#[derive(Clone)]
pub struct Queue {
    backend: Arc<dyn Backend>,
    id: u32,
    key: String,
    batch_size: usize,
}

impl Queue {
    /// Creates a handle for shard `id`. Nothing is written until the first append.
    pub fn new(backend: Arc<dyn Backend>, id: u32, batch_size: usize) -> Self {
        Self {
            backend,
            id,
            key: list_key(id),
            batch_size: batch_size.max(1),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Appends a request set. Sets without requests are ignored.
    pub async fn append(&self, request_set: &RequestSet) -> Result<(), QueueError> {
        if request_set.is_empty() {
            return Ok(());
        }

        let entry = request_set.to_json().map_err(QueueError::Serialization)?;
        self.backend.append_to_list(&self.key, &[entry]).await?;
        Ok(())
    }

    /// Returns true once at least one full batch is queued.
    pub async fn should_process(&self) -> Result<bool, QueueError> {
        Ok(self
            .backend
            .has_at_least_n(&self.key, self.batch_size)
            .await?)
    }

    /// Reads up to one batch from the head without removing it.
    ///
    /// # Errors
    ///
    /// A corrupt entry fails the whole peek; it is never skipped.
    pub async fn peek_batch(&self) -> Result<Vec<RequestSet>, QueueError> {
        self.peek(self.batch_size).await
    }

    /// Reads up to `limit` entries from the head without removing them.
    pub async fn peek(&self, limit: usize) -> Result<Vec<RequestSet>, QueueError> {
        let entries = self.backend.peek_first_n(&self.key, limit).await?;
        entries
            .iter()
            .map(|entry| self.decode(entry))
            .collect()
    }

    /// Removes one batch from the head.
    ///
    /// Must follow a [`Queue::peek_batch`] on the same queue so that exactly
    /// the entries that were read are removed.
    pub async fn mark_processed(&self) -> Result<(), QueueError> {
        self.backend
            .trim_first_n(&self.key, self.batch_size)
            .await?;
        Ok(())
    }

    /// Returns the number of queued request sets.
    pub async fn count(&self) -> Result<usize, QueueError> {
        Ok(self.backend.count(&self.key).await?)
    }

    /// Deletes the shard's storage.
    pub async fn delete(&self) -> Result<bool, QueueError> {
        Ok(self.backend.delete_key(&self.key).await?)
    }

    fn decode(&self, entry: &str) -> Result<RequestSet, QueueError> {
        RequestSet::from_json(entry).map_err(|e| match e {
            DecodeError::Json(source) => QueueError::Deserialization {
                key: self.key.clone(),
                source,
            },
            invalid @ DecodeError::InvalidValue { .. } => QueueError::InvalidEntry {
                key: self.key.clone(),
                reason: invalid.to_string(),
            },
        })
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}
