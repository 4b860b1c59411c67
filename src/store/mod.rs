//! Persistence adapter for queue-lease records and durable task rows.
//!
//! The durable store is an external collaborator; the engine only requires
//! the conditional operations below. `memory` provides the in-process
//! reference backend used by tests and single-node runs.

mod memory;

pub use memory::MemoryQueueStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::queue_id::QueueId;
use crate::task::TaskRecord;

/// Durable per-queue metadata. One record per queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMetadata {
    /// Lease generation. A writer presenting a stale value on any conditional
    /// operation must fail.
    pub range_id: i64,
    /// Highest task id known completed; rows at or below it may be trimmed.
    pub ack_level: i64,
    pub last_updated_ms: i64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The observed `range_id` no longer matches the stored one; another
    /// writer has taken over the queue.
    #[error("conditional write failed: presented range_id {presented}, stored {stored}")]
    PreconditionFailed { presented: i64, stored: i64 },

    #[error("queue not found")]
    QueueNotFound,

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Conditional CRUD consumed by the matching engine.
///
/// All mutations are fenced by `range_id`: the store compares the presented
/// value against the stored record and fails with `PreconditionFailed`
/// without mutating anything on mismatch.
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    /// Acquire or renew write authority over a queue by bumping `range_id`.
    ///
    /// Creates the record with `range_id = 1` when absent. When
    /// `expected_range_id` is given, the bump is conditional on the stored
    /// value still matching it; a mismatch means another writer won.
    async fn lease_queue(
        &self,
        queue: &QueueId,
        expected_range_id: Option<i64>,
    ) -> Result<QueueMetadata, StoreError>;

    /// Conditionally rewrite the metadata record (ack level persistence).
    async fn update_queue(
        &self,
        queue: &QueueId,
        metadata: &QueueMetadata,
        expected_range_id: i64,
    ) -> Result<(), StoreError>;

    /// Append one task row, fenced by the writer's `range_id`.
    async fn create_task(
        &self,
        queue: &QueueId,
        task: &TaskRecord,
        range_id: i64,
    ) -> Result<(), StoreError>;

    /// Read up to `max_count` rows with `task_id > min_id_exclusive`, in
    /// ascending id order.
    async fn get_tasks(
        &self,
        queue: &QueueId,
        min_id_exclusive: i64,
        max_count: usize,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    /// Delete a single task row. Completing an already-completed id is a
    /// no-op.
    async fn complete_task(&self, queue: &QueueId, task_id: i64) -> Result<(), StoreError>;

    /// Delete rows with `task_id < upper_id_exclusive` in ascending order,
    /// at most `limit` of them. Returns the number deleted.
    async fn complete_tasks_less_than(
        &self,
        queue: &QueueId,
        upper_id_exclusive: i64,
        limit: usize,
    ) -> Result<usize, StoreError>;

    /// Remove the queue record and all of its tasks, fenced by `range_id`.
    async fn delete_queue(&self, queue: &QueueId, range_id: i64) -> Result<(), StoreError>;
}
