//! In-memory conditional store.
//!
//! Task rows live in a skiplist keyed by task id so range reads don't contend
//! with the metadata lock; all range_id fencing happens under the per-queue
//! metadata mutex.

use std::collections::HashMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use crossbeam_skiplist::SkipMap;

use crate::queue_id::QueueId;
use crate::store::{QueueMetadata, QueueStore, StoreError};
use crate::task::{now_epoch_ms, TaskRecord};

#[derive(Default)]
pub struct MemoryQueueStore {
    queues: Mutex<HashMap<QueueId, Arc<QueueState>>>,
}

struct QueueState {
    meta: Mutex<MetaState>,
    tasks: SkipMap<i64, TaskRecord>,
}

struct MetaState {
    range_id: i64,
    ack_level: i64,
    last_updated_ms: i64,
}

impl MemoryQueueStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn queue(&self, queue: &QueueId) -> Result<Arc<QueueState>, StoreError> {
        self.queues
            .lock()
            .unwrap()
            .get(queue)
            .cloned()
            .ok_or(StoreError::QueueNotFound)
    }

    /// Number of task rows currently stored for a queue. Test visibility.
    pub fn task_count(&self, queue: &QueueId) -> usize {
        self.queue(queue).map(|q| q.tasks.len()).unwrap_or(0)
    }
}

impl MetaState {
    fn check(&self, presented: i64) -> Result<(), StoreError> {
        if self.range_id != presented {
            return Err(StoreError::PreconditionFailed {
                presented,
                stored: self.range_id,
            });
        }
        Ok(())
    }

    fn snapshot(&self) -> QueueMetadata {
        QueueMetadata {
            range_id: self.range_id,
            ack_level: self.ack_level,
            last_updated_ms: self.last_updated_ms,
        }
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn lease_queue(
        &self,
        queue: &QueueId,
        expected_range_id: Option<i64>,
    ) -> Result<QueueMetadata, StoreError> {
        let state = {
            let mut queues = self.queues.lock().unwrap();
            queues
                .entry(queue.clone())
                .or_insert_with(|| {
                    Arc::new(QueueState {
                        meta: Mutex::new(MetaState {
                            range_id: 0,
                            ack_level: 0,
                            last_updated_ms: now_epoch_ms(),
                        }),
                        tasks: SkipMap::new(),
                    })
                })
                .clone()
        };

        let mut meta = state.meta.lock().unwrap();
        if let Some(expected) = expected_range_id {
            meta.check(expected)?;
        }
        meta.range_id += 1;
        meta.last_updated_ms = now_epoch_ms();
        Ok(meta.snapshot())
    }

    async fn update_queue(
        &self,
        queue: &QueueId,
        metadata: &QueueMetadata,
        expected_range_id: i64,
    ) -> Result<(), StoreError> {
        let state = self.queue(queue)?;
        let mut meta = state.meta.lock().unwrap();
        meta.check(expected_range_id)?;
        meta.range_id = metadata.range_id;
        meta.ack_level = metadata.ack_level;
        meta.last_updated_ms = now_epoch_ms();
        Ok(())
    }

    async fn create_task(
        &self,
        queue: &QueueId,
        task: &TaskRecord,
        range_id: i64,
    ) -> Result<(), StoreError> {
        let state = self.queue(queue)?;
        // Insert while holding the metadata lock so a concurrent lease bump
        // cannot interleave between the fence check and the write.
        let meta = state.meta.lock().unwrap();
        meta.check(range_id)?;
        state.tasks.insert(task.task_id, task.clone());
        Ok(())
    }

    async fn get_tasks(
        &self,
        queue: &QueueId,
        min_id_exclusive: i64,
        max_count: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.queue(queue)?;
        let out: Vec<TaskRecord> = state
            .tasks
            .range((Bound::Excluded(min_id_exclusive), Bound::Unbounded))
            .take(max_count)
            .map(|entry| entry.value().clone())
            .collect();
        Ok(out)
    }

    async fn complete_task(&self, queue: &QueueId, task_id: i64) -> Result<(), StoreError> {
        let state = self.queue(queue)?;
        state.tasks.remove(&task_id);
        Ok(())
    }

    async fn complete_tasks_less_than(
        &self,
        queue: &QueueId,
        upper_id_exclusive: i64,
        limit: usize,
    ) -> Result<usize, StoreError> {
        let state = self.queue(queue)?;
        let victims: Vec<i64> = state
            .tasks
            .range((Bound::Unbounded, Bound::Excluded(upper_id_exclusive)))
            .take(limit)
            .map(|entry| *entry.key())
            .collect();
        let mut deleted = 0;
        for id in victims {
            if state.tasks.remove(&id).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn delete_queue(&self, queue: &QueueId, range_id: i64) -> Result<(), StoreError> {
        let state = self.queue(queue)?;
        {
            let meta = state.meta.lock().unwrap();
            meta.check(range_id)?;
        }
        self.queues.lock().unwrap().remove(queue);
        Ok(())
    }
}
