//! Range-leased task-id allocation.
//!
//! A manager holding `range_id = R` may mint ids in `[R*B + 1, (R+1)*B]`
//! where B is the configured block size. Renewal bumps the range via a
//! conditional store write; losing that race is terminal for the owner.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::MatchingError;
use crate::queue_id::QueueId;
use crate::store::{QueueStore, StoreError};

/// A freshly minted task id together with the range it was minted under.
/// The pair is taken under one lock so a persist can present the exact
/// range the id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedId {
    pub task_id: i64,
    pub range_id: i64,
}

struct AllocState {
    range_id: i64,
    next_id: i64,
    max_id: i64,
}

pub struct IdBlockAllocator {
    store: Arc<dyn QueueStore>,
    queue: QueueId,
    block_size: i64,
    state: Mutex<AllocState>,
}

fn block_bounds(range_id: i64, block_size: i64) -> (i64, i64) {
    (range_id * block_size + 1, (range_id + 1) * block_size)
}

impl IdBlockAllocator {
    /// Acquire write authority over the queue and the first id block.
    /// Returns the allocator and the ack level recorded in the metadata.
    pub async fn acquire(
        store: Arc<dyn QueueStore>,
        queue: QueueId,
        block_size: i64,
    ) -> Result<(Arc<Self>, i64), MatchingError> {
        let meta = store.lease_queue(&queue, None).await?;
        let (start, end) = block_bounds(meta.range_id, block_size);
        info!(
            queue = %queue,
            range_id = meta.range_id,
            block_start = start,
            block_end = end,
            "acquired task id block"
        );
        let allocator = Arc::new(Self {
            store,
            queue,
            block_size,
            state: Mutex::new(AllocState {
                range_id: meta.range_id,
                next_id: start,
                max_id: end,
            }),
        });
        Ok((allocator, meta.ack_level))
    }

    /// Mint the next id, renewing the block first when the current one is
    /// exhausted. A renewal conflict means another writer owns the queue.
    pub async fn allocate(&self) -> Result<AllocatedId, MatchingError> {
        let mut st = self.state.lock().await;
        if st.next_id > st.max_id {
            let meta = self
                .store
                .lease_queue(&self.queue, Some(st.range_id))
                .await
                .map_err(|err| match err {
                    StoreError::PreconditionFailed { .. } => MatchingError::LeaseLost,
                    other => MatchingError::Store(other),
                })?;
            let (start, end) = block_bounds(meta.range_id, self.block_size);
            debug!(
                queue = %self.queue,
                range_id = meta.range_id,
                block_start = start,
                block_end = end,
                "renewed task id block"
            );
            st.range_id = meta.range_id;
            st.next_id = start;
            st.max_id = end;
        }
        let id = AllocatedId {
            task_id: st.next_id,
            range_id: st.range_id,
        };
        st.next_id += 1;
        Ok(id)
    }

    /// Whether the next `allocate` will have to renew the lease.
    pub async fn block_exhausted(&self) -> bool {
        let st = self.state.lock().await;
        st.next_id > st.max_id
    }

    pub async fn range_id(&self) -> i64 {
        self.state.lock().await.range_id
    }
}
