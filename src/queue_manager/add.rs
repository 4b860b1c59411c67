//! Producer path: sync-match attempt, then durable spill to the backlog.

use std::sync::atomic::Ordering;

use tokio::time::Instant;
use tracing::debug;

use crate::error::MatchingError;
use crate::matcher::OfferOutcome;
use crate::queue_id::QueueSubKind;
use crate::queue_manager::{ManagerPhase, QueueManager};
use crate::store::StoreError;
use crate::task::{now_epoch_ms, InternalTask, TaskInfo, TaskRecord};

impl QueueManager {
    /// Accept one produced task. Returns true when the task was handed to a
    /// poller (or an ancestor partition) without touching storage, false when
    /// it was persisted into the backlog instead.
    pub async fn add_task(
        &self,
        info: TaskInfo,
        forwarded_from: &str,
    ) -> Result<bool, MatchingError> {
        self.touch();
        self.ensure_usable()?;
        if self.sticky_worker_stale() {
            return Err(MatchingError::StickyWorkerUnavailable);
        }

        let deadline = Instant::now() + self.config.matcher.sync_match_timeout();
        let task = InternalTask::fresh(info, forwarded_from.to_string());
        match self.matcher.offer(task, deadline).await {
            Ok(OfferOutcome::Matched) => {
                self.metrics.record_sync_match(self.id.kind);
                Ok(true)
            }
            Ok(OfferOutcome::NotMatched(task)) => {
                let task_id = self.spill_to_backlog(&task).await?;
                debug!(
                    queue = %self.id,
                    task_id,
                    workflow_id = %task.info.workflow_id,
                    "task persisted to backlog"
                );
                Ok(false)
            }
            Err(err) => Err(self.map_matcher_err(err)),
        }
    }

    /// Mint an id under the current range and write the task row. A stale
    /// range on either step means another instance owns the queue now.
    async fn spill_to_backlog(&self, task: &InternalTask) -> Result<i64, MatchingError> {
        let mut info = task.info.clone();
        if self.id.sub_kind == QueueSubKind::Sticky {
            info.expiry_ms = now_epoch_ms() + self.config.queue.sticky_task_ttl_ms as i64;
        }

        if self.allocator.block_exhausted().await {
            self.transition(ManagerPhase::Leased, ManagerPhase::RenewingLease);
        }
        let allocated = match self.allocator.allocate().await {
            Ok(allocated) => {
                self.transition(ManagerPhase::RenewingLease, ManagerPhase::Leased);
                allocated
            }
            Err(MatchingError::LeaseLost) => {
                self.fail_lease();
                return Err(MatchingError::LeaseLost);
            }
            Err(err) => return Err(err),
        };

        let record = TaskRecord {
            task_id: allocated.task_id,
            info,
        };
        match self
            .store
            .create_task(&self.id, &record, allocated.range_id)
            .await
        {
            Ok(()) => {}
            Err(StoreError::PreconditionFailed { .. }) => {
                self.fail_lease();
                return Err(MatchingError::LeaseLost);
            }
            Err(err) => return Err(err.into()),
        }

        self.max_minted.fetch_max(record.task_id, Ordering::Relaxed);
        self.backlog.notify_new_task();
        self.metrics.record_task_persisted(self.id.kind);
        Ok(record.task_id)
    }
}
