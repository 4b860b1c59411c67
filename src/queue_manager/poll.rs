//! Consumer path: polls and synchronous queries.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::error::MatchingError;
use crate::matcher::PolledItem;
use crate::queue_manager::QueueManager;
use crate::task::{PolledTask, QueryTask};

impl QueueManager {
    /// Wait for a task, capped by the configured long-poll timeout. A
    /// deadline miss is an empty response, not an error.
    pub async fn poll_task(
        &self,
        poller_identity: &str,
        forwarded_from: &str,
        timeout: Duration,
    ) -> Result<Option<PolledTask>, MatchingError> {
        self.touch();
        self.record_poller(poller_identity);
        self.ensure_usable()?;

        let capped = timeout.min(self.config.matcher.long_poll_timeout());
        let deadline = Instant::now() + capped;
        let allow_forward = forwarded_from.is_empty();
        let started = Instant::now();

        match self
            .matcher
            .poll(poller_identity, deadline, allow_forward)
            .await
        {
            Ok(item) => {
                self.metrics
                    .record_poll(self.id.kind, "matched", started.elapsed());
                Ok(Some(self.into_polled(item)))
            }
            Err(MatchingError::DeadlineExceeded) => {
                self.metrics
                    .record_poll(self.id.kind, "empty", started.elapsed());
                Ok(None)
            }
            Err(err) => Err(self.map_matcher_err(err)),
        }
    }

    /// Offer a query. `Ok(None)` means a local poller took it and the
    /// response arrives via the engine's reply table; `Ok(Some(..))` carries
    /// a response proxied from an ancestor partition.
    pub async fn offer_query(
        &self,
        query_id: String,
        payload: Bytes,
        forwarded_from: &str,
        timeout: Duration,
    ) -> Result<Option<Bytes>, MatchingError> {
        self.touch();
        self.ensure_usable()?;
        if self.sticky_worker_stale() {
            return Err(MatchingError::StickyWorkerUnavailable);
        }

        let capped = timeout.min(self.config.matcher.long_poll_timeout());
        let deadline = Instant::now() + capped;
        let task = QueryTask {
            query_id,
            payload,
            forwarded_from: forwarded_from.to_string(),
        };
        self.matcher
            .offer_query(task, deadline)
            .await
            .map_err(|err| self.map_matcher_err(err))
    }

    /// Fold a matched item into the public poll response. Local backlog
    /// tasks are acked here: delivery to a poller is the matching layer's
    /// terminal outcome, execution timeouts belong to the history engine.
    fn into_polled(&self, item: PolledItem) -> PolledTask {
        match item {
            PolledItem::Task(mut task) => {
                let polled = PolledTask::Task {
                    info: task.info.clone(),
                    task_id: task.task_id,
                    forwarded_from: task.forwarded_from.clone(),
                };
                task.finish(Ok(()));
                polled
            }
            PolledItem::Query(query) => PolledTask::Query {
                query_id: query.query_id,
                payload: query.payload,
                forwarded_from: query.forwarded_from,
            },
            PolledItem::Remote(polled) => polled,
        }
    }
}
