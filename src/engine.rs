//! Engine/router: multiplexes the RPC surface across queue managers.
//!
//! The engine owns the process-wide identity-to-manager map. Managers are
//! created lazily on first use and re-created after they stop or lose their
//! lease. It also implements [`MatchingClient`] over itself so child
//! partitions forward to their parents in process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{oneshot, Notify, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::MatchingConfig;
use crate::error::MatchingError;
use crate::forwarder::MatchingClient;
use crate::metrics::Metrics;
use crate::queue_id::{QueueId, QueueKind};
use crate::queue_manager::{QueueDescription, QueueManager};
use crate::store::QueueStore;
use crate::task::{PolledTask, TaskInfo};

pub struct MatchingEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: Arc<MatchingConfig>,
    store: Arc<dyn QueueStore>,
    managers: RwLock<HashMap<QueueId, Arc<QueueManager>>>,
    /// Reply channels for queries matched to local pollers, keyed by query
    /// id (the task token handed to the worker).
    pending_queries: Mutex<HashMap<String, oneshot::Sender<Bytes>>>,
    outstanding_polls: Mutex<HashMap<(QueueId, String), Arc<Notify>>>,
    metrics: Arc<Metrics>,
}

impl MatchingEngine {
    pub fn new(config: MatchingConfig, store: Arc<dyn QueueStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config: Arc::new(config),
                store,
                managers: RwLock::new(HashMap::new()),
                pending_queries: Mutex::new(HashMap::new()),
                outstanding_polls: Mutex::new(HashMap::new()),
                metrics,
            }),
        }
    }

    pub async fn add_decision_task(
        &self,
        queue: QueueId,
        info: TaskInfo,
        forwarded_from: &str,
    ) -> Result<(), MatchingError> {
        ensure_kind(&queue, QueueKind::Decision)?;
        self.inner.add_task(queue, info, forwarded_from).await
    }

    pub async fn add_activity_task(
        &self,
        queue: QueueId,
        info: TaskInfo,
        forwarded_from: &str,
    ) -> Result<(), MatchingError> {
        ensure_kind(&queue, QueueKind::Activity)?;
        self.inner.add_task(queue, info, forwarded_from).await
    }

    /// Long-poll for a decision task. `None` means the deadline passed with
    /// nothing matched.
    pub async fn poll_for_decision_task(
        &self,
        queue: QueueId,
        poller_identity: &str,
        forwarded_from: &str,
        timeout: Duration,
    ) -> Result<Option<PolledTask>, MatchingError> {
        ensure_kind(&queue, QueueKind::Decision)?;
        self.inner
            .poll_task(queue, poller_identity, forwarded_from, timeout)
            .await
    }

    pub async fn poll_for_activity_task(
        &self,
        queue: QueueId,
        poller_identity: &str,
        forwarded_from: &str,
        timeout: Duration,
    ) -> Result<Option<PolledTask>, MatchingError> {
        ensure_kind(&queue, QueueKind::Activity)?;
        self.inner
            .poll_task(queue, poller_identity, forwarded_from, timeout)
            .await
    }

    /// Synchronous query round-trip: blocks until a worker responds via
    /// [`respond_query_task_completed`] or an ancestor partition returns the
    /// response inline.
    ///
    /// [`respond_query_task_completed`]: MatchingEngine::respond_query_task_completed
    pub async fn query_workflow(
        &self,
        queue: QueueId,
        payload: Bytes,
        forwarded_from: &str,
        timeout: Duration,
    ) -> Result<Bytes, MatchingError> {
        self.inner
            .query_workflow(queue, payload, forwarded_from, timeout)
            .await
    }

    /// Deliver a worker's query response to the waiting caller.
    pub fn respond_query_task_completed(
        &self,
        query_id: &str,
        response: Bytes,
    ) -> Result<(), MatchingError> {
        let tx = self
            .inner
            .pending_queries
            .lock()
            .unwrap()
            .remove(query_id)
            .ok_or_else(|| MatchingError::QueryNotFound(query_id.to_string()))?;
        // The caller may have timed out already; that is not the worker's
        // problem.
        let _ = tx.send(response);
        Ok(())
    }

    /// Promptly unblock an outstanding poll; it returns empty.
    pub fn cancel_outstanding_poll(&self, queue: &QueueId, poller_identity: &str) {
        let polls = self.inner.outstanding_polls.lock().unwrap();
        if let Some(cancel) = polls.get(&(queue.clone(), poller_identity.to_string())) {
            // notify_one stores a permit, so a cancel racing the poll's
            // select registration still lands.
            cancel.notify_one();
        }
    }

    pub async fn describe_queue(&self, queue: QueueId) -> Result<QueueDescription, MatchingError> {
        let manager = self.inner.manager_for(&queue).await?;
        Ok(manager.describe())
    }

    /// Direct access for tests and embedding; most callers use the RPC
    /// methods above.
    pub async fn manager(&self, queue: &QueueId) -> Result<Arc<QueueManager>, MatchingError> {
        self.inner.manager_for(queue).await
    }

    /// Stop every manager. Durable state stays behind.
    pub async fn stop(&self) {
        let managers: Vec<Arc<QueueManager>> = {
            let mut map = self.inner.managers.write().await;
            map.drain().map(|(_, m)| m).collect()
        };
        for manager in managers {
            manager.stop().await;
        }
        info!("matching engine stopped");
    }
}

impl EngineInner {
    /// Look up the queue's manager, creating or re-creating it as needed.
    /// Exactly one manager per identity exists at a time within the process.
    async fn manager_for(
        self: &Arc<Self>,
        queue: &QueueId,
    ) -> Result<Arc<QueueManager>, MatchingError> {
        {
            let managers = self.managers.read().await;
            if let Some(manager) = managers.get(queue) {
                if manager.is_usable() {
                    return Ok(manager.clone());
                }
            }
        }

        let mut managers = self.managers.write().await;
        if let Some(manager) = managers.get(queue).cloned() {
            if manager.is_usable() {
                return Ok(manager);
            }
            managers.remove(queue);
            manager.stop().await;
            debug!(queue = %queue, phase = %manager.phase(), "replacing dead queue manager");
        }

        let client: Arc<dyn MatchingClient> = Arc::new(EngineClient {
            inner: Arc::downgrade(self),
        });
        let manager = QueueManager::start(
            queue.clone(),
            self.config.clone(),
            self.store.clone(),
            Some(client),
            self.metrics.clone(),
        )
        .await?;
        managers.insert(queue.clone(), manager.clone());
        Ok(manager)
    }

    /// Drop a manager that reported a terminal error so the next request
    /// builds a fresh one.
    async fn evict(&self, queue: &QueueId, manager: &Arc<QueueManager>) {
        {
            let mut managers = self.managers.write().await;
            if let Some(current) = managers.get(queue) {
                if Arc::ptr_eq(current, manager) {
                    managers.remove(queue);
                }
            }
        }
        manager.stop().await;
    }

    async fn add_task(
        self: &Arc<Self>,
        queue: QueueId,
        info: TaskInfo,
        forwarded_from: &str,
    ) -> Result<(), MatchingError> {
        validate_task(&info)?;
        self.metrics
            .record_task_added(queue.kind, !forwarded_from.is_empty());
        let manager = self.manager_for(&queue).await?;
        match manager.add_task(info, forwarded_from).await {
            Ok(_sync_matched) => Ok(()),
            Err(err @ (MatchingError::LeaseLost | MatchingError::Gone)) => {
                self.evict(&queue, &manager).await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn poll_task(
        self: &Arc<Self>,
        queue: QueueId,
        poller_identity: &str,
        forwarded_from: &str,
        timeout: Duration,
    ) -> Result<Option<PolledTask>, MatchingError> {
        let manager = self.manager_for(&queue).await?;
        let cancel = self.register_poll(&queue, poller_identity);

        let result = tokio::select! {
            biased;
            res = manager.poll_task(poller_identity, forwarded_from, timeout) => res,
            _ = cancel.notified() => Ok(None),
        };
        self.deregister_poll(&queue, poller_identity);

        match result {
            Err(err @ (MatchingError::LeaseLost | MatchingError::Gone)) => {
                self.evict(&queue, &manager).await;
                Err(err)
            }
            other => other,
        }
    }

    async fn query_workflow(
        self: &Arc<Self>,
        queue: QueueId,
        payload: Bytes,
        forwarded_from: &str,
        timeout: Duration,
    ) -> Result<Bytes, MatchingError> {
        self.metrics.record_query();
        let query_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_queries
            .lock()
            .unwrap()
            .insert(query_id.clone(), tx);

        let started = tokio::time::Instant::now();
        let result = async {
            let manager = self.manager_for(&queue).await?;
            match manager
                .offer_query(query_id.clone(), payload, forwarded_from, timeout)
                .await
            {
                // Answered synchronously by an ancestor partition.
                Ok(Some(response)) => Ok(response),
                // Matched to a local poller; wait for the worker's response.
                Ok(None) => {
                    let remaining = timeout.saturating_sub(started.elapsed());
                    match tokio::time::timeout(remaining, rx).await {
                        Ok(Ok(response)) => Ok(response),
                        Ok(Err(_)) => Err(MatchingError::Gone),
                        Err(_) => Err(MatchingError::DeadlineExceeded),
                    }
                }
                Err(err @ (MatchingError::LeaseLost | MatchingError::Gone)) => {
                    self.evict(&queue, &manager).await;
                    Err(err)
                }
                Err(err) => Err(err),
            }
        }
        .await;

        self.pending_queries.lock().unwrap().remove(&query_id);
        result
    }

    fn register_poll(&self, queue: &QueueId, poller_identity: &str) -> Arc<Notify> {
        self.outstanding_polls
            .lock()
            .unwrap()
            .entry((queue.clone(), poller_identity.to_string()))
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn deregister_poll(&self, queue: &QueueId, poller_identity: &str) {
        self.outstanding_polls
            .lock()
            .unwrap()
            .remove(&(queue.clone(), poller_identity.to_string()));
    }
}

/// In-process matching client used by forwarders: routes calls for the
/// parent partition back through the same engine.
struct EngineClient {
    inner: Weak<EngineInner>,
}

#[async_trait]
impl MatchingClient for EngineClient {
    async fn add_task(
        &self,
        queue: &QueueId,
        info: TaskInfo,
        forwarded_from: &str,
        timeout: Duration,
    ) -> Result<(), MatchingError> {
        let inner = self.inner.upgrade().ok_or(MatchingError::Gone)?;
        match tokio::time::timeout(timeout, inner.add_task(queue.clone(), info, forwarded_from))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(MatchingError::DeadlineExceeded),
        }
    }

    async fn poll_task(
        &self,
        queue: &QueueId,
        poller_identity: &str,
        forwarded_from: &str,
        timeout: Duration,
    ) -> Result<Option<PolledTask>, MatchingError> {
        let inner = self.inner.upgrade().ok_or(MatchingError::Gone)?;
        inner
            .poll_task(queue.clone(), poller_identity, forwarded_from, timeout)
            .await
    }

    async fn query_workflow(
        &self,
        queue: &QueueId,
        payload: Bytes,
        forwarded_from: &str,
        timeout: Duration,
    ) -> Result<Bytes, MatchingError> {
        let inner = self.inner.upgrade().ok_or(MatchingError::Gone)?;
        inner
            .query_workflow(queue.clone(), payload, forwarded_from, timeout)
            .await
    }
}

fn ensure_kind(queue: &QueueId, kind: QueueKind) -> Result<(), MatchingError> {
    if queue.kind != kind {
        return Err(MatchingError::InvalidArgument(format!(
            "queue {} is not a {} queue",
            queue, kind
        )));
    }
    Ok(())
}

fn validate_task(info: &TaskInfo) -> Result<(), MatchingError> {
    if info.workflow_id.is_empty() {
        return Err(MatchingError::InvalidArgument(
            "workflow_id must not be empty".to_string(),
        ));
    }
    if info.run_id.is_empty() {
        return Err(MatchingError::InvalidArgument(
            "run_id must not be empty".to_string(),
        ));
    }
    Ok(())
}
