//! Rate-limited hand-off of tasks, polls, and queries to the parent
//! partition.
//!
//! Each forwarder owns two small permit pools bounding concurrently
//! outstanding forwarded adds and polls, plus a token bucket on add/query
//! forwards. A task carrying a non-empty `forwarded_from` is never forwarded
//! again, which bounds every task to a single hop up the tree.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::config::ForwarderConfig;
use crate::error::MatchingError;
use crate::queue_id::QueueId;
use crate::task::{InternalTask, PolledTask, QueryTask, TaskInfo};

/// Matching-service surface the forwarder calls on the parent partition.
/// In production this is an RPC client; in a single process the engine
/// implements it by routing to the parent's queue manager.
#[async_trait]
pub trait MatchingClient: Send + Sync + 'static {
    async fn add_task(
        &self,
        queue: &QueueId,
        info: TaskInfo,
        forwarded_from: &str,
        timeout: Duration,
    ) -> Result<(), MatchingError>;

    async fn poll_task(
        &self,
        queue: &QueueId,
        poller_identity: &str,
        forwarded_from: &str,
        timeout: Duration,
    ) -> Result<Option<PolledTask>, MatchingError>;

    async fn query_workflow(
        &self,
        queue: &QueueId,
        payload: Bytes,
        forwarded_from: &str,
        timeout: Duration,
    ) -> Result<Bytes, MatchingError>;
}

#[derive(Debug, Error)]
pub enum ForwardError {
    /// The local token bucket ran dry within the budget.
    #[error("forward rate limit exhausted")]
    SlowDown,

    /// The parent partition rejected or failed the forwarded call.
    #[error("forward failed: {0}")]
    Remote(MatchingError),
}

pub struct Forwarder {
    queue: QueueId,
    parent: QueueId,
    client: Arc<dyn MatchingClient>,
    add_permits: Arc<Semaphore>,
    poll_permits: Arc<Semaphore>,
    limiter: TokenBucket,
}

impl Forwarder {
    /// Build a forwarder for a non-root partition. Returns None for root and
    /// sticky queues, which never forward.
    pub fn new(
        cfg: &ForwarderConfig,
        queue: QueueId,
        client: Arc<dyn MatchingClient>,
    ) -> Option<Arc<Self>> {
        let parent = queue.parent(cfg.max_children_per_node)?;
        Some(Arc::new(Self {
            queue,
            parent,
            client,
            add_permits: Arc::new(Semaphore::new(cfg.max_outstanding_adds)),
            poll_permits: Arc::new(Semaphore::new(cfg.max_outstanding_polls)),
            limiter: TokenBucket::new(cfg.max_rate_per_second),
        }))
    }

    pub fn parent(&self) -> &QueueId {
        &self.parent
    }

    pub fn add_permits(&self) -> Arc<Semaphore> {
        Arc::clone(&self.add_permits)
    }

    pub fn poll_permits(&self) -> Arc<Semaphore> {
        Arc::clone(&self.poll_permits)
    }

    /// Push one task toward the parent partition.
    pub async fn forward_task(
        &self,
        task: &InternalTask,
        deadline: Instant,
    ) -> Result<(), ForwardError> {
        self.limiter.acquire(deadline).await?;
        let timeout = deadline.saturating_duration_since(Instant::now());
        self.client
            .add_task(
                &self.parent,
                task.info.clone(),
                self.queue.name.as_str(),
                timeout,
            )
            .await
            .map_err(ForwardError::Remote)
    }

    /// Proxy one poll to the parent partition and hand back whatever it
    /// matched.
    pub async fn forward_poll(
        &self,
        poller_identity: &str,
        deadline: Instant,
    ) -> Result<Option<PolledTask>, ForwardError> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        self.client
            .poll_task(
                &self.parent,
                poller_identity,
                self.queue.name.as_str(),
                timeout,
            )
            .await
            .map_err(ForwardError::Remote)
    }

    /// Proxy a query synchronously; the worker's response travels back on the
    /// same call.
    pub async fn forward_query(
        &self,
        task: &QueryTask,
        deadline: Instant,
    ) -> Result<Bytes, ForwardError> {
        self.limiter.acquire(deadline).await?;
        let timeout = deadline.saturating_duration_since(Instant::now());
        self.client
            .query_workflow(
                &self.parent,
                task.payload.clone(),
                self.queue.name.as_str(),
                timeout,
            )
            .await
            .map_err(ForwardError::Remote)
    }
}

/// Token bucket over atomics. Tokens and the last-refill timestamp are packed
/// into one u64 so acquisition is a single CAS loop.
pub struct TokenBucket {
    /// Upper 32 bits: whole tokens. Lower 32 bits: ms since `epoch`.
    packed: AtomicU64,
    epoch: Instant,
    max_tokens: u32,
    refill_per_second: u32,
}

impl TokenBucket {
    /// `rate == 0` disables limiting.
    pub fn new(rate: u32) -> Self {
        Self {
            packed: AtomicU64::new((rate as u64) << 32),
            epoch: Instant::now(),
            max_tokens: rate,
            refill_per_second: rate,
        }
    }

    /// Consume one token if available.
    pub fn try_acquire(&self) -> bool {
        if self.refill_per_second == 0 {
            return true;
        }
        loop {
            let packed = self.packed.load(Ordering::Acquire);
            let tokens = (packed >> 32) as u32;
            let last_refill_ms = (packed & 0xFFFF_FFFF) as u32;

            let elapsed_ms = self.epoch.elapsed().as_millis() as u32;
            let delta_ms = elapsed_ms.saturating_sub(last_refill_ms);
            let refill = (delta_ms as u64 * self.refill_per_second as u64) / 1000;
            let available = ((tokens as u64 + refill).min(self.max_tokens as u64)) as u32;

            let (granted, next_tokens) = if available >= 1 {
                (true, available - 1)
            } else {
                (false, available)
            };
            let next = ((next_tokens as u64) << 32) | (elapsed_ms as u64);
            match self
                .packed
                .compare_exchange(packed, next, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return granted,
                Err(_) => continue,
            }
        }
    }

    /// Wait for a token, giving up at the deadline.
    pub async fn acquire(&self, deadline: Instant) -> Result<(), ForwardError> {
        let interval = if self.refill_per_second == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(1000 / self.refill_per_second as u64 + 1)
        };
        loop {
            if self.try_acquire() {
                return Ok(());
            }
            let now = Instant::now();
            if now + interval > deadline {
                return Err(ForwardError::SlowDown);
            }
            tokio::time::sleep(interval).await;
        }
    }
}
