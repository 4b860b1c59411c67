//! Backlog reader: streams durable tasks to the matcher in id order.
//!
//! The reader runs as a background loop per queue manager. It batches reads
//! above the read level, dispatches each task through a blocking offer,
//! tracks out-of-order completions to advance the ack level, persists the
//! ack level periodically, and trims completed prefixes from storage.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::BacklogConfig;
use crate::error::MatchingError;
use crate::id_alloc::IdBlockAllocator;
use crate::matcher::TaskMatcher;
use crate::metrics::Metrics;
use crate::queue_id::QueueId;
use crate::store::{QueueMetadata, QueueStore, StoreError};
use crate::task::{now_epoch_ms, InternalTask, TaskCompletion, TaskRecord};

/// How long one backlog task is offered before the loop gives the scheduler a
/// chance to run housekeeping; the task is retried immediately afterwards.
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(60);

const MIN_BACKOFF_MS: u64 = 20;
const MAX_BACKOFF_MS: u64 = 1_000;

/// Completion bookkeeping above the ack level.
///
/// Completions may arrive out of order; ids park in a sorted set and the ack
/// level advances over every completed prefix.
pub struct AckTracker {
    read_level: i64,
    ack_level: i64,
    outstanding: BTreeMap<i64, bool>,
}

impl AckTracker {
    pub fn new(ack_level: i64) -> Self {
        Self {
            read_level: ack_level,
            ack_level,
            outstanding: BTreeMap::new(),
        }
    }

    /// Record that a task was read from storage.
    pub fn on_read(&mut self, task_id: i64) {
        self.outstanding.entry(task_id).or_insert(false);
        if task_id > self.read_level {
            self.read_level = task_id;
        }
    }

    /// Mark a task completed and advance the ack level across the completed
    /// prefix. Completing an already-acked id is a no-op.
    pub fn complete(&mut self, task_id: i64) -> i64 {
        if task_id <= self.ack_level {
            return self.ack_level;
        }
        *self.outstanding.entry(task_id).or_insert(true) = true;
        while let Some((&id, &done)) = self.outstanding.iter().next() {
            if !done {
                break;
            }
            self.outstanding.remove(&id);
            self.ack_level = id;
        }
        self.ack_level
    }

    pub fn ack_level(&self) -> i64 {
        self.ack_level
    }

    pub fn read_level(&self) -> i64 {
        self.read_level
    }

    /// Tasks read but not yet completed. Task-id arithmetic is useless as a
    /// count because ids are block-allocated with gaps.
    pub fn outstanding(&self) -> usize {
        self.outstanding.values().filter(|done| !**done).count()
    }
}

pub struct BacklogReader {
    store: Arc<dyn QueueStore>,
    queue: QueueId,
    matcher: Arc<TaskMatcher>,
    allocator: Arc<IdBlockAllocator>,
    cfg: BacklogConfig,
    ack: Arc<Mutex<AckTracker>>,
    /// Tasks whose delivery failed after being read; redelivered before the
    /// next storage batch.
    retries: Arc<Mutex<VecDeque<TaskRecord>>>,
    notify: Arc<Notify>,
    max_minted: Arc<AtomicI64>,
    shutdown: watch::Receiver<bool>,
    lease_lost: Arc<Notify>,
    running: AtomicBool,
    last_persisted_ack: AtomicI64,
    last_trimmed: AtomicI64,
    metrics: Arc<Metrics>,
}

impl BacklogReader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn QueueStore>,
        queue: QueueId,
        matcher: Arc<TaskMatcher>,
        allocator: Arc<IdBlockAllocator>,
        cfg: BacklogConfig,
        ack_level: i64,
        max_minted: Arc<AtomicI64>,
        shutdown: watch::Receiver<bool>,
        lease_lost: Arc<Notify>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            queue,
            matcher,
            allocator,
            cfg,
            ack: Arc::new(Mutex::new(AckTracker::new(ack_level))),
            retries: Arc::new(Mutex::new(VecDeque::new())),
            notify: Arc::new(Notify::new()),
            max_minted,
            shutdown,
            lease_lost,
            running: AtomicBool::new(false),
            last_persisted_ack: AtomicI64::new(ack_level),
            last_trimmed: AtomicI64::new(ack_level),
            metrics,
        })
    }

    /// Start the background dispatch loop.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let reader = Arc::clone(self);
        tokio::spawn(async move {
            reader.run().await;
        });
    }

    /// Wake the loop promptly after a new task was minted.
    pub fn notify_new_task(&self) {
        self.notify.notify_one();
    }

    pub fn ack_level(&self) -> i64 {
        self.ack.lock().unwrap().ack_level()
    }

    pub fn read_level(&self) -> i64 {
        self.ack.lock().unwrap().read_level()
    }

    /// Rough count of undelivered tasks: everything read but unacked plus
    /// anything queued for redelivery. Rows not yet read are picked up within
    /// one batch cycle.
    pub fn backlog_estimate(&self) -> i64 {
        let outstanding = self.ack.lock().unwrap().outstanding();
        let retries = self.retries.lock().unwrap().len();
        (outstanding + retries) as i64
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut sleep_ms = MIN_BACKOFF_MS;
        let mut last_ack_persist = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            if last_ack_persist.elapsed() >= self.cfg.update_ack_interval() {
                if let Err(MatchingError::LeaseLost) = self.persist_ack_level().await {
                    break;
                }
                last_ack_persist = Instant::now();
            }

            let batch = match self.next_batch().await {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(queue = %self.queue, error = %err, "backlog read failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            if batch.is_empty() {
                self.maybe_trim().await;
                let caught_up = {
                    let read_level = self.read_level();
                    read_level >= self.max_minted.load(Ordering::Relaxed)
                };
                if caught_up {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    sleep_ms = MIN_BACKOFF_MS;
                } else {
                    // Storage lagging behind the writer; retry with backoff.
                    tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
                    sleep_ms = (sleep_ms * 2).min(MAX_BACKOFF_MS);
                }
                continue;
            }
            sleep_ms = MIN_BACKOFF_MS;

            for record in batch {
                if *shutdown.borrow() {
                    break;
                }
                self.ack.lock().unwrap().on_read(record.task_id);

                if record.info.is_expired(now_epoch_ms()) {
                    debug!(
                        queue = %self.queue,
                        task_id = record.task_id,
                        "dropping expired backlog task"
                    );
                    self.metrics.record_task_expired();
                    self.ack.lock().unwrap().complete(record.task_id);
                    continue;
                }

                let completion = self.completion_for(&record);
                let task = InternalTask::from_backlog(record, completion);
                let deadline = Instant::now() + DISPATCH_TIMEOUT;
                match self.matcher.must_offer(task, deadline).await {
                    Ok(()) => {}
                    Err(_) => {
                        // Delivery failed; the task is already queued for
                        // retry. Stop the batch so redelivery stays in id
                        // order.
                        break;
                    }
                }
            }

            self.maybe_trim().await;
        }

        let _ = self.persist_ack_level().await;
        debug!(queue = %self.queue, "backlog reader stopped");
    }

    /// Failed deliveries first, then the next storage batch above the read
    /// level.
    async fn next_batch(&self) -> Result<Vec<TaskRecord>, StoreError> {
        {
            let mut retries = self.retries.lock().unwrap();
            if !retries.is_empty() {
                return Ok(retries.drain(..).collect());
            }
        }
        let read_level = self.read_level();
        self.store
            .get_tasks(&self.queue, read_level, self.cfg.read_batch_size)
            .await
    }

    fn completion_for(&self, record: &TaskRecord) -> TaskCompletion {
        let ack = Arc::clone(&self.ack);
        let retries = Arc::clone(&self.retries);
        let notify = Arc::clone(&self.notify);
        let record = record.clone();
        Box::new(move |outcome| match outcome {
            Ok(()) => {
                ack.lock().unwrap().complete(record.task_id);
            }
            Err(_) => {
                retries.lock().unwrap().push_back(record);
                notify.notify_one();
            }
        })
    }

    /// Conditionally persist the ack level. A precondition failure means the
    /// lease moved to another instance.
    pub async fn persist_ack_level(&self) -> Result<(), MatchingError> {
        let ack_level = self.ack_level();
        if ack_level == self.last_persisted_ack.load(Ordering::Relaxed) {
            return Ok(());
        }
        let range_id = self.allocator.range_id().await;
        let metadata = QueueMetadata {
            range_id,
            ack_level,
            last_updated_ms: now_epoch_ms(),
        };
        match self
            .store
            .update_queue(&self.queue, &metadata, range_id)
            .await
        {
            Ok(()) => {
                self.last_persisted_ack.store(ack_level, Ordering::Relaxed);
                Ok(())
            }
            Err(StoreError::PreconditionFailed { .. }) => {
                warn!(queue = %self.queue, "ack level persist lost the lease");
                self.lease_lost.notify_one();
                Err(MatchingError::LeaseLost)
            }
            Err(err) => {
                warn!(queue = %self.queue, error = %err, "ack level persist failed");
                Err(MatchingError::Store(err))
            }
        }
    }

    /// Trim completed prefixes once the ack level has advanced.
    async fn maybe_trim(&self) {
        let ack_level = self.ack_level();
        if ack_level <= self.last_trimmed.load(Ordering::Relaxed) {
            return;
        }
        match self
            .store
            .complete_tasks_less_than(&self.queue, ack_level + 1, self.cfg.max_delete_batch_size)
            .await
        {
            Ok(deleted) => {
                debug!(queue = %self.queue, ack_level, deleted, "trimmed completed tasks");
                if deleted < self.cfg.max_delete_batch_size {
                    self.last_trimmed.store(ack_level, Ordering::Relaxed);
                }
            }
            Err(err) => {
                warn!(queue = %self.queue, error = %err, "backlog trim failed");
            }
        }
    }
}
