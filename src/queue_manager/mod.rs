//! Per-queue owner binding allocator, matcher, backlog reader, and
//! forwarder.
//!
//! This module contains the core `QueueManager` type and its implementation,
//! split across submodules:
//!
//! - `add`: producer path - sync match attempt, then backlog spill
//! - `poll`: consumer path - polls, queries, describe
//!
//! A manager is created lazily by the engine on the first request for its
//! queue, holds the queue's range lease while alive, and stops itself after
//! an idle period or on losing the lease.

mod add;
mod poll;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{info, warn};

use crate::backlog::BacklogReader;
use crate::config::MatchingConfig;
use crate::error::MatchingError;
use crate::forwarder::{Forwarder, MatchingClient};
use crate::id_alloc::IdBlockAllocator;
use crate::matcher::TaskMatcher;
use crate::metrics::Metrics;
use crate::queue_id::{QueueId, QueueSubKind};
use crate::store::QueueStore;
use crate::task::now_epoch_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerPhase {
    Initializing,
    Leased,
    RenewingLease,
    LeaseLost,
    Stopped,
}

impl fmt::Display for ManagerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerPhase::Initializing => write!(f, "Initializing"),
            ManagerPhase::Leased => write!(f, "Leased"),
            ManagerPhase::RenewingLease => write!(f, "RenewingLease"),
            ManagerPhase::LeaseLost => write!(f, "LeaseLost"),
            ManagerPhase::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Observability snapshot returned by describe.
#[derive(Debug, Clone)]
pub struct QueueDescription {
    pub backlog_count_estimate: i64,
    pub ack_level: i64,
    pub read_level: i64,
    pub pollers: Vec<PollerInfo>,
    pub forward_rate_per_second: u32,
}

#[derive(Debug, Clone)]
pub struct PollerInfo {
    pub identity: String,
    pub last_access_ms: i64,
}

pub struct QueueManager {
    pub(crate) id: QueueId,
    pub(crate) config: Arc<MatchingConfig>,
    pub(crate) store: Arc<dyn QueueStore>,
    pub(crate) allocator: Arc<IdBlockAllocator>,
    pub(crate) matcher: Arc<TaskMatcher>,
    pub(crate) backlog: Arc<BacklogReader>,
    pub(crate) max_minted: Arc<AtomicI64>,
    phase: Mutex<ManagerPhase>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    lease_lost: Arc<Notify>,
    stopped: AtomicBool,
    pollers: Mutex<HashMap<String, i64>>,
    last_activity_ms: AtomicI64,
    last_sticky_poll_ms: AtomicI64,
    pub(crate) metrics: Arc<Metrics>,
}

impl QueueManager {
    /// Lease the queue and bring up the matcher and backlog reader.
    pub async fn start(
        id: QueueId,
        config: Arc<MatchingConfig>,
        store: Arc<dyn QueueStore>,
        client: Option<Arc<dyn MatchingClient>>,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>, MatchingError> {
        let (allocator, ack_level) =
            IdBlockAllocator::acquire(store.clone(), id.clone(), config.lease.range_size).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let fwdr: Option<Arc<Forwarder>> =
            client.and_then(|c| Forwarder::new(&config.forwarder, id.clone(), c));
        let matcher = TaskMatcher::new(id.clone(), fwdr, shutdown_rx.clone());

        let max_minted = Arc::new(AtomicI64::new(0));
        let lease_lost = Arc::new(Notify::new());
        let backlog = BacklogReader::new(
            store.clone(),
            id.clone(),
            matcher.clone(),
            allocator.clone(),
            config.backlog.clone(),
            ack_level,
            max_minted.clone(),
            shutdown_rx.clone(),
            lease_lost.clone(),
            metrics.clone(),
        );

        let manager = Arc::new(Self {
            id,
            config,
            store,
            allocator,
            matcher,
            backlog,
            max_minted,
            phase: Mutex::new(ManagerPhase::Leased),
            shutdown_tx,
            shutdown_rx,
            lease_lost,
            stopped: AtomicBool::new(false),
            pollers: Mutex::new(HashMap::new()),
            last_activity_ms: AtomicI64::new(now_epoch_ms()),
            last_sticky_poll_ms: AtomicI64::new(0),
            metrics: metrics.clone(),
        });

        manager.backlog.start();
        manager.clone().spawn_liveness();
        metrics.record_manager_started();
        info!(queue = %manager.id, "queue manager started");
        Ok(manager)
    }

    pub fn phase(&self) -> ManagerPhase {
        *self.phase.lock().unwrap()
    }

    /// Whether requests may still be routed here.
    pub fn is_usable(&self) -> bool {
        matches!(
            self.phase(),
            ManagerPhase::Leased | ManagerPhase::RenewingLease
        )
    }

    /// Graceful stop: persist the ack level, then cut off in-flight work.
    /// Durable state stays intact; the engine re-creates the manager on the
    /// next request.
    pub async fn stop(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.backlog.persist_ack_level().await;
        self.shutdown(ManagerPhase::Stopped);
        info!(queue = %self.id, "queue manager stopped");
    }

    /// Another instance took the lease. In-flight offers and polls are
    /// rejected; the engine re-creates the manager with a fresh lease.
    pub(crate) fn fail_lease(&self) {
        if !self.stopped.load(Ordering::SeqCst) {
            self.metrics.record_lease_lost();
            warn!(queue = %self.id, "queue lease lost, shutting down manager");
        }
        self.shutdown(ManagerPhase::LeaseLost);
    }

    fn shutdown(&self, phase: ManagerPhase) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.phase.lock().unwrap() = phase;
        let _ = self.shutdown_tx.send(true);
        self.metrics.record_manager_stopped();
    }

    fn spawn_liveness(self: Arc<Self>) {
        let idle_timeout = self.config.queue.idle_timeout();
        let check_interval = (idle_timeout / 4).max(Duration::from_millis(50));
        tokio::spawn(async move {
            let mut shutdown = self.shutdown_rx.clone();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = self.lease_lost.notified() => {
                        self.fail_lease();
                        break;
                    }
                    _ = tokio::time::sleep(check_interval) => {
                        let idle_ms = now_epoch_ms() - self.last_activity_ms.load(Ordering::Relaxed);
                        if idle_ms >= idle_timeout.as_millis() as i64 {
                            info!(queue = %self.id, idle_ms, "queue manager idle, stopping");
                            self.stop().await;
                            break;
                        }
                    }
                }
            }
        });
    }

    pub(crate) fn touch(&self) {
        self.last_activity_ms
            .store(now_epoch_ms(), Ordering::Relaxed);
    }

    pub(crate) fn record_poller(&self, identity: &str) {
        self.pollers
            .lock()
            .unwrap()
            .insert(identity.to_string(), now_epoch_ms());
        if self.id.sub_kind == QueueSubKind::Sticky {
            self.last_sticky_poll_ms
                .store(now_epoch_ms(), Ordering::Relaxed);
        }
    }

    /// A sticky queue with no recent poll has lost its bound worker.
    pub(crate) fn sticky_worker_stale(&self) -> bool {
        if self.id.sub_kind != QueueSubKind::Sticky {
            return false;
        }
        let last = self.last_sticky_poll_ms.load(Ordering::Relaxed);
        let window = self.config.queue.sticky_poller_timeout_ms as i64;
        last == 0 || now_epoch_ms() - last > window
    }

    pub(crate) fn ensure_usable(&self) -> Result<(), MatchingError> {
        match self.phase() {
            ManagerPhase::Initializing | ManagerPhase::Leased | ManagerPhase::RenewingLease => {
                Ok(())
            }
            ManagerPhase::LeaseLost => Err(MatchingError::LeaseLost),
            ManagerPhase::Stopped => Err(MatchingError::Gone),
        }
    }

    /// Matcher operations report `Gone` when the shutdown watch fires; map
    /// that back to the phase that caused it.
    pub(crate) fn map_matcher_err(&self, err: MatchingError) -> MatchingError {
        match (err, self.phase()) {
            (MatchingError::Gone, ManagerPhase::LeaseLost) => MatchingError::LeaseLost,
            (err, _) => err,
        }
    }

    pub(crate) fn transition(&self, from: ManagerPhase, to: ManagerPhase) {
        let mut phase = self.phase.lock().unwrap();
        if *phase == from {
            *phase = to;
        }
    }

    pub fn describe(&self) -> QueueDescription {
        let pollers = self
            .pollers
            .lock()
            .unwrap()
            .iter()
            .map(|(identity, last)| PollerInfo {
                identity: identity.clone(),
                last_access_ms: *last,
            })
            .collect();
        QueueDescription {
            backlog_count_estimate: self.backlog.backlog_estimate(),
            ack_level: self.backlog.ack_level(),
            read_level: self.backlog.read_level(),
            pollers,
            forward_rate_per_second: self.config.forwarder.max_rate_per_second,
        }
    }
}
