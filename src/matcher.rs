//! Producer/poller rendezvous.
//!
//! The matcher is the synchronous hand-off point for one queue partition.
//! Waiting pollers and blocked offers park as single-shot channels in a
//! shared table; a non-blocking send is "claim a live parked waiter", a
//! blocking send is "park an entry and await its claim". Every blocking
//! operation races the local rendezvous against forwarding to the parent
//! partition and the caller's deadline; selects are biased so a local match
//! always beats a forward when both are ready.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::error::MatchingError;
use crate::forwarder::Forwarder;
use crate::queue_id::QueueId;
use crate::task::{InternalTask, PolledTask, QueryTask};

/// Pause between forward attempts after a forward failure, so a throttled
/// parent is not hammered in a tight loop.
const FORWARD_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Budget withheld from forwarded polls so the caller keeps headroom for a
/// local fallback.
const POLL_FORWARD_MARGIN: Duration = Duration::from_millis(100);

/// Result of offering a fresh (not yet persisted) task.
#[derive(Debug)]
pub enum OfferOutcome {
    /// Delivered to a poller or handed off to the parent partition; the
    /// producer must not persist the task.
    Matched,
    /// No taker within the deadline; the producer owns the task again and
    /// should persist it to the backlog.
    NotMatched(InternalTask),
}

/// What a poll resolves to.
#[derive(Debug)]
pub enum PolledItem {
    /// A task matched in this partition.
    Task(InternalTask),
    /// A query matched in this partition.
    Query(QueryTask),
    /// A task or query matched in an ancestor partition via a forwarded poll.
    Remote(PolledTask),
}

struct WaitingPoller {
    id: u64,
    accepts_tasks: bool,
    tx: oneshot::Sender<PolledItem>,
}

struct ParkedOffer {
    id: u64,
    task: InternalTask,
    tx: oneshot::Sender<()>,
}

struct ParkedQuery {
    id: u64,
    task: QueryTask,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct MatchState {
    pollers: VecDeque<WaitingPoller>,
    task_offers: VecDeque<ParkedOffer>,
    query_offers: VecDeque<ParkedQuery>,
    next_id: u64,
}

impl MatchState {
    fn fresh_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Hand `item` to the first live waiter satisfying `pred`. Dead waiters
    /// (cancelled polls) are discarded along the way.
    fn claim_waiter(
        &mut self,
        pred: impl Fn(&WaitingPoller) -> bool,
        mut item: PolledItem,
    ) -> Result<(), PolledItem> {
        while let Some(pos) = self.pollers.iter().position(&pred) {
            let Some(waiter) = self.pollers.remove(pos) else {
                break;
            };
            match waiter.tx.send(item) {
                Ok(()) => return Ok(()),
                Err(returned) => item = returned,
            }
        }
        Err(item)
    }
}

pub struct TaskMatcher {
    queue: QueueId,
    state: Mutex<MatchState>,
    fwdr: Option<Arc<Forwarder>>,
    shutdown: watch::Receiver<bool>,
}

impl TaskMatcher {
    pub fn new(
        queue: QueueId,
        fwdr: Option<Arc<Forwarder>>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            state: Mutex::new(MatchState::default()),
            fwdr,
            shutdown,
        })
    }

    /// Offer a fresh task from a producer.
    ///
    /// Fast path: hand to a waiting poller. Otherwise race a parked local
    /// hand-off against one forward attempt and the deadline; a forward
    /// failure resolves promptly to `NotMatched` so the producer can persist
    /// without burning the whole sync-match window.
    pub async fn offer(
        &self,
        task: InternalTask,
        deadline: Instant,
    ) -> Result<OfferOutcome, MatchingError> {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return Err(MatchingError::Gone);
        }
        let forward_allowed = !task.is_forwarded();
        let (id, mut rx) = match self.park_offer(task) {
            Ok(()) => return Ok(OfferOutcome::Matched),
            Err(parked) => parked,
        };
        let sem = self.add_permits(forward_allowed);

        tokio::select! {
            biased;
            _ = &mut rx => Ok(OfferOutcome::Matched),
            _ = shutdown.changed() => {
                match self.retract_offer(id) {
                    Some(_task) => Err(MatchingError::Gone),
                    None => Ok(OfferOutcome::Matched),
                }
            }
            permit = acquire_permit(sem, Instant::now()) => {
                let Some(task) = self.retract_offer(id) else {
                    drop(permit);
                    return Ok(OfferOutcome::Matched);
                };
                let fwdr = self.fwdr.as_ref().ok_or(MatchingError::Gone)?;
                match fwdr.forward_task(&task, deadline).await {
                    Ok(()) => Ok(OfferOutcome::Matched),
                    Err(err) => {
                        debug!(queue = %self.queue, error = %err, "task forward failed");
                        Ok(OfferOutcome::NotMatched(task))
                    }
                }
            }
            _ = sleep_until(deadline) => {
                match self.retract_offer(id) {
                    Some(task) => Ok(OfferOutcome::NotMatched(task)),
                    None => Ok(OfferOutcome::Matched),
                }
            }
        }
    }

    /// Offer a backlog task. Unlike `offer`, this never gives the task back:
    /// it keeps racing the local rendezvous against forwarding until a taker
    /// is found, the deadline passes, or the matcher shuts down.
    pub async fn must_offer(
        &self,
        task: InternalTask,
        deadline: Instant,
    ) -> Result<(), MatchingError> {
        let mut shutdown = self.shutdown.clone();
        let forward_allowed = !task.is_forwarded();
        let mut next_forward_at = Instant::now();
        let mut task = task;

        loop {
            if *shutdown.borrow() {
                return Err(MatchingError::Gone);
            }
            let (id, mut rx) = match self.park_offer(task) {
                Ok(()) => return Ok(()),
                Err(parked) => parked,
            };
            let sem = self.add_permits(forward_allowed);

            tokio::select! {
                biased;
                _ = &mut rx => return Ok(()),
                _ = shutdown.changed() => {
                    return match self.retract_offer(id) {
                        Some(_task) => Err(MatchingError::Gone),
                        None => Ok(()),
                    };
                }
                permit = acquire_permit(sem, next_forward_at) => {
                    let Some(mut retracted) = self.retract_offer(id) else {
                        drop(permit);
                        return Ok(());
                    };
                    let fwdr = self.fwdr.as_ref().ok_or(MatchingError::Gone)?;
                    match fwdr.forward_task(&retracted, deadline).await {
                        Ok(()) => {
                            retracted.finish(Ok(()));
                            return Ok(());
                        }
                        Err(err) => {
                            debug!(queue = %self.queue, error = %err, "backlog task forward failed");
                            next_forward_at = Instant::now() + FORWARD_RETRY_BACKOFF;
                            task = retracted;
                        }
                    }
                }
                _ = sleep_until(deadline) => {
                    return match self.retract_offer(id) {
                        Some(_task) => Err(MatchingError::DeadlineExceeded),
                        None => Ok(()),
                    };
                }
            }
        }
    }

    /// Offer a query task. `Ok(None)` means a local poller took it and the
    /// response will arrive out of band; `Ok(Some(..))` carries the response
    /// obtained synchronously from an ancestor partition.
    pub async fn offer_query(
        &self,
        task: QueryTask,
        deadline: Instant,
    ) -> Result<Option<Bytes>, MatchingError> {
        let mut shutdown = self.shutdown.clone();
        let forward_allowed = task.forwarded_from.is_empty();
        let mut next_forward_at = Instant::now();
        let mut task = task;

        loop {
            if *shutdown.borrow() {
                return Err(MatchingError::Gone);
            }
            let (id, mut rx) = match self.park_query(task) {
                Ok(()) => return Ok(None),
                Err(parked) => parked,
            };
            let sem = self.add_permits(forward_allowed);

            tokio::select! {
                biased;
                _ = &mut rx => return Ok(None),
                _ = shutdown.changed() => {
                    return match self.retract_query(id) {
                        Some(_task) => Err(MatchingError::Gone),
                        None => Ok(None),
                    };
                }
                permit = acquire_permit(sem, next_forward_at) => {
                    let Some(retracted) = self.retract_query(id) else {
                        drop(permit);
                        return Ok(None);
                    };
                    let fwdr = self.fwdr.as_ref().ok_or(MatchingError::Gone)?;
                    match fwdr.forward_query(&retracted, deadline).await {
                        Ok(response) => return Ok(Some(response)),
                        Err(err) => {
                            debug!(queue = %self.queue, error = %err, "query forward failed");
                            next_forward_at = Instant::now() + FORWARD_RETRY_BACKOFF;
                            task = retracted;
                        }
                    }
                }
                _ = sleep_until(deadline) => {
                    return match self.retract_query(id) {
                        Some(_task) => Err(MatchingError::DeadlineExceeded),
                        None => Ok(None),
                    };
                }
            }
        }
    }

    /// Wait for a task or query.
    pub async fn poll(
        &self,
        identity: &str,
        deadline: Instant,
        allow_forward: bool,
    ) -> Result<PolledItem, MatchingError> {
        self.poll_inner(identity, deadline, true, allow_forward).await
    }

    /// Wait for a query only.
    pub async fn poll_for_query(
        &self,
        identity: &str,
        deadline: Instant,
        allow_forward: bool,
    ) -> Result<PolledItem, MatchingError> {
        self.poll_inner(identity, deadline, false, allow_forward).await
    }

    async fn poll_inner(
        &self,
        identity: &str,
        deadline: Instant,
        accepts_tasks: bool,
        allow_forward: bool,
    ) -> Result<PolledItem, MatchingError> {
        let mut shutdown = self.shutdown.clone();

        loop {
            if *shutdown.borrow() {
                return Err(MatchingError::Gone);
            }
            let (id, mut rx) = match self.park_poller(accepts_tasks) {
                Ok(item) => return Ok(item),
                Err(parked) => parked,
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            let sem = if allow_forward && remaining > POLL_FORWARD_MARGIN * 2 {
                self.poll_permits()
            } else {
                None
            };

            tokio::select! {
                biased;
                item = &mut rx => {
                    return item.map_err(|_| MatchingError::Gone);
                }
                _ = shutdown.changed() => {
                    if !self.retract_poller(id) {
                        if let Ok(item) = rx.try_recv() {
                            return Ok(item);
                        }
                    }
                    return Err(MatchingError::Gone);
                }
                permit = acquire_permit(sem, Instant::now()) => {
                    if !self.retract_poller(id) {
                        drop(permit);
                        if let Ok(item) = rx.try_recv() {
                            return Ok(item);
                        }
                        continue;
                    }
                    let fwdr = self.fwdr.as_ref().ok_or(MatchingError::Gone)?;
                    let budget = deadline
                        .checked_sub(POLL_FORWARD_MARGIN)
                        .unwrap_or_else(Instant::now);
                    match fwdr.forward_poll(identity, budget).await {
                        Ok(Some(remote)) => return Ok(PolledItem::Remote(remote)),
                        Ok(None) => continue,
                        Err(err) => {
                            debug!(queue = %self.queue, error = %err, "poll forward failed");
                            drop(permit);
                            tokio::time::sleep(FORWARD_RETRY_BACKOFF.min(remaining)).await;
                        }
                    }
                }
                _ = sleep_until(deadline) => {
                    if !self.retract_poller(id) {
                        if let Ok(item) = rx.try_recv() {
                            return Ok(item);
                        }
                    }
                    return Err(MatchingError::DeadlineExceeded);
                }
            }
        }
    }

    /// Approximate number of pollers currently parked.
    pub fn waiting_pollers(&self) -> usize {
        self.state.lock().unwrap().pollers.len()
    }

    fn add_permits(&self, forward_allowed: bool) -> Option<Arc<Semaphore>> {
        match (&self.fwdr, forward_allowed) {
            (Some(fwdr), true) => Some(fwdr.add_permits()),
            _ => None,
        }
    }

    fn poll_permits(&self) -> Option<Arc<Semaphore>> {
        self.fwdr.as_ref().map(|f| f.poll_permits())
    }

    /// Claim a waiting poller or park the task, atomically.
    fn park_offer(&self, task: InternalTask) -> Result<(), (u64, oneshot::Receiver<()>)> {
        let mut state = self.state.lock().unwrap();
        let task = match state.claim_waiter(|p| p.accepts_tasks, PolledItem::Task(task)) {
            Ok(()) => return Ok(()),
            Err(PolledItem::Task(task)) => task,
            Err(_) => unreachable!("claim_waiter returns the offered item"),
        };
        let id = state.fresh_id();
        let (tx, rx) = oneshot::channel();
        state.task_offers.push_back(ParkedOffer { id, task, tx });
        Err((id, rx))
    }

    fn park_query(&self, task: QueryTask) -> Result<(), (u64, oneshot::Receiver<()>)> {
        let mut state = self.state.lock().unwrap();
        let task = match state.claim_waiter(|_| true, PolledItem::Query(task)) {
            Ok(()) => return Ok(()),
            Err(PolledItem::Query(task)) => task,
            Err(_) => unreachable!("claim_waiter returns the offered item"),
        };
        let id = state.fresh_id();
        let (tx, rx) = oneshot::channel();
        state.query_offers.push_back(ParkedQuery { id, task, tx });
        Err((id, rx))
    }

    /// Claim a parked offer or park this poller, atomically. Task offers are
    /// preferred over query offers for pollers that accept both.
    fn park_poller(
        &self,
        accepts_tasks: bool,
    ) -> Result<PolledItem, (u64, oneshot::Receiver<PolledItem>)> {
        let mut state = self.state.lock().unwrap();
        if accepts_tasks {
            while let Some(offer) = state.task_offers.pop_front() {
                if offer.tx.send(()).is_ok() {
                    return Ok(PolledItem::Task(offer.task));
                }
                // The offerer gave up; drop its copy, the durable row will be
                // redelivered.
            }
        }
        while let Some(query) = state.query_offers.pop_front() {
            if query.tx.send(()).is_ok() {
                return Ok(PolledItem::Query(query.task));
            }
        }
        let id = state.fresh_id();
        let (tx, rx) = oneshot::channel();
        state.pollers.push_back(WaitingPoller {
            id,
            accepts_tasks,
            tx,
        });
        Err((id, rx))
    }

    /// Take a parked offer back out. None means a poller already claimed it.
    fn retract_offer(&self, id: u64) -> Option<InternalTask> {
        let mut state = self.state.lock().unwrap();
        let pos = state.task_offers.iter().position(|o| o.id == id)?;
        state.task_offers.remove(pos).map(|o| o.task)
    }

    fn retract_query(&self, id: u64) -> Option<QueryTask> {
        let mut state = self.state.lock().unwrap();
        let pos = state.query_offers.iter().position(|q| q.id == id)?;
        state.query_offers.remove(pos).map(|q| q.task)
    }

    /// Remove a parked poller. False means an offer already claimed it.
    fn retract_poller(&self, id: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(pos) = state.pollers.iter().position(|p| p.id == id) else {
            return false;
        };
        state.pollers.remove(pos).is_some()
    }
}

/// Resolve to a forward permit once `not_before` has passed, or never when no
/// permit pool applies.
async fn acquire_permit(sem: Option<Arc<Semaphore>>, not_before: Instant) -> OwnedSemaphorePermit {
    let Some(sem) = sem else {
        return std::future::pending().await;
    };
    sleep_until(not_before).await;
    match sem.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => std::future::pending().await,
    }
}
