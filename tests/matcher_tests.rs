
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use switchyard::config::ForwarderConfig;
use switchyard::error::MatchingError;
use switchyard::forwarder::{Forwarder, MatchingClient};
use switchyard::matcher::{OfferOutcome, PolledItem, TaskMatcher};
use switchyard::queue_id::QueueId;
use switchyard::task::{InternalTask, PolledTask, QueryTask, TaskInfo, TaskRecord};

use test_helpers::*;

/// Fold a matched item into the poll response the way a queue manager does,
/// firing completions for locally matched tasks.
fn to_polled(item: PolledItem) -> PolledTask {
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

/// Stand-in for the parent partition: records forwarded calls and routes
/// them into a root matcher, the way the engine's in-process client would.
struct FakeParent {
    root: Arc<TaskMatcher>,
    poll_sig: Arc<Notify>,
    fail_adds: AtomicBool,
    fail_adds_once: AtomicBool,
    fail_queries: AtomicBool,
    adds: Mutex<Vec<(QueueId, String)>>,
    queries: Mutex<Vec<(QueueId, String)>>,
    polls: Mutex<Vec<(QueueId, String)>>,
}

impl FakeParent {
    fn new(root: Arc<TaskMatcher>) -> Arc<Self> {
        Arc::new(Self {
            root,
            poll_sig: Arc::new(Notify::new()),
            fail_adds: AtomicBool::new(false),
            fail_adds_once: AtomicBool::new(false),
            fail_queries: AtomicBool::new(false),
            adds: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
            polls: Mutex::new(Vec::new()),
        })
    }

    fn recorded_adds(&self) -> Vec<(QueueId, String)> {
        self.adds.lock().unwrap().clone()
    }

    fn recorded_queries(&self) -> Vec<(QueueId, String)> {
        self.queries.lock().unwrap().clone()
    }

    fn recorded_polls(&self) -> Vec<(QueueId, String)> {
        self.polls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MatchingClient for FakeParent {
    async fn add_task(
        &self,
        queue: &QueueId,
        info: TaskInfo,
        forwarded_from: &str,
        timeout: Duration,
    ) -> Result<(), MatchingError> {
        self.adds
            .lock()
            .unwrap()
            .push((queue.clone(), forwarded_from.to_string()));
        self.poll_sig.notify_one();
        if self.fail_adds_once.swap(false, Ordering::SeqCst)
            || self.fail_adds.load(Ordering::SeqCst)
        {
            return Err(MatchingError::Throttled);
        }
        // Give a poller a beat to arrive, like a real network hop would.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let task = InternalTask::fresh(info, forwarded_from.to_string());
        match self
            .root
            .offer(task, Instant::now() + timeout)
            .await?
        {
            OfferOutcome::Matched => Ok(()),
            OfferOutcome::NotMatched(_) => Err(MatchingError::DeadlineExceeded),
        }
    }

    async fn poll_task(
        &self,
        queue: &QueueId,
        poller_identity: &str,
        forwarded_from: &str,
        timeout: Duration,
    ) -> Result<Option<PolledTask>, MatchingError> {
        self.polls
            .lock()
            .unwrap()
            .push((queue.clone(), forwarded_from.to_string()));
        match self
            .root
            .poll(poller_identity, Instant::now() + timeout, false)
            .await
        {
            Ok(item) => Ok(Some(to_polled(item))),
            Err(MatchingError::DeadlineExceeded) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn query_workflow(
        &self,
        queue: &QueueId,
        payload: Bytes,
        forwarded_from: &str,
        timeout: Duration,
    ) -> Result<Bytes, MatchingError> {
        self.queries
            .lock()
            .unwrap()
            .push((queue.clone(), forwarded_from.to_string()));
        self.poll_sig.notify_one();
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(MatchingError::Throttled);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        let task = QueryTask {
            query_id: "fwd-query".to_string(),
            payload,
            forwarded_from: forwarded_from.to_string(),
        };
        self.root
            .offer_query(task, Instant::now() + timeout)
            .await?;
        // The root-side worker answered out of band; proxy the bytes back.
        Ok(Bytes::from_static(b"answer"))
    }
}

struct MatcherPair {
    child: Arc<TaskMatcher>,
    root: Arc<TaskMatcher>,
    parent: Arc<FakeParent>,
    _shutdown: watch::Sender<bool>,
}

/// Child partition `tl0/1` forwarding to a root `tl0` matcher, mirroring a
/// two-level partition tree within one process.
fn matcher_pair(fwdr_cfg: ForwarderConfig) -> MatcherPair {
    let ns = Uuid::new_v4();
    let child_queue = decision_queue(ns, "tl0/1");
    let root_queue = decision_queue(ns, "tl0");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let root = TaskMatcher::new(root_queue, None, shutdown_rx.clone());
    let parent = FakeParent::new(root.clone());
    let fwdr = Forwarder::new(&fwdr_cfg, child_queue.clone(), parent.clone())
        .expect("child partition has a parent");
    let child = TaskMatcher::new(child_queue, Some(fwdr), shutdown_rx);

    MatcherPair {
        child,
        root,
        parent,
        _shutdown: shutdown_tx,
    }
}

fn local_matcher() -> (Arc<TaskMatcher>, watch::Sender<bool>) {
    let queue = decision_queue(Uuid::new_v4(), "tl0");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    (TaskMatcher::new(queue, None, shutdown_rx), shutdown_tx)
}

fn backlog_task(info: TaskInfo, task_id: i64, completed: &Arc<AtomicBool>) -> InternalTask {
    let completed = Arc::clone(completed);
    InternalTask::from_backlog(
        TaskRecord { task_id, info },
        Box::new(move |outcome| {
            if outcome.is_ok() {
                completed.store(true, Ordering::SeqCst);
            }
        }),
    )
}

#[tokio::test]
async fn local_sync_match() {
    with_timeout!(10_000, {
        let (matcher, _shutdown) = local_matcher();
        let info = random_task_info();
        let expected_workflow = info.workflow_id.clone();

        let poller = {
            let matcher = matcher.clone();
            tokio::spawn(async move {
                matcher
                    .poll("poller-1", Instant::now() + Duration::from_secs(1), true)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let outcome = matcher
            .offer(
                InternalTask::fresh(info, String::new()),
                Instant::now() + Duration::from_secs(1),
            )
            .await
            .expect("offer");
        assert!(matches!(outcome, OfferOutcome::Matched));

        let item = poller.await.expect("join").expect("poll");
        match to_polled(item) {
            PolledTask::Task {
                info,
                task_id,
                forwarded_from,
            } => {
                assert_eq!(info.workflow_id, expected_workflow);
                assert_eq!(task_id, None);
                assert!(forwarded_from.is_empty());
            }
            other => panic!("expected a task, got {:?}", other),
        }
    })
}

#[tokio::test]
async fn remote_sync_match_fresh_task() {
    with_timeout!(10_000, {
        let pair = matcher_pair(ForwarderConfig::default());

        // Poller arrives at the child once the forward is in flight; its
        // poll rides up to the root.
        let poller = {
            let child = pair.child.clone();
            let sig = pair.parent.poll_sig.clone();
            tokio::spawn(async move {
                sig.notified().await;
                child
                    .poll("poller-1", Instant::now() + Duration::from_secs(2), true)
                    .await
            })
        };

        let outcome = pair
            .child
            .offer(
                InternalTask::fresh(random_task_info(), String::new()),
                Instant::now() + Duration::from_secs(2),
            )
            .await
            .expect("offer");
        assert!(matches!(outcome, OfferOutcome::Matched));

        let item = poller.await.expect("join").expect("poll");
        match to_polled(item) {
            PolledTask::Task { forwarded_from, .. } => {
                assert_eq!(forwarded_from, "tl0/1");
            }
            other => panic!("expected a task, got {:?}", other),
        }

        let adds = pair.parent.recorded_adds();
        assert_eq!(adds.len(), 1);
        assert_eq!(adds[0].0.name.as_str(), "tl0");
        assert_eq!(adds[0].1, "tl0/1");
        let polls = pair.parent.recorded_polls();
        assert_eq!(polls.len(), 1);
        assert_eq!(polls[0].1, "tl0/1");
    })
}

#[tokio::test]
async fn remote_sync_match_blocks_for_backlog_task() {
    with_timeout!(10_000, {
        let pair = matcher_pair(ForwarderConfig::default());
        let completed = Arc::new(AtomicBool::new(false));

        let poller = {
            let child = pair.child.clone();
            let sig = pair.parent.poll_sig.clone();
            tokio::spawn(async move {
                sig.notified().await;
                // Delay the poll; a backlog offer must keep blocking.
                tokio::time::sleep(Duration::from_millis(10)).await;
                child
                    .poll("poller-1", Instant::now() + Duration::from_secs(2), true)
                    .await
            })
        };

        let task = backlog_task(random_task_info(), 42, &completed);
        pair.child
            .must_offer(task, Instant::now() + Duration::from_secs(4))
            .await
            .expect("must_offer");

        let item = poller.await.expect("join").expect("poll");
        assert!(matches!(to_polled(item), PolledTask::Task { .. }));
        assert!(completed.load(Ordering::SeqCst));
    })
}

#[tokio::test]
async fn sync_match_failure_falls_back_to_not_matched() {
    with_timeout!(10_000, {
        let pair = matcher_pair(ForwarderConfig::default());
        pair.parent.fail_adds.store(true, Ordering::SeqCst);

        let started = Instant::now();
        let outcome = pair
            .child
            .offer(
                InternalTask::fresh(random_task_info(), String::new()),
                Instant::now() + Duration::from_secs(2),
            )
            .await
            .expect("offer");
        assert!(matches!(outcome, OfferOutcome::NotMatched(_)));
        // The failed forward resolves the offer well before the deadline.
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(pair.parent.recorded_adds().len(), 1);
    })
}

#[tokio::test]
async fn forwarded_task_is_never_forwarded_again() {
    with_timeout!(10_000, {
        let pair = matcher_pair(ForwarderConfig::default());

        let outcome = pair
            .child
            .offer(
                InternalTask::fresh(random_task_info(), "tl0/21".to_string()),
                Instant::now() + Duration::from_millis(300),
            )
            .await
            .expect("offer");
        assert!(matches!(outcome, OfferOutcome::NotMatched(_)));
        assert!(pair.parent.recorded_adds().is_empty());
    })
}

#[tokio::test]
async fn query_local_sync_match() {
    with_timeout!(10_000, {
        let (matcher, _shutdown) = local_matcher();

        let poller = {
            let matcher = matcher.clone();
            tokio::spawn(async move {
                matcher
                    .poll_for_query("poller-1", Instant::now() + Duration::from_secs(1), true)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let response = matcher
            .offer_query(
                QueryTask {
                    query_id: "q1".to_string(),
                    payload: Bytes::from_static(b"state?"),
                    forwarded_from: String::new(),
                },
                Instant::now() + Duration::from_secs(1),
            )
            .await
            .expect("offer_query");
        assert!(response.is_none());

        let item = poller.await.expect("join").expect("poll");
        match to_polled(item) {
            PolledTask::Query {
                query_id, payload, ..
            } => {
                assert_eq!(query_id, "q1");
                assert_eq!(payload, Bytes::from_static(b"state?"));
            }
            other => panic!("expected a query, got {:?}", other),
        }
    })
}

#[tokio::test]
async fn query_remote_sync_match() {
    with_timeout!(10_000, {
        let pair = matcher_pair(ForwarderConfig::default());

        let poller = {
            let child = pair.child.clone();
            let sig = pair.parent.poll_sig.clone();
            tokio::spawn(async move {
                sig.notified().await;
                child
                    .poll_for_query("poller-1", Instant::now() + Duration::from_secs(2), true)
                    .await
            })
        };

        let response = pair
            .child
            .offer_query(
                QueryTask {
                    query_id: "q1".to_string(),
                    payload: Bytes::from_static(b"state?"),
                    forwarded_from: String::new(),
                },
                Instant::now() + Duration::from_secs(2),
            )
            .await
            .expect("offer_query");
        assert_eq!(response, Some(Bytes::from_static(b"answer")));

        let item = poller.await.expect("join").expect("poll");
        assert!(matches!(to_polled(item), PolledTask::Query { .. }));

        let queries = pair.parent.recorded_queries();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].0.name.as_str(), "tl0");
        assert_eq!(queries[0].1, "tl0/1");
    })
}

#[tokio::test]
async fn query_remote_error_falls_back_to_local_match() {
    with_timeout!(10_000, {
        // No forwarded polls: the poller must stay local.
        let cfg = ForwarderConfig {
            max_outstanding_polls: 0,
            ..ForwarderConfig::default()
        };
        let pair = matcher_pair(cfg);
        pair.parent.fail_queries.store(true, Ordering::SeqCst);

        let poller = {
            let child = pair.child.clone();
            let sig = pair.parent.poll_sig.clone();
            tokio::spawn(async move {
                sig.notified().await;
                tokio::time::sleep(Duration::from_millis(10)).await;
                child
                    .poll_for_query("poller-1", Instant::now() + Duration::from_secs(2), true)
                    .await
            })
        };

        let response = pair
            .child
            .offer_query(
                QueryTask {
                    query_id: "q1".to_string(),
                    payload: Bytes::from_static(b"state?"),
                    forwarded_from: String::new(),
                },
                Instant::now() + Duration::from_secs(2),
            )
            .await
            .expect("offer_query");
        assert!(response.is_none());

        let item = poller.await.expect("join").expect("poll");
        assert!(matches!(to_polled(item), PolledTask::Query { .. }));
        assert!(!pair.parent.recorded_queries().is_empty());
    })
}

#[tokio::test]
async fn must_offer_local_match() {
    with_timeout!(10_000, {
        let (matcher, _shutdown) = local_matcher();
        let completed = Arc::new(AtomicBool::new(false));

        let poller = {
            let matcher = matcher.clone();
            tokio::spawn(async move {
                matcher
                    .poll("poller-1", Instant::now() + Duration::from_secs(1), true)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let task = backlog_task(random_task_info(), 7, &completed);
        matcher
            .must_offer(task, Instant::now() + Duration::from_secs(1))
            .await
            .expect("must_offer");

        let item = poller.await.expect("join").expect("poll");
        match to_polled(item) {
            PolledTask::Task { task_id, .. } => assert_eq!(task_id, Some(7)),
            other => panic!("expected a task, got {:?}", other),
        }
        assert!(completed.load(Ordering::SeqCst));
    })
}

#[tokio::test]
async fn must_offer_retries_forward_after_failure() {
    with_timeout!(10_000, {
        let pair = matcher_pair(ForwarderConfig::default());
        pair.parent.fail_adds_once.store(true, Ordering::SeqCst);
        let completed = Arc::new(AtomicBool::new(false));

        // Root-side poller, reached through the child's forwarded poll.
        let poller = {
            let child = pair.child.clone();
            tokio::spawn(async move {
                child
                    .poll("poller-1", Instant::now() + Duration::from_secs(4), true)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let task = backlog_task(random_task_info(), 99, &completed);
        pair.child
            .must_offer(task, Instant::now() + Duration::from_secs(4))
            .await
            .expect("must_offer");

        assert!(pair.parent.recorded_adds().len() >= 2);
        assert!(completed.load(Ordering::SeqCst));
        let _ = poller.await;
    })
}

#[tokio::test]
async fn remote_poll_returns_parent_task() {
    with_timeout!(10_000, {
        let pair = matcher_pair(ForwarderConfig::default());
        let info = random_task_info();
        let expected_workflow = info.workflow_id.clone();

        // Park a task at the root; the child's forwarded poll picks it up.
        let root = pair.root.clone();
        let offerer = tokio::spawn(async move {
            root.must_offer(
                InternalTask::fresh(info, String::new()),
                Instant::now() + Duration::from_secs(2),
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let item = pair
            .child
            .poll("poller-1", Instant::now() + Duration::from_secs(2), true)
            .await
            .expect("poll");
        match to_polled(item) {
            PolledTask::Task { info, .. } => assert_eq!(info.workflow_id, expected_workflow),
            other => panic!("expected a task, got {:?}", other),
        }
        assert_eq!(pair.parent.recorded_polls().len(), 1);
        let _ = offerer.await;
    })
}

#[tokio::test]
async fn poll_times_out_empty() {
    with_timeout!(10_000, {
        let (matcher, _shutdown) = local_matcher();
        let err = matcher
            .poll("poller-1", Instant::now() + Duration::from_millis(100), true)
            .await
            .expect_err("no task to match");
        assert!(matches!(err, MatchingError::DeadlineExceeded));
    })
}

#[tokio::test]
async fn shutdown_rejects_parked_pollers() {
    with_timeout!(10_000, {
        let (matcher, shutdown) = local_matcher();
        let poller = {
            let matcher = matcher.clone();
            tokio::spawn(async move {
                matcher
                    .poll("poller-1", Instant::now() + Duration::from_secs(5), true)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.send(true).expect("send shutdown");

        let err = poller.await.expect("join").expect_err("shutdown");
        assert!(matches!(err, MatchingError::Gone));
    })
}
