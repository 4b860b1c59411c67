//! Task records and the in-memory task flowing through the matcher.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use uuid::Uuid;

use crate::error::MatchingError;

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Descriptor of the history event that scheduled a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub namespace_id: Uuid,
    pub workflow_id: String,
    pub run_id: String,
    pub schedule_id: i64,
    pub created_at_ms: i64,
    /// Epoch ms after which the task must not be delivered from the backlog.
    /// 0 means no expiry.
    pub expiry_ms: i64,
}

impl TaskInfo {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiry_ms > 0 && self.expiry_ms < now_ms
    }
}

/// A durable task row, keyed by queue identity + task_id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub task_id: i64,
    pub info: TaskInfo,
}

/// Where an in-memory task came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSource {
    /// Produced by the history engine, not yet persisted.
    History,
    /// Read back from durable storage.
    Backlog,
}

/// Single-shot callback fired with the task's terminal outcome.
pub type TaskCompletion = Box<dyn FnOnce(Result<(), MatchingError>) + Send + Sync>;

/// A task in flight through the matcher.
///
/// Backlog tasks carry a completion callback that acks the durable row on
/// delivery; dropping an unfinished task fires the callback with `Cancelled`
/// so the owner can redeliver. Fresh tasks have no durable row yet and no
/// callback.
pub struct InternalTask {
    pub info: TaskInfo,
    pub task_id: Option<i64>,
    pub source: TaskSource,
    pub forwarded_from: String,
    completion: Option<TaskCompletion>,
}

impl InternalTask {
    pub fn fresh(info: TaskInfo, forwarded_from: String) -> Self {
        Self {
            info,
            task_id: None,
            source: TaskSource::History,
            forwarded_from,
            completion: None,
        }
    }

    pub fn from_backlog(record: TaskRecord, completion: TaskCompletion) -> Self {
        Self {
            info: record.info,
            task_id: Some(record.task_id),
            source: TaskSource::Backlog,
            forwarded_from: String::new(),
            completion: Some(completion),
        }
    }

    pub fn is_forwarded(&self) -> bool {
        !self.forwarded_from.is_empty()
    }

    /// Report the terminal outcome. Idempotent; later calls are no-ops.
    pub fn finish(&mut self, outcome: Result<(), MatchingError>) {
        if let Some(done) = self.completion.take() {
            done(outcome);
        }
    }
}

impl Drop for InternalTask {
    fn drop(&mut self) {
        if let Some(done) = self.completion.take() {
            done(Err(MatchingError::Cancelled));
        }
    }
}

impl fmt::Debug for InternalTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalTask")
            .field("workflow_id", &self.info.workflow_id)
            .field("schedule_id", &self.info.schedule_id)
            .field("task_id", &self.task_id)
            .field("source", &self.source)
            .field("forwarded_from", &self.forwarded_from)
            .finish()
    }
}

/// A synchronous query riding the matcher's query channel. Never persisted.
#[derive(Debug, Clone)]
pub struct QueryTask {
    pub query_id: String,
    pub payload: Bytes,
    pub forwarded_from: String,
}

/// What a poller receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolledTask {
    Task {
        info: TaskInfo,
        /// None when the task was sync-matched before ever being persisted.
        task_id: Option<i64>,
        forwarded_from: String,
    },
    Query {
        query_id: String,
        payload: Bytes,
        forwarded_from: String,
    },
}
