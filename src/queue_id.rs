//! Queue identity and partition-tree naming.
//!
//! A queue name of the form `base/N` (N >= 1) is partition N of `base`; the
//! unsuffixed `base` is the root (partition 0). Partitions form a tree: the
//! parent of partition N is partition N / fanout, so with fanout 20 the
//! partitions 1..=19 hang directly off the root.

use std::fmt;

use uuid::Uuid;

use crate::error::MatchingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Decision,
    Activity,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Decision => write!(f, "decision"),
            QueueKind::Activity => write!(f, "activity"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueueSubKind {
    #[default]
    Normal,
    Sticky,
}

impl fmt::Display for QueueSubKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueSubKind::Normal => write!(f, "normal"),
            QueueSubKind::Sticky => write!(f, "sticky"),
        }
    }
}

/// A queue name, possibly carrying a partition suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueName {
    name: String,
    base_len: usize,
    partition: u32,
}

impl QueueName {
    pub fn new(name: &str) -> Result<Self, MatchingError> {
        if name.is_empty() {
            return Err(MatchingError::InvalidArgument(
                "queue name must not be empty".to_string(),
            ));
        }
        let (base_len, partition) = match name.rsplit_once('/') {
            Some((base, suffix)) if !base.is_empty() => match suffix.parse::<u32>() {
                Ok(n) if n >= 1 => (base.len(), n),
                _ => (name.len(), 0),
            },
            _ => (name.len(), 0),
        };
        Ok(Self {
            name: name.to_string(),
            base_len,
            partition,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// The unsuffixed root name.
    pub fn base(&self) -> &str {
        &self.name[..self.base_len]
    }

    /// Partition number; 0 is the root.
    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn is_root(&self) -> bool {
        self.partition == 0
    }

    /// Name of the parent partition in a tree with the given fanout, or None
    /// for the root.
    pub fn parent(&self, fanout: u32) -> Option<QueueName> {
        if self.partition == 0 {
            return None;
        }
        let parent = self.partition / fanout.max(1);
        let name = if parent == 0 {
            self.base().to_string()
        } else {
            format!("{}/{}", self.base(), parent)
        };
        // The parent string is never empty, so construction cannot fail.
        QueueName::new(&name).ok()
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Unique key of a task queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueId {
    pub namespace_id: Uuid,
    pub name: QueueName,
    pub kind: QueueKind,
    pub sub_kind: QueueSubKind,
}

impl QueueId {
    pub fn new(
        namespace_id: Uuid,
        name: &str,
        kind: QueueKind,
        sub_kind: QueueSubKind,
    ) -> Result<Self, MatchingError> {
        Ok(Self {
            namespace_id,
            name: QueueName::new(name)?,
            kind,
            sub_kind,
        })
    }

    /// Identity of this queue's parent partition, if any. Sticky queues are
    /// bound to one worker and never participate in the partition tree.
    pub fn parent(&self, fanout: u32) -> Option<QueueId> {
        if self.sub_kind == QueueSubKind::Sticky {
            return None;
        }
        let parent = self.name.parent(fanout)?;
        Some(QueueId {
            namespace_id: self.namespace_id,
            name: parent,
            kind: self.kind,
            sub_kind: self.sub_kind,
        })
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}:{}:{}",
            self.namespace_id, self.name, self.kind, self.sub_kind
        )
    }
}
