//! Thread records: one independent conversation instance per id.

use serde::{Deserialize, Serialize};

use crate::checkpoint::{current_unix_millis, CheckpointId};

/// Where a time-travel fork came from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForkedFrom {
    /// Source thread.
    pub thread_id: String,
    /// The historical checkpoint the fork is rooted at.
    pub checkpoint_id: CheckpointId,
}

/// A conversation thread: id, creation time, lineage, and a pointer to the
/// latest checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    /// Stable thread id.
    pub id: String,
    /// Creation time, unix epoch milliseconds.
    pub created_at_ms: u64,
    /// Parent thread for subgraph-derived threads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_thread_id: Option<String>,
    /// Set on threads created by time travel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_from: Option<ForkedFrom>,
    /// Latest checkpoint, maintained by the store on every `put`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest: Option<CheckpointId>,
}

impl Thread {
    /// Create a thread record with no checkpoints.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at_ms: current_unix_millis(),
            parent_thread_id: None,
            forked_from: None,
            latest: None,
        }
    }

    /// Mark this thread as derived from a parent thread (subgraphs).
    #[must_use]
    pub fn with_parent_thread(mut self, parent: impl Into<String>) -> Self {
        self.parent_thread_id = Some(parent.into());
        self
    }

    /// Mark this thread as a time-travel fork.
    #[must_use]
    pub fn with_forked_from(
        mut self,
        thread_id: impl Into<String>,
        checkpoint_id: impl Into<CheckpointId>,
    ) -> Self {
        self.forked_from = Some(ForkedFrom {
            thread_id: thread_id.into(),
            checkpoint_id: checkpoint_id.into(),
        });
        self
    }
}
