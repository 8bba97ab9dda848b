//! The checkpoint store contract.
//!
//! Stores keep an append-only log of checkpoints per thread. `put` is the
//! only coordination primitive in the system: it compare-and-swaps on the
//! thread's current latest checkpoint, so per-thread writes serialize
//! without any global lock.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::ChannelMap;
use crate::checkpoint::{Checkpoint, CheckpointId, CheckpointMeta};
use crate::thread::Thread;

/// Which checkpoint to load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckpointSelector {
    /// The thread's current latest.
    Latest,
    /// A specific checkpoint by id.
    Id(CheckpointId),
}

/// Cursor-based pagination over a thread's history, newest first.
#[derive(Clone, Debug)]
pub struct HistoryQuery {
    /// Only return checkpoints with sequence strictly less than this
    /// cursor. `None` starts from the newest.
    pub before: Option<u64>,
    /// Maximum number of checkpoints to return (clamped to 1..=200).
    pub limit: usize,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            before: None,
            limit: 50,
        }
    }
}

/// A checkpoint paired with its storage-assigned sequence cursor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointWithCursor {
    /// Append-order sequence within the thread (0 = root).
    pub cursor: u64,
    /// The checkpoint record.
    #[serde(flatten)]
    pub checkpoint: Checkpoint,
}

/// One page of history, newest first.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistoryPage {
    /// Checkpoints in descending sequence order.
    pub checkpoints: Vec<CheckpointWithCursor>,
    /// Whether older checkpoints remain.
    pub has_more: bool,
    /// Cursor of the oldest returned item; pass as `before` to continue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<u64>,
}

/// Pagination query for thread listings.
#[derive(Clone, Debug)]
pub struct ThreadListQuery {
    /// Number of items to skip.
    pub offset: usize,
    /// Maximum number of items to return (clamped to 1..=200).
    pub limit: usize,
    /// Filter by parent thread (subgraph-derived threads). `None` means no
    /// filtering.
    pub parent_thread_id: Option<String>,
}

impl Default for ThreadListQuery {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
            parent_thread_id: None,
        }
    }
}

/// Paginated thread list response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThreadListPage {
    /// Thread ids, sorted.
    pub items: Vec<String>,
    /// Total matching threads.
    pub total: usize,
    /// Whether more items remain past this page.
    pub has_more: bool,
}

/// Paginate an append-ordered checkpoint log in memory, newest first.
///
/// Cursor values are the 0-based append sequence, so cursors stay stable
/// as new checkpoints append.
pub fn paginate_history(log: &[Checkpoint], query: &HistoryQuery) -> HistoryPage {
    let limit = query.limit.clamp(1, 200);
    let end = query
        .before
        .map(|c| (c as usize).min(log.len()))
        .unwrap_or(log.len());

    let mut checkpoints = Vec::with_capacity(limit.min(end));
    for seq in (0..end).rev().take(limit) {
        checkpoints.push(CheckpointWithCursor {
            cursor: seq as u64,
            checkpoint: log[seq].clone(),
        });
    }

    let next_cursor = checkpoints.last().map(|c| c.cursor);
    let has_more = next_cursor.is_some_and(|c| c > 0);
    HistoryPage {
        checkpoints,
        has_more,
        next_cursor,
    }
}

/// Storage errors. `put` failures never leave a partially visible
/// checkpoint behind.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Thread not found.
    #[error("thread not found: {0}")]
    ThreadNotFound(String),

    /// Checkpoint not found within a thread.
    #[error("checkpoint not found: {thread_id}/{checkpoint_id}")]
    CheckpointNotFound {
        thread_id: String,
        checkpoint_id: CheckpointId,
    },

    /// Thread id already taken.
    #[error("thread already exists: {0}")]
    AlreadyExists(String),

    /// The caller's assumed parent is no longer the thread's latest.
    /// Reload latest and retry.
    #[error("stale parent for thread {thread_id}: latest is {latest:?}, caller assumed {assumed:?}")]
    ParentConflict {
        thread_id: String,
        latest: Option<CheckpointId>,
        assumed: Option<CheckpointId>,
    },

    /// IO error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid thread id (path traversal, control chars, etc.).
    #[error("invalid thread id: {0}")]
    InvalidId(String),
}

/// Durable, append-only checkpoint log keyed by `(thread_id, checkpoint_id)`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Create a thread record with no checkpoints yet.
    async fn create_thread(&self, thread: &Thread) -> Result<(), StoreError>;

    /// Load a thread record.
    async fn load_thread(&self, thread_id: &str) -> Result<Option<Thread>, StoreError>;

    /// Append a checkpoint atomically and return its id.
    ///
    /// `parent_id` must match the thread's current latest (`None` iff the
    /// thread has no checkpoints); otherwise the call fails with
    /// [`StoreError::ParentConflict`] and nothing is written. An empty
    /// channel map is a valid root snapshot.
    async fn put(
        &self,
        thread_id: &str,
        parent_id: Option<&CheckpointId>,
        channels: ChannelMap,
        meta: CheckpointMeta,
    ) -> Result<CheckpointId, StoreError>;

    /// Load a checkpoint. `Latest` on a thread with no checkpoints fails
    /// with [`StoreError::CheckpointNotFound`].
    async fn get(
        &self,
        thread_id: &str,
        selector: &CheckpointSelector,
    ) -> Result<Checkpoint, StoreError>;

    /// Page through a thread's history, newest first.
    async fn history(
        &self,
        thread_id: &str,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, StoreError>;

    /// List thread ids with pagination.
    async fn list_threads(&self, query: &ThreadListQuery) -> Result<ThreadListPage, StoreError>;

    /// Load the latest checkpoint if the thread has one. Convenience
    /// wrapper over `get`.
    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        match self.get(thread_id, &CheckpointSelector::Latest).await {
            Ok(ckpt) => Ok(Some(ckpt)),
            Err(StoreError::CheckpointNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Total checkpoints in a thread. Convenience wrapper over `history`.
    async fn checkpoint_count(&self, thread_id: &str) -> Result<usize, StoreError> {
        let page = self
            .history(
                thread_id,
                &HistoryQuery {
                    before: None,
                    limit: 1,
                },
            )
            .await?;
        Ok(page
            .checkpoints
            .first()
            .map(|c| c.cursor as usize + 1)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelMap;
    use crate::checkpoint::{gen_checkpoint_id, CheckpointMeta};

    fn log_of(n: usize) -> Vec<Checkpoint> {
        (0..n)
            .map(|_| Checkpoint {
                id: gen_checkpoint_id(),
                thread_id: "t1".into(),
                parent_id: None,
                channels: ChannelMap::new(),
                meta: CheckpointMeta::committed("router"),
            })
            .collect()
    }

    #[test]
    fn history_pages_newest_first() {
        let log = log_of(5);
        let page = paginate_history(
            &log,
            &HistoryQuery {
                before: None,
                limit: 2,
            },
        );
        let cursors: Vec<_> = page.checkpoints.iter().map(|c| c.cursor).collect();
        assert_eq!(cursors, vec![4, 3]);
        assert!(page.has_more);
        assert_eq!(page.next_cursor, Some(3));

        let rest = paginate_history(
            &log,
            &HistoryQuery {
                before: page.next_cursor,
                limit: 10,
            },
        );
        let cursors: Vec<_> = rest.checkpoints.iter().map(|c| c.cursor).collect();
        assert_eq!(cursors, vec![2, 1, 0]);
        assert!(!rest.has_more);
    }

    #[test]
    fn history_of_empty_log_is_empty() {
        let page = paginate_history(&[], &HistoryQuery::default());
        assert!(page.checkpoints.is_empty());
        assert!(!page.has_more);
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn history_cursors_stay_stable_as_log_grows() {
        let mut log = log_of(3);
        let original_ids: Vec<_> = log.iter().map(|c| c.id.clone()).collect();
        log.extend(log_of(2));

        let page = paginate_history(
            &log,
            &HistoryQuery {
                before: Some(3),
                limit: 10,
            },
        );
        let cursors: Vec<_> = page.checkpoints.iter().map(|c| c.cursor).collect();
        assert_eq!(cursors, vec![2, 1, 0]);
        assert_eq!(page.checkpoints[0].checkpoint.id, original_ids[2]);
    }
}
