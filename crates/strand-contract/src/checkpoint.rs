//! Immutable, parent-linked state snapshots.

use serde::{Deserialize, Serialize};

use crate::channel::ChannelMap;
use crate::delta::StateDelta;

/// Unique identifier for a checkpoint.
pub type CheckpointId = String;

/// Generate a checkpoint id.
pub fn gen_checkpoint_id() -> CheckpointId {
    format!("ckpt_{}", uuid::Uuid::new_v4().simple())
}

/// Generate a thread id.
pub fn gen_thread_id() -> String {
    format!("thread_{}", uuid::Uuid::new_v4().simple())
}

/// Current wall-clock time as unix epoch milliseconds.
pub fn current_unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Whether a checkpoint is settled or awaiting an external decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointStatus {
    /// A settled step.
    Committed,
    /// A suspended step: the proposed delta has not been applied and the
    /// thread makes no forward progress until a decision arrives.
    Pending {
        /// The delta the suspending worker proposed.
        proposed: StateDelta,
        /// Human-readable reason for the suspension.
        reason: String,
        /// Set when the suspension bubbled up from a subgraph; decisions
        /// are forwarded into that thread.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sub_thread_id: Option<String>,
    },
}

/// Metadata recorded alongside every snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Creation time, unix epoch milliseconds.
    pub created_at_ms: u64,
    /// Identity of the writer (worker name or `router`).
    pub writer: String,
    /// Committed or pending.
    pub status: CheckpointStatus,
}

impl CheckpointMeta {
    /// Metadata for a settled checkpoint written by `writer`.
    pub fn committed(writer: impl Into<String>) -> Self {
        Self {
            created_at_ms: current_unix_millis(),
            writer: writer.into(),
            status: CheckpointStatus::Committed,
        }
    }

    /// Metadata for a suspended checkpoint carrying a proposed delta.
    pub fn pending(
        writer: impl Into<String>,
        proposed: StateDelta,
        reason: impl Into<String>,
        sub_thread_id: Option<String>,
    ) -> Self {
        Self {
            created_at_ms: current_unix_millis(),
            writer: writer.into(),
            status: CheckpointStatus::Pending {
                proposed,
                reason: reason.into(),
                sub_thread_id,
            },
        }
    }
}

/// An immutable snapshot of a thread's channels after one step.
///
/// Every non-root checkpoint has exactly one parent; following parent
/// pointers always reaches a unique root. Checkpoints are never mutated
/// or deleted, only superseded by children.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique id.
    pub id: CheckpointId,
    /// Owning thread.
    pub thread_id: String,
    /// Parent checkpoint; `None` only for a root. A time-travel fork's
    /// root points at a checkpoint in the source thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<CheckpointId>,
    /// Ordered channel snapshot.
    pub channels: ChannelMap,
    /// Timestamp, writer identity, and status.
    pub meta: CheckpointMeta,
}

impl Checkpoint {
    /// Whether this checkpoint has no parent.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Whether this checkpoint is awaiting a decision.
    pub fn is_pending(&self) -> bool {
        matches!(self.meta.status, CheckpointStatus::Pending { .. })
    }

    /// The pending suspension details, if any.
    pub fn pending(&self) -> Option<(&StateDelta, &str, Option<&str>)> {
        match &self.meta.status {
            CheckpointStatus::Pending {
                proposed,
                reason,
                sub_thread_id,
            } => Some((proposed, reason.as_str(), sub_thread_id.as_deref())),
            CheckpointStatus::Committed => None,
        }
    }
}
