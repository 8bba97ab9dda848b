//! External decisions on suspended checkpoints, and the status types the
//! orchestrator exposes.

use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointId;
use crate::delta::StateDelta;

/// An external decision routed to a suspended checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    /// Apply exactly the previously proposed delta.
    Approve,
    /// Apply a replacement delta instead (revalidated against the
    /// suspending worker's channel contract).
    Edit { delta: StateDelta },
    /// Record the rejection and leave state otherwise unchanged.
    Reject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Decision {
    /// Short label for logs and decision records.
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Edit { .. } => "edit",
            Decision::Reject { .. } => "reject",
        }
    }
}

/// Current externally visible state of a thread.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThreadStatus {
    /// Thread id.
    pub thread_id: String,
    /// Current stage name.
    pub stage: String,
    /// Whether the thread is halted on a suspended checkpoint.
    pub pending_approval: bool,
}

/// Summary returned by `submit_event` and the resume/decide paths.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateSummary {
    /// Thread id.
    pub thread_id: String,
    /// Latest checkpoint after the call.
    pub checkpoint_id: CheckpointId,
    /// Current stage name.
    pub stage: String,
    /// Whether the thread is halted on a suspended checkpoint.
    pub pending_approval: bool,
}
