//! The worker agent contract.
//!
//! A worker is a specialized handler the router invokes to advance a
//! thread by one step. It declares the channels it reads and the channels
//! it writes up front; the registry validates the declaration against the
//! schema, and the router rejects undeclared writes before persistence.
//!
//! Workers must be idempotent for identical input state: a crash between
//! invocation and checkpoint commit is recovered by re-invoking the same
//! worker against the same snapshot.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::channel::{ChannelError, ChannelMap};
use crate::decision::Decision;
use crate::delta::StateDelta;

/// A worker's declared capability: its identity and channel contract.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerSpec {
    /// Unique worker name.
    pub name: String,
    /// Ownership group. Channels are owned by groups, so workers sharing a
    /// group share write access. Defaults to the worker name.
    pub group: String,
    /// Channels this worker may read.
    pub reads: Vec<String>,
    /// Channels this worker may write. Each must be owned by `group`.
    pub writes: Vec<String>,
}

impl WorkerSpec {
    /// Create a spec; the group defaults to the worker name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            group: name.clone(),
            name,
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }

    /// Set the ownership group.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Declare accepted input channels.
    #[must_use]
    pub fn with_reads<I, S>(mut self, reads: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reads = reads.into_iter().map(Into::into).collect();
        self
    }

    /// Declare owned output channels.
    #[must_use]
    pub fn with_writes<I, S>(mut self, writes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.writes = writes.into_iter().map(Into::into).collect();
        self
    }
}

/// Read-only view of the current snapshot, restricted to the channels the
/// worker declared as inputs.
///
/// Isolation is the default: anything a worker wants to see must be an
/// explicit declared read.
#[derive(Clone, Copy, Debug)]
pub struct StateView<'a> {
    channels: &'a ChannelMap,
    allowed: &'a [String],
}

impl<'a> StateView<'a> {
    /// Build a view over `channels` limited to `allowed`.
    pub fn new(channels: &'a ChannelMap, allowed: &'a [String]) -> Self {
        Self { channels, allowed }
    }

    /// Read a declared channel. Reading a channel outside the declared
    /// inputs is an error, not an empty value.
    pub fn get(&self, channel: &str) -> Result<Option<&'a Value>, ChannelError> {
        if !self.allowed.iter().any(|c| c == channel) {
            return Err(ChannelError::UndeclaredRead(channel.to_string()));
        }
        Ok(self.channels.get(channel))
    }

    /// Read a declared channel as a string slice.
    pub fn get_str(&self, channel: &str) -> Result<Option<&'a str>, ChannelError> {
        Ok(self.get(channel)?.and_then(Value::as_str))
    }

    /// Read a declared channel as a bool.
    pub fn get_bool(&self, channel: &str) -> Result<Option<bool>, ChannelError> {
        Ok(self.get(channel)?.and_then(Value::as_bool))
    }

    /// Read a declared channel as an i64.
    pub fn get_i64(&self, channel: &str) -> Result<Option<i64>, ChannelError> {
        Ok(self.get(channel)?.and_then(Value::as_i64))
    }
}

/// Per-invocation context handed to a worker.
///
/// `step_id` is the id of the checkpoint that recorded the routing
/// decision for this step. It is stable across retries and crash
/// recovery, which makes `(thread_id, step_id)` the natural idempotency
/// key for external side effects issued from this step.
#[derive(Clone, Copy, Debug)]
pub struct StepContext<'a> {
    /// The thread being advanced.
    pub thread_id: &'a str,
    /// Checkpoint id of the recorded routing decision.
    pub step_id: &'a str,
    /// Read-only view over the declared input channels.
    pub view: StateView<'a>,
}

/// A worker's request to pause the thread for an external decision.
///
/// The proposed delta is persisted with the pending checkpoint but not
/// applied; `approve` later applies exactly this delta.
#[derive(Clone, Debug, PartialEq)]
pub struct SuspendRequest {
    /// The delta to apply if the decision is `approve`.
    pub proposed: StateDelta,
    /// Human-readable reason shown to the decider.
    pub reason: String,
    /// Set when the suspension propagated up from a subgraph thread.
    pub sub_thread_id: Option<String>,
}

impl SuspendRequest {
    /// Suspend with a proposed delta and a reason.
    pub fn new(proposed: StateDelta, reason: impl Into<String>) -> Self {
        Self {
            proposed,
            reason: reason.into(),
            sub_thread_id: None,
        }
    }

    /// Tag the suspension with the subgraph thread it came from.
    #[must_use]
    pub fn with_sub_thread(mut self, sub_thread_id: impl Into<String>) -> Self {
        self.sub_thread_id = Some(sub_thread_id.into());
        self
    }
}

/// What a worker invocation produced.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerOutcome {
    /// A state delta to merge and commit.
    Delta(StateDelta),
    /// A request to halt until an external decision arrives.
    Suspend(SuspendRequest),
}

/// Typed worker failures. The router retries transient errors with backoff
/// and moves the thread to the failure stage on permanent ones.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Safe to retry against the same input snapshot.
    #[error("transient worker failure: {message}")]
    Transient { message: String },

    /// Aborts the step; the thread transitions to the failure stage with
    /// all prior checkpoints preserved.
    #[error("permanent worker failure: {message}")]
    Permanent { message: String },

    /// A read outside the declared input channels.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl WorkerError {
    /// Build a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        WorkerError::Transient {
            message: message.into(),
        }
    }

    /// Build a permanent error.
    pub fn permanent(message: impl Into<String>) -> Self {
        WorkerError::Permanent {
            message: message.into(),
        }
    }

    /// Whether the router may retry this failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, WorkerError::Transient { .. })
    }
}

/// A specialized handler invoked by the router to advance the state
/// machine by one step.
#[async_trait]
pub trait Worker: Send + Sync {
    /// The worker's declared channel contract.
    fn spec(&self) -> &WorkerSpec;

    /// Execute one step against a read-only view of the current state.
    async fn invoke(&self, ctx: StepContext<'_>) -> Result<WorkerOutcome, WorkerError>;

    /// Forward an external decision into this worker's private thread.
    ///
    /// Only meaningful for workers that suspend on behalf of a nested
    /// state machine; plain workers have no sub-thread to forward to.
    async fn forward_decision(
        &self,
        parent_thread_id: &str,
        decision: Decision,
    ) -> Result<(), WorkerError> {
        let _ = (parent_thread_id, decision);
        Err(WorkerError::permanent(
            "worker has no sub-thread to forward decisions to",
        ))
    }
}
