//! Shared contracts for the strand conversation orchestrator.
//!
//! This crate defines the domain model every other strand crate builds on:
//! named state channels with declared merge policies and owners, immutable
//! parent-linked checkpoints, the worker agent contract, the checkpoint
//! store contract, and the traits for external collaborators (classifier,
//! completion, retrieval, side effects).

pub mod boundary;
pub mod channel;
pub mod checkpoint;
pub mod decision;
pub mod delta;
pub mod storage;
pub mod thread;
pub mod worker;

pub use boundary::{
    Classification, ClassifyError, ClassifyRequest, CompletionClient, CompletionError, EffectCall,
    EffectError, EffectOutcome, Fragment, FragmentStream, RetrievalError, Retriever,
    RouteClassifier, SideEffect, Snippet,
};
pub use channel::{ChannelError, ChannelMap, ChannelSpec, MergePolicy, Reducer, StateSchema};
pub use checkpoint::{
    current_unix_millis, gen_checkpoint_id, gen_thread_id, Checkpoint, CheckpointId,
    CheckpointMeta, CheckpointStatus,
};
pub use decision::{Decision, StateSummary, ThreadStatus};
pub use delta::{ChannelWrite, DecidedBy, RouteStatus, RoutingDecision, StateDelta};
pub use storage::{
    paginate_history, CheckpointSelector, CheckpointStore, CheckpointWithCursor, HistoryPage,
    HistoryQuery, StoreError, ThreadListPage, ThreadListQuery,
};
pub use thread::{ForkedFrom, Thread};
pub use worker::{
    StateView, StepContext, SuspendRequest, Worker, WorkerError, WorkerOutcome, WorkerSpec,
};
