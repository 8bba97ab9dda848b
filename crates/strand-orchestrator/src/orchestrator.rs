//! The public facade over the router: events in, decisions in, status and
//! summaries out.

use std::sync::Arc;

use serde_json::Value;
use strand_contract::storage::{
    CheckpointSelector, CheckpointStore, HistoryPage, HistoryQuery, StoreError, ThreadListPage,
    ThreadListQuery,
};
use strand_contract::{
    ChannelError, Checkpoint, CheckpointMeta, Decision, RouteClassifier, StateDelta, StateSchema,
    StateSummary, Thread, ThreadStatus, Worker,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::constants::{install_router_channels, EVENTS_CHANNEL};
use crate::registry::{RegistryError, WorkerRegistry};
use crate::router::{Router, RouterConfig};
use crate::routing::RoutingTable;
use crate::stage::Stage;

/// Failures surfaced by the orchestrator API.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Persistence failure, including the compare-and-swap conflict a
    /// concurrent caller sees; reload latest and retry.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A delta was rejected by the channel ownership or merge rules.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Worker lookup or registration failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The thread finished; re-opening requires forking a new thread.
    #[error("thread {thread_id} is at terminal stage {stage}; fork it to re-open")]
    TerminalStage { thread_id: String, stage: Stage },

    /// `decide` targeted a checkpoint that is not awaiting a decision.
    #[error("checkpoint {checkpoint_id} is not pending a decision")]
    NotPending { checkpoint_id: String },

    /// `decide` targeted a superseded checkpoint.
    #[error("checkpoint {checkpoint_id} is not the latest of thread {thread_id}")]
    StaleDecision {
        thread_id: String,
        checkpoint_id: String,
    },

    /// A decision could not be forwarded into a sub-thread.
    #[error("decision forwarding failed: {0}")]
    Forwarding(String),
}

/// Assembly failures.
#[derive(Debug, Error)]
pub enum BuildError {
    /// No checkpoint store was configured.
    #[error("no checkpoint store configured")]
    MissingStore,

    /// Subgraphs must declare how private state maps to parent channels.
    #[error("subgraph {0} is missing its input or output translator")]
    MissingTranslator(String),

    /// A worker's channel contract failed validation.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// The checkpointed conversation orchestrator.
///
/// One instance serves any number of threads; per-thread sequencing is
/// the store's compare-and-swap, so concurrent calls on the same thread
/// resolve to one winner and typed conflicts for the rest.
#[derive(Clone)]
pub struct Orchestrator {
    router: Router,
}

impl Orchestrator {
    /// Start assembling an orchestrator.
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        self.router.store()
    }

    /// Feed an external event into a thread, creating the thread on first
    /// contact, then advance until the thread suspends, terminates, or
    /// awaits further input.
    pub async fn submit_event(
        &self,
        thread_id: &str,
        input: Value,
    ) -> Result<StateSummary, OrchestratorError> {
        let store = self.router.store();
        if store.load_thread(thread_id).await?.is_none() {
            match store.create_thread(&Thread::new(thread_id)).await {
                Ok(()) | Err(StoreError::AlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(head) = store.latest(thread_id).await? {
            if head.is_pending() {
                tracing::warn!(
                    thread_id,
                    "event received while suspended; a decision must settle the step first"
                );
                return Ok(summary_of(&head));
            }
            let stage = Stage::of(&head.channels);
            if stage.is_terminal() {
                return Err(OrchestratorError::TerminalStage {
                    thread_id: thread_id.to_string(),
                    stage,
                });
            }
        }

        self.router
            .ingest(
                thread_id,
                StateDelta::new().with_write(EVENTS_CHANNEL, input),
            )
            .await?;
        let head = self.router.drive(thread_id).await?;
        Ok(summary_of(&head))
    }

    /// Current stage and suspension flag for a thread.
    pub async fn get_status(&self, thread_id: &str) -> Result<ThreadStatus, OrchestratorError> {
        let store = self.router.store();
        store
            .load_thread(thread_id)
            .await?
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))?;
        let head = store.latest(thread_id).await?;
        Ok(match head {
            Some(head) => ThreadStatus {
                thread_id: thread_id.to_string(),
                stage: Stage::of(&head.channels).as_str().to_string(),
                pending_approval: head.is_pending(),
            },
            None => ThreadStatus {
                thread_id: thread_id.to_string(),
                stage: Stage::Intake.as_str().to_string(),
                pending_approval: false,
            },
        })
    }

    /// Re-enter the router at the latest checkpoint. Re-executes nothing
    /// that already committed; with no new input and no recovery to do,
    /// no checkpoint is written.
    pub async fn resume(&self, thread_id: &str) -> Result<StateSummary, OrchestratorError> {
        let head = self.router.drive(thread_id).await?;
        Ok(summary_of(&head))
    }

    /// Settle a suspended checkpoint with an external decision.
    ///
    /// `approve` applies exactly the delta the worker proposed; `edit`
    /// applies the supplied replacement; `reject` records the decision
    /// and leaves the state otherwise unchanged. Decisions on a
    /// subgraph-propagated suspension are forwarded into the sub-thread
    /// before the parent settles and (unless rejecting) re-drives.
    pub async fn decide(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        decision: Decision,
    ) -> Result<StateSummary, OrchestratorError> {
        let is_reject = matches!(decision, Decision::Reject { .. });
        let settled = self.router.settle(thread_id, checkpoint_id, decision).await?;
        let head = if is_reject {
            settled
        } else {
            self.router.drive(thread_id).await?
        };
        Ok(summary_of(&head))
    }

    /// Fork a new thread rooted at a historical checkpoint. The source
    /// checkpoint and all its ancestors stay untouched; this is the only
    /// way to "go back".
    pub async fn travel(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
    ) -> Result<StateSummary, OrchestratorError> {
        let store = self.router.store();
        let source = store
            .get(
                thread_id,
                &CheckpointSelector::Id(checkpoint_id.to_string()),
            )
            .await?;

        let fork_id = format!(
            "{}-fork-{}",
            thread_id,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        store
            .create_thread(
                &Thread::new(&fork_id).with_forked_from(thread_id, checkpoint_id),
            )
            .await?;
        self.router
            .commit(
                &fork_id,
                None,
                source.channels.clone(),
                CheckpointMeta::committed("travel"),
            )
            .await?;
        let head = store.get(&fork_id, &CheckpointSelector::Latest).await?;
        Ok(summary_of(&head))
    }

    /// Page through a thread's checkpoint history, newest first.
    pub async fn history(
        &self,
        thread_id: &str,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, OrchestratorError> {
        Ok(self.router.store().history(thread_id, query).await?)
    }

    /// List known threads.
    pub async fn list_threads(
        &self,
        query: &ThreadListQuery,
    ) -> Result<ThreadListPage, OrchestratorError> {
        Ok(self.router.store().list_threads(query).await?)
    }
}

fn summary_of(head: &Checkpoint) -> StateSummary {
    StateSummary {
        thread_id: head.thread_id.clone(),
        checkpoint_id: head.id.clone(),
        stage: Stage::of(&head.channels).as_str().to_string(),
        pending_approval: head.is_pending(),
    }
}

/// Builder for [`Orchestrator`].
#[derive(Default)]
pub struct OrchestratorBuilder {
    store: Option<Arc<dyn CheckpointStore>>,
    schema: StateSchema,
    workers: Vec<Arc<dyn Worker>>,
    table: RoutingTable,
    classifier: Option<Arc<dyn RouteClassifier>>,
    config: RouterConfig,
    cancellation: Option<CancellationToken>,
}

impl OrchestratorBuilder {
    /// Set the checkpoint store (required).
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Declare the worker-owned channels. Router channels are installed
    /// on top automatically.
    #[must_use]
    pub fn with_schema(mut self, schema: StateSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Register a worker.
    #[must_use]
    pub fn with_worker(mut self, worker: Arc<dyn Worker>) -> Self {
        self.workers.push(worker);
        self
    }

    /// Set the per-stage routing rules.
    #[must_use]
    pub fn with_routing_table(mut self, table: RoutingTable) -> Self {
        self.table = table;
        self
    }

    /// Set the fallback classifier consulted on rule ambiguity.
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn RouteClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Override the router tunables.
    #[must_use]
    pub fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach a cooperative cancellation token, checked between steps.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Validate every worker contract and assemble the orchestrator.
    pub fn build(self) -> Result<Orchestrator, BuildError> {
        let store = self.store.ok_or(BuildError::MissingStore)?;
        let schema = install_router_channels(self.schema);
        let mut registry = WorkerRegistry::new();
        for worker in self.workers {
            registry.register(worker, &schema)?;
        }
        let mut router = Router::new(
            store,
            schema,
            registry,
            self.table,
            self.classifier,
            self.config,
        );
        if let Some(token) = self.cancellation {
            router = router.with_cancellation(token);
        }
        Ok(Orchestrator { router })
    }
}
