//! Subgraph isolation: a nested state machine behind one worker.
//!
//! A subgraph groups a cohesive worker set behind a single opaque node.
//! It keeps its own private schema and runs on a derived sub-thread
//! (`{parent_thread}.{name}`), creating as many internal checkpoints as
//! it needs; the parent sees exactly one checkpoint per invocation and
//! only the declared summary and completion channels. The parent never
//! reads or writes the private channels.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use strand_contract::storage::CheckpointStore;
use strand_contract::{
    ChannelError, ChannelMap, ChannelSpec, Decision, RouteClassifier, StateDelta, StateSchema,
    StateView, StepContext, SuspendRequest, Thread, Worker, WorkerError, WorkerOutcome,
    WorkerSpec,
};

use crate::constants::{install_router_channels, FAILURE_CHANNEL, ROUTER_GROUP};
use crate::orchestrator::{BuildError, OrchestratorError};
use crate::registry::WorkerRegistry;
use crate::router::{Router, RouterConfig};
use crate::routing::RoutingTable;
use crate::stage::Stage;

/// The inner channel carrying the translated parent request.
pub const REQUEST_CHANNEL: &str = "request";

/// Maps the parent-visible state to the subgraph's private request.
pub type TranslateIn =
    Arc<dyn for<'a> Fn(StateView<'a>) -> Result<Value, ChannelError> + Send + Sync>;

/// Maps the final private state to the parent-visible summary value.
pub type TranslateOut = Arc<dyn Fn(&ChannelMap) -> Value + Send + Sync>;

/// A nested, isolated state machine exposed to its parent as one worker.
pub struct Subgraph {
    spec: WorkerSpec,
    inner: Router,
    summary_channel: String,
    done_channel: String,
    translate_in: TranslateIn,
    translate_out: TranslateOut,
}

impl Subgraph {
    /// Start assembling a subgraph named `name` over the shared store.
    pub fn builder(name: impl Into<String>, store: Arc<dyn CheckpointStore>) -> SubgraphBuilder {
        let name = name.into();
        SubgraphBuilder {
            summary_channel: format!("{name}_summary"),
            done_channel: format!("{name}_done"),
            name,
            store,
            schema: StateSchema::new(),
            workers: Vec::new(),
            table: RoutingTable::new(),
            classifier: None,
            config: RouterConfig::default(),
            reads: Vec::new(),
            translate_in: None,
            translate_out: None,
        }
    }

    fn sub_thread_id(&self, parent_thread_id: &str) -> String {
        format!("{parent_thread_id}.{}", self.spec.name)
    }

    fn transient(e: OrchestratorError) -> WorkerError {
        WorkerError::transient(format!("subgraph step failed: {e}"))
    }

    fn suspend_from(&self, sub_id: String, reason: &str) -> WorkerOutcome {
        WorkerOutcome::Suspend(
            SuspendRequest::new(StateDelta::new(), reason).with_sub_thread(sub_id),
        )
    }
}

#[async_trait]
impl Worker for Subgraph {
    fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    /// One atomic parent step: translate the request in, drive the inner
    /// router to completion or suspension, translate the result out.
    ///
    /// Idempotent by construction: the request is only re-submitted when
    /// it differs from what the sub-thread already ingested, so crash
    /// recovery re-invocation never duplicates an inner event.
    async fn invoke(&self, ctx: StepContext<'_>) -> Result<WorkerOutcome, WorkerError> {
        let sub_id = self.sub_thread_id(ctx.thread_id);
        let store = self.inner.store();

        if store
            .load_thread(&sub_id)
            .await
            .map_err(|e| Self::transient(e.into()))?
            .is_none()
        {
            store
                .create_thread(&Thread::new(&sub_id).with_parent_thread(ctx.thread_id))
                .await
                .map_err(|e| Self::transient(e.into()))?;
        }

        let sub_head = store
            .latest(&sub_id)
            .await
            .map_err(|e| Self::transient(e.into()))?;
        if let Some(head) = &sub_head {
            if let Some((_, reason, _)) = head.pending() {
                return Ok(self.suspend_from(sub_id.clone(), reason));
            }
        }

        let request = (self.translate_in)(ctx.view)?;
        let needs_ingest = match &sub_head {
            None => true,
            Some(head) => head.channels.get(REQUEST_CHANNEL) != Some(&request),
        };
        if needs_ingest {
            self.inner
                .ingest(
                    &sub_id,
                    StateDelta::new().with_write(REQUEST_CHANNEL, request),
                )
                .await
                .map_err(Self::transient)?;
        }

        let head = self
            .inner
            .drive(&sub_id)
            .await
            .map_err(Self::transient)?;

        if let Some((_, reason, _)) = head.pending() {
            return Ok(self.suspend_from(sub_id, reason));
        }

        match Stage::of(&head.channels) {
            Stage::Failed => {
                let reason = head
                    .channels
                    .get(FAILURE_CHANNEL)
                    .and_then(|v| v.get("reason"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown failure");
                Err(WorkerError::permanent(format!(
                    "subgraph {} failed: {reason}",
                    self.spec.name
                )))
            }
            stage => {
                let summary = (self.translate_out)(&head.channels);
                Ok(WorkerOutcome::Delta(
                    StateDelta::new()
                        .with_write(&self.summary_channel, summary)
                        .with_write(&self.done_channel, json!(stage == Stage::Complete)),
                ))
            }
        }
    }

    /// Settle the sub-thread's suspended step with the parent's decision,
    /// then drive the inner machine forward unless the step was rejected.
    async fn forward_decision(
        &self,
        parent_thread_id: &str,
        decision: Decision,
    ) -> Result<(), WorkerError> {
        let sub_id = self.sub_thread_id(parent_thread_id);
        let Some(head) = self
            .inner
            .store()
            .latest(&sub_id)
            .await
            .map_err(|e| Self::transient(e.into()))?
        else {
            return Ok(());
        };
        if !head.is_pending() {
            return Ok(());
        }
        let is_reject = matches!(decision, Decision::Reject { .. });
        self.inner
            .settle(&sub_id, &head.id, decision)
            .await
            .map_err(Self::transient)?;
        if !is_reject {
            self.inner.drive(&sub_id).await.map_err(Self::transient)?;
        }
        Ok(())
    }
}

/// Builder for [`Subgraph`].
pub struct SubgraphBuilder {
    name: String,
    store: Arc<dyn CheckpointStore>,
    schema: StateSchema,
    workers: Vec<Arc<dyn Worker>>,
    table: RoutingTable,
    classifier: Option<Arc<dyn RouteClassifier>>,
    config: RouterConfig,
    reads: Vec<String>,
    summary_channel: String,
    done_channel: String,
    translate_in: Option<TranslateIn>,
    translate_out: Option<TranslateOut>,
}

impl SubgraphBuilder {
    /// Parent channels the input translator may read.
    #[must_use]
    pub fn with_reads<I, S>(mut self, reads: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reads = reads.into_iter().map(Into::into).collect();
        self
    }

    /// Declare the subgraph's private channels.
    #[must_use]
    pub fn with_schema(mut self, schema: StateSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Register an inner worker.
    #[must_use]
    pub fn with_worker(mut self, worker: Arc<dyn Worker>) -> Self {
        self.workers.push(worker);
        self
    }

    /// Set the inner routing rules.
    #[must_use]
    pub fn with_routing_table(mut self, table: RoutingTable) -> Self {
        self.table = table;
        self
    }

    /// Set the inner fallback classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn RouteClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Override the inner router tunables.
    #[must_use]
    pub fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the parent-visible summary/done channel names.
    #[must_use]
    pub fn with_result_channels(
        mut self,
        summary: impl Into<String>,
        done: impl Into<String>,
    ) -> Self {
        self.summary_channel = summary.into();
        self.done_channel = done.into();
        self
    }

    /// How the parent-visible state becomes the private request.
    #[must_use]
    pub fn with_translate_in<F>(mut self, f: F) -> Self
    where
        F: for<'a> Fn(StateView<'a>) -> Result<Value, ChannelError> + Send + Sync + 'static,
    {
        self.translate_in = Some(Arc::new(f));
        self
    }

    /// How the final private state becomes the parent-visible summary.
    #[must_use]
    pub fn with_translate_out<F>(mut self, f: F) -> Self
    where
        F: Fn(&ChannelMap) -> Value + Send + Sync + 'static,
    {
        self.translate_out = Some(Arc::new(f));
        self
    }

    /// Validate the inner worker contracts and assemble the subgraph.
    pub fn build(self) -> Result<Subgraph, BuildError> {
        let translate_in = self
            .translate_in
            .ok_or_else(|| BuildError::MissingTranslator(self.name.clone()))?;
        let translate_out = self
            .translate_out
            .ok_or_else(|| BuildError::MissingTranslator(self.name.clone()))?;

        let inner_schema = install_router_channels(self.schema)
            .with_channel(ChannelSpec::overwrite(REQUEST_CHANNEL, ROUTER_GROUP));
        let mut registry = WorkerRegistry::new();
        for worker in self.workers {
            registry.register(worker, &inner_schema)?;
        }
        let inner = Router::new(
            self.store,
            inner_schema,
            registry,
            self.table,
            self.classifier,
            self.config,
        );

        let spec = WorkerSpec::new(&self.name)
            .with_reads(self.reads)
            .with_writes([self.summary_channel.clone(), self.done_channel.clone()]);

        Ok(Subgraph {
            spec,
            inner,
            summary_channel: self.summary_channel,
            done_channel: self.done_channel,
            translate_in,
            translate_out,
        })
    }
}
