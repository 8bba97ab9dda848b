//! The coordinator step loop.
//!
//! One iteration of `drive` advances a thread by exactly one committed
//! checkpoint: a stage transition, a recorded routing decision, a worker
//! result, a suspension, or a failure record. The routing decision is
//! always committed before the chosen worker runs, so a crash between
//! "decided" and "executed" is recovered by re-invoking the same worker
//! against the same snapshot instead of re-deciding.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use strand_contract::storage::{CheckpointSelector, CheckpointStore, StoreError};
use strand_contract::{
    current_unix_millis, ChannelMap, Checkpoint, CheckpointId, CheckpointMeta, Decision,
    RouteClassifier, RouteStatus, RoutingDecision, StateDelta, StateSchema, StateView,
    StepContext, Worker, WorkerError, WorkerOutcome, WorkerSpec,
};
use tokio_util::sync::CancellationToken;

use crate::constants::{
    CLARIFICATION_CHANNEL, DECISIONS_CHANNEL, FAILURE_CHANNEL, ROUTER_GROUP, ROUTE_CHANNEL,
    STAGE_CHANNEL,
};
use crate::orchestrator::OrchestratorError;
use crate::registry::WorkerRegistry;
use crate::routing::{decide, Decided, RouteError, RoutingTable};
use crate::stage::Stage;

/// Tunables for the step loop.
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Upper bound on checkpoints committed per `drive` call; the loop
    /// then waits for the next external event.
    pub max_steps_per_drive: usize,
    /// Bounded timeout around each worker invocation; elapsing counts as
    /// a transient failure.
    pub worker_timeout: Duration,
    /// Transient failures retried per step before the step fails.
    pub max_transient_retries: usize,
    /// First retry backoff in milliseconds; doubles per retry.
    pub initial_backoff_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub max_backoff_ms: u64,
    /// Store commit retries for IO faults. The worker result is reused;
    /// the worker is never re-invoked for a commit retry.
    pub commit_retries: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_steps_per_drive: 16,
            worker_timeout: Duration::from_secs(30),
            max_transient_retries: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
            commit_retries: 3,
        }
    }
}

fn retry_backoff_ms(config: &RouterConfig, retry_index: usize) -> u64 {
    let cap = config.max_backoff_ms.max(config.initial_backoff_ms);
    if retry_index <= 1 {
        return config.initial_backoff_ms.min(cap);
    }
    let shift = (retry_index - 2).min(20) as u32;
    let factor = 2u64.saturating_mul(1u64.checked_shl(shift).unwrap_or(u64::MAX));
    config.initial_backoff_ms.saturating_mul(factor).min(cap)
}

/// The state machine driving one schema's threads.
///
/// Holds no per-thread state: everything it needs is reloaded from the
/// latest checkpoint, and all coordination is the store's per-thread
/// compare-and-swap.
#[derive(Clone)]
pub struct Router {
    store: Arc<dyn CheckpointStore>,
    schema: StateSchema,
    registry: WorkerRegistry,
    table: RoutingTable,
    classifier: Option<Arc<dyn RouteClassifier>>,
    config: RouterConfig,
    cancellation: CancellationToken,
}

impl Router {
    /// Assemble a router over a validated registry.
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        schema: StateSchema,
        registry: WorkerRegistry,
        table: RoutingTable,
        classifier: Option<Arc<dyn RouteClassifier>>,
        config: RouterConfig,
    ) -> Self {
        Self {
            store,
            schema,
            registry,
            table,
            classifier,
            config,
            cancellation: CancellationToken::new(),
        }
    }

    /// Attach a cooperative cancellation token, checked between steps
    /// only; an in-flight worker invocation is never interrupted.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// The underlying checkpoint store.
    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// The installed schema, router channels included.
    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    pub(crate) fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// The recorded-but-unexecuted routing decision, if any.
    pub(crate) fn pending_route(channels: &ChannelMap) -> Option<RoutingDecision> {
        channels
            .get(ROUTE_CHANNEL)
            .and_then(RoutingDecision::from_value)
            .filter(|d| d.status == RouteStatus::Decided)
    }

    /// Commit a checkpoint, retrying IO faults with backoff. A stale
    /// parent is never retried here: the caller must reload and rethink.
    pub(crate) async fn commit(
        &self,
        thread_id: &str,
        parent_id: Option<&CheckpointId>,
        channels: ChannelMap,
        meta: CheckpointMeta,
    ) -> Result<CheckpointId, OrchestratorError> {
        let mut attempt = 0usize;
        loop {
            match self
                .store
                .put(thread_id, parent_id, channels.clone(), meta.clone())
                .await
            {
                Ok(id) => return Ok(id),
                Err(conflict @ StoreError::ParentConflict { .. }) => {
                    return Err(OrchestratorError::Store(conflict));
                }
                Err(StoreError::Io(e)) if attempt < self.config.commit_retries => {
                    attempt += 1;
                    let wait = retry_backoff_ms(&self.config, attempt);
                    tracing::warn!(
                        thread_id,
                        error = %e,
                        attempt,
                        "checkpoint commit failed, retrying commit"
                    );
                    tokio::time::sleep(Duration::from_millis(wait)).await;
                }
                Err(e) => return Err(OrchestratorError::Store(e)),
            }
        }
    }

    /// Apply and commit a router-group delta on top of a known head.
    pub(crate) async fn commit_router(
        &self,
        thread_id: &str,
        parent_id: Option<&CheckpointId>,
        base: &ChannelMap,
        delta: &StateDelta,
    ) -> Result<CheckpointId, OrchestratorError> {
        let next = self.schema.apply(base, delta, ROUTER_GROUP)?;
        self.commit(
            thread_id,
            parent_id,
            next,
            CheckpointMeta::committed(ROUTER_GROUP),
        )
        .await
    }

    /// Merge an externally supplied delta into the thread, creating the
    /// root checkpoint on first contact.
    pub(crate) async fn ingest(
        &self,
        thread_id: &str,
        delta: StateDelta,
    ) -> Result<CheckpointId, OrchestratorError> {
        match self.store.latest(thread_id).await? {
            None => {
                let mut root = StateDelta::new().with_write(STAGE_CHANNEL, json!(Stage::Intake.as_str()));
                root.extend(delta);
                self.commit_router(thread_id, None, &ChannelMap::new(), &root)
                    .await
            }
            Some(head) => {
                self.commit_router(thread_id, Some(&head.id), &head.channels, &delta)
                    .await
            }
        }
    }

    /// Advance the thread until it suspends, terminates, awaits input,
    /// exhausts the step budget, or is cancelled. Returns the head the
    /// loop stopped on; a drive with nothing to do commits nothing.
    pub async fn drive(&self, thread_id: &str) -> Result<Checkpoint, OrchestratorError> {
        let mut steps = 0usize;
        loop {
            let head = self
                .store
                .get(thread_id, &CheckpointSelector::Latest)
                .await?;
            if self.cancellation.is_cancelled() {
                tracing::debug!(thread_id, "drive cancelled between steps");
                return Ok(head);
            }
            if head.is_pending() {
                return Ok(head);
            }
            let stage = Stage::of(&head.channels);
            if stage.is_terminal() {
                return Ok(head);
            }

            if let Some(decision) = Self::pending_route(&head.channels) {
                self.execute_step(&head, decision).await?;
                steps += 1;
                continue;
            }

            if steps >= self.config.max_steps_per_drive {
                tracing::warn!(
                    thread_id,
                    steps,
                    "step budget exhausted for this drive, awaiting next event"
                );
                return Ok(head);
            }

            match decide(&self.table, self.classifier.as_ref(), stage, &head.channels).await {
                Ok(Decided::Await) => return Ok(head),
                Ok(Decided::Goto(next)) => {
                    tracing::debug!(thread_id, from = %stage, to = %next, "stage transition");
                    let delta =
                        StateDelta::new().with_write(STAGE_CHANNEL, json!(next.as_str()));
                    self.commit_router(thread_id, Some(&head.id), &head.channels, &delta)
                        .await?;
                }
                Ok(Decided::Invoke { worker, decided_by }) => {
                    self.registry.require(&worker)?;
                    tracing::debug!(thread_id, %worker, ?decided_by, "routing decision recorded");
                    let decision = RoutingDecision::new(worker, stage.as_str(), decided_by);
                    let delta =
                        StateDelta::new().with_write(ROUTE_CHANNEL, decision.to_value());
                    self.commit_router(thread_id, Some(&head.id), &head.channels, &delta)
                        .await?;
                }
                Err(RouteError::Ambiguous { stage, reason }) => {
                    tracing::warn!(thread_id, %stage, %reason, "routing ambiguous, entering clarification");
                    let delta = StateDelta::new()
                        .with_write(STAGE_CHANNEL, json!(Stage::Clarify.as_str()))
                        .with_write(
                            CLARIFICATION_CHANNEL,
                            json!({ "from_stage": stage.as_str(), "reason": reason }),
                        );
                    self.commit_router(thread_id, Some(&head.id), &head.channels, &delta)
                        .await?;
                }
            }
            steps += 1;
        }
    }

    /// Run the decided worker and commit its outcome.
    async fn execute_step(
        &self,
        head: &Checkpoint,
        decision: RoutingDecision,
    ) -> Result<(), OrchestratorError> {
        let thread_id = head.thread_id.as_str();
        let worker = match self.registry.require(&decision.worker) {
            Ok(worker) => worker,
            Err(e) => {
                return self.commit_failure(head, &decision, e.to_string()).await;
            }
        };
        let spec = worker.spec().clone();

        match self.invoke_with_retry(head, worker.as_ref(), &spec).await {
            Ok(WorkerOutcome::Delta(delta)) => {
                let applied = match self.schema.apply(&head.channels, &delta, &spec.group) {
                    Ok(applied) => applied,
                    Err(e) => {
                        tracing::warn!(
                            thread_id,
                            worker = %spec.name,
                            error = %e,
                            "worker delta rejected before persistence"
                        );
                        return self
                            .commit_failure(head, &decision, format!("delta rejected: {e}"))
                            .await;
                    }
                };
                let bookkeeping =
                    StateDelta::new().with_write(ROUTE_CHANNEL, decision.done().to_value());
                let next = self.schema.apply(&applied, &bookkeeping, ROUTER_GROUP)?;
                self.commit(
                    thread_id,
                    Some(&head.id),
                    next,
                    CheckpointMeta::committed(&spec.name),
                )
                .await?;
                Ok(())
            }
            Ok(WorkerOutcome::Suspend(request)) => {
                if let Err(e) = self.schema.validate_delta(&request.proposed, &spec.group) {
                    tracing::warn!(
                        thread_id,
                        worker = %spec.name,
                        error = %e,
                        "proposed delta rejected before persistence"
                    );
                    return self
                        .commit_failure(head, &decision, format!("proposed delta rejected: {e}"))
                        .await;
                }
                tracing::debug!(thread_id, worker = %spec.name, reason = %request.reason, "step suspended");
                let meta = CheckpointMeta::pending(
                    &spec.name,
                    request.proposed,
                    request.reason,
                    request.sub_thread_id,
                );
                self.commit(thread_id, Some(&head.id), head.channels.clone(), meta)
                    .await?;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(thread_id, worker = %spec.name, error = %err, "step failed");
                self.commit_failure(head, &decision, err.to_string()).await
            }
        }
    }

    /// Invoke with a bounded timeout, retrying transient failures with
    /// exponential backoff against the same input snapshot.
    async fn invoke_with_retry(
        &self,
        head: &Checkpoint,
        worker: &dyn Worker,
        spec: &WorkerSpec,
    ) -> Result<WorkerOutcome, WorkerError> {
        let mut retry = 0usize;
        loop {
            let ctx = StepContext {
                thread_id: &head.thread_id,
                step_id: &head.id,
                view: StateView::new(&head.channels, &spec.reads),
            };
            let err = match tokio::time::timeout(self.config.worker_timeout, worker.invoke(ctx))
                .await
            {
                Ok(Ok(outcome)) => return Ok(outcome),
                Ok(Err(e)) => e,
                Err(_) => WorkerError::transient(format!(
                    "worker {} timed out after {:?}",
                    spec.name, self.config.worker_timeout
                )),
            };
            if !err.is_transient() || retry >= self.config.max_transient_retries {
                return Err(err);
            }
            retry += 1;
            let wait = retry_backoff_ms(&self.config, retry);
            tracing::warn!(
                thread_id = %head.thread_id,
                worker = %spec.name,
                retry,
                error = %err,
                "transient worker failure, backing off"
            );
            tokio::time::sleep(Duration::from_millis(wait)).await;
        }
    }

    /// Settle a suspended checkpoint with an external decision and commit
    /// the settlement. The caller drives afterwards if appropriate.
    ///
    /// A suspension that propagated up from a sub-thread is forwarded to
    /// the suspending worker, which settles its own machine first; the
    /// parent then records the decision and leaves its route record in
    /// place so re-driving re-invokes the same worker.
    pub(crate) async fn settle(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        decision: Decision,
    ) -> Result<Checkpoint, OrchestratorError> {
        let head = self
            .store
            .get(thread_id, &CheckpointSelector::Latest)
            .await?;
        if head.id != checkpoint_id {
            return Err(OrchestratorError::StaleDecision {
                thread_id: thread_id.to_string(),
                checkpoint_id: checkpoint_id.to_string(),
            });
        }
        let Some((proposed, _reason, sub_thread_id)) = head.pending() else {
            return Err(OrchestratorError::NotPending {
                checkpoint_id: checkpoint_id.to_string(),
            });
        };
        let proposed = proposed.clone();
        let sub_thread_id = sub_thread_id.map(str::to_string);
        let suspender = head.meta.writer.clone();

        let reject_reason = match &decision {
            Decision::Reject { reason } => reason.clone(),
            _ => None,
        };
        let record = json!({
            "checkpoint_id": head.id,
            "worker": suspender,
            "action": decision.label(),
            "reason": reject_reason,
            "decided_at_ms": current_unix_millis(),
        });

        if sub_thread_id.is_some() {
            let worker = self.registry.require(&suspender)?;
            worker
                .forward_decision(thread_id, decision)
                .await
                .map_err(|e| OrchestratorError::Forwarding(e.to_string()))?;

            let settle_delta = StateDelta::new().with_write(DECISIONS_CHANNEL, record);
            self.commit_router(thread_id, Some(&head.id), &head.channels, &settle_delta)
                .await?;
        } else {
            match decision {
                Decision::Reject { .. } => {
                    let delta = Self::route_done_delta(&head.channels)
                        .with_write(DECISIONS_CHANNEL, record);
                    self.commit_router(thread_id, Some(&head.id), &head.channels, &delta)
                        .await?;
                }
                settled => {
                    let apply_delta = match settled {
                        Decision::Edit { delta } => delta,
                        _ => proposed,
                    };
                    let group = self.registry.require(&suspender)?.spec().group.clone();
                    let applied = self.schema.apply(&head.channels, &apply_delta, &group)?;
                    let bookkeeping = Self::route_done_delta(&head.channels)
                        .with_write(DECISIONS_CHANNEL, record);
                    let next = self.schema.apply(&applied, &bookkeeping, ROUTER_GROUP)?;
                    self.commit(
                        thread_id,
                        Some(&head.id),
                        next,
                        CheckpointMeta::committed(&suspender),
                    )
                    .await?;
                }
            }
        }

        Ok(self
            .store
            .get(thread_id, &CheckpointSelector::Latest)
            .await?)
    }

    /// Delta flipping the in-flight route record to done, if one exists.
    fn route_done_delta(channels: &ChannelMap) -> StateDelta {
        match Self::pending_route(channels) {
            Some(route) => StateDelta::new().with_write(ROUTE_CHANNEL, route.done().to_value()),
            None => StateDelta::new(),
        }
    }

    /// Move the thread to the failure stage with a human-readable reason,
    /// preserving every prior checkpoint.
    async fn commit_failure(
        &self,
        head: &Checkpoint,
        decision: &RoutingDecision,
        reason: String,
    ) -> Result<(), OrchestratorError> {
        let delta = StateDelta::new()
            .with_write(STAGE_CHANNEL, json!(Stage::Failed.as_str()))
            .with_write(
                FAILURE_CHANNEL,
                json!({ "worker": decision.worker, "reason": reason }),
            )
            .with_write(ROUTE_CHANNEL, decision.done().to_value());
        self.commit_router(&head.thread_id, Some(&head.id), &head.channels, &delta)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let config = RouterConfig {
            initial_backoff_ms: 50,
            max_backoff_ms: 300,
            ..Default::default()
        };
        assert_eq!(retry_backoff_ms(&config, 1), 50);
        assert_eq!(retry_backoff_ms(&config, 2), 100);
        assert_eq!(retry_backoff_ms(&config, 3), 200);
        assert_eq!(retry_backoff_ms(&config, 4), 300);
        assert_eq!(retry_backoff_ms(&config, 10), 300);
    }
}
