//! Subgraph isolation: private checkpoints, one parent step, and
//! suspension propagation.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use strand_contract::storage::{CheckpointSelector, CheckpointStore, ThreadListQuery};
use strand_contract::{
    ChannelSpec, Decision, StateDelta, StateSchema, StepContext, SuspendRequest, Worker,
    WorkerError, WorkerOutcome, WorkerSpec,
};
use strand_orchestrator::{
    Orchestrator, RuleOutcome, RoutingTable, Stage, Subgraph,
};
use strand_store_adapters::MemoryStore;

/// Inner specialist; optionally suspends before answering.
struct Solver {
    spec: WorkerSpec,
    gated: bool,
}

impl Solver {
    fn new(gated: bool) -> Self {
        Self {
            spec: WorkerSpec::new("solver")
                .with_reads(["request"])
                .with_writes(["answer", "steps"]),
            gated,
        }
    }
}

#[async_trait]
impl Worker for Solver {
    fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    async fn invoke(&self, ctx: StepContext<'_>) -> Result<WorkerOutcome, WorkerError> {
        let request = ctx
            .view
            .get("request")?
            .and_then(Value::as_str)
            .unwrap_or("(empty)")
            .to_string();
        let delta = StateDelta::new()
            .with_write("answer", json!(format!("resolved: {request}")))
            .with_write("steps", json!("checked the runbook"));
        if self.gated {
            Ok(WorkerOutcome::Suspend(SuspendRequest::new(
                delta,
                "answer needs sign-off",
            )))
        } else {
            Ok(WorkerOutcome::Delta(delta))
        }
    }
}

fn support_subgraph(store: Arc<dyn CheckpointStore>, gated: bool) -> Subgraph {
    let inner_schema = StateSchema::new()
        .with_channel(ChannelSpec::overwrite("answer", "solver"))
        .with_channel(ChannelSpec::append("steps", "solver"));
    let inner_table = RoutingTable::new()
        .on(Stage::Intake, |_| RuleOutcome::Goto(Stage::Triage))
        .on(Stage::Triage, |channels| {
            if channels.contains("answer") {
                RuleOutcome::Goto(Stage::Complete)
            } else {
                RuleOutcome::Invoke("solver".into())
            }
        });

    Subgraph::builder("support", store)
        .with_reads(["events"])
        .with_schema(inner_schema)
        .with_routing_table(inner_table)
        .with_worker(Arc::new(Solver::new(gated)))
        .with_translate_in(|view| {
            Ok(view
                .get("events")?
                .and_then(Value::as_array)
                .and_then(|events| events.last())
                .cloned()
                .unwrap_or(Value::Null))
        })
        .with_translate_out(|channels| {
            json!({ "answer": channels.get("answer") })
        })
        .build()
        .expect("subgraph builds")
}

fn parent_orchestrator(store: Arc<dyn CheckpointStore>, gated: bool) -> Orchestrator {
    let schema = StateSchema::new()
        .with_channel(ChannelSpec::overwrite("support_summary", "support"))
        .with_channel(ChannelSpec::overwrite("support_done", "support"));
    let table = RoutingTable::new()
        .on(Stage::Intake, |_| RuleOutcome::Goto(Stage::Triage))
        .on(Stage::Triage, |channels| {
            if channels.get_bool("support_done") == Some(true) {
                RuleOutcome::Goto(Stage::Complete)
            } else {
                RuleOutcome::Invoke("support".into())
            }
        });

    Orchestrator::builder()
        .with_store(store.clone())
        .with_schema(schema)
        .with_routing_table(table)
        .with_worker(Arc::new(support_subgraph(store, gated)))
        .build()
        .unwrap()
}

#[tokio::test]
async fn one_invocation_many_private_checkpoints_one_parent_checkpoint() {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryStore::new());
    let orchestrator = parent_orchestrator(store.clone(), false);

    let summary = orchestrator
        .submit_event("ticket-7", json!("the api keeps timing out"))
        .await
        .unwrap();
    assert_eq!(summary.stage, "complete");

    // the subgraph ran its own machine under a derived thread id:
    // request ingest, stage transition, route record, solver result, close
    assert_eq!(store.checkpoint_count("ticket-7.support").await.unwrap(), 5);

    // exactly one parent checkpoint was written by the subgraph worker
    let mut by_support = 0;
    let mut before = None;
    loop {
        let page = store
            .history(
                "ticket-7",
                &strand_contract::storage::HistoryQuery { before, limit: 50 },
            )
            .await
            .unwrap();
        by_support += page
            .checkpoints
            .iter()
            .filter(|c| c.checkpoint.meta.writer == "support")
            .count();
        if !page.has_more {
            break;
        }
        before = page.next_cursor;
    }
    assert_eq!(by_support, 1);

    // the parent sees the summary and flag, never the private channels
    let latest = store
        .get("ticket-7", &CheckpointSelector::Latest)
        .await
        .unwrap();
    assert_eq!(latest.channels.get_bool("support_done"), Some(true));
    assert_eq!(
        latest.channels.get("support_summary").unwrap()["answer"],
        "resolved: the api keeps timing out"
    );
    assert!(!latest.channels.contains("answer"));
    assert!(!latest.channels.contains("request"));
    assert!(!latest.channels.contains("steps"));

    // the sub-thread is discoverable through its parent link
    let derived = store
        .list_threads(&ThreadListQuery {
            parent_thread_id: Some("ticket-7".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(derived.items, vec!["ticket-7.support"]);
}

#[tokio::test]
async fn inner_suspension_propagates_and_decisions_are_forwarded() {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryStore::new());
    let orchestrator = parent_orchestrator(store.clone(), true);

    let summary = orchestrator
        .submit_event("ticket-9", json!("refund this invoice"))
        .await
        .unwrap();
    assert!(summary.pending_approval);

    let parent_pending = store
        .get("ticket-9", &CheckpointSelector::Latest)
        .await
        .unwrap();
    let (_, reason, sub_thread_id) = parent_pending.pending().unwrap();
    assert_eq!(reason, "answer needs sign-off");
    assert_eq!(sub_thread_id, Some("ticket-9.support"));

    let inner_pending = store
        .get("ticket-9.support", &CheckpointSelector::Latest)
        .await
        .unwrap();
    assert!(inner_pending.is_pending());

    // approving at the parent settles the inner step and completes both
    let done = orchestrator
        .decide("ticket-9", &parent_pending.id, Decision::Approve)
        .await
        .unwrap();
    assert_eq!(done.stage, "complete");

    let inner_latest = store
        .get("ticket-9.support", &CheckpointSelector::Latest)
        .await
        .unwrap();
    assert_eq!(Stage::of(&inner_latest.channels), Stage::Complete);
    assert_eq!(
        inner_latest.channels.get_str("answer"),
        Some("resolved: refund this invoice")
    );

    let parent_latest = store
        .get("ticket-9", &CheckpointSelector::Latest)
        .await
        .unwrap();
    assert_eq!(parent_latest.channels.get_bool("support_done"), Some(true));
}

#[tokio::test]
async fn rejecting_an_inner_step_reports_an_incomplete_subgraph() {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryStore::new());
    let orchestrator = parent_orchestrator(store.clone(), true);

    orchestrator
        .submit_event("ticket-11", json!("cancel my plan"))
        .await
        .unwrap();
    let parent_pending = store
        .get("ticket-11", &CheckpointSelector::Latest)
        .await
        .unwrap();

    let summary = orchestrator
        .decide(
            "ticket-11",
            &parent_pending.id,
            Decision::Reject { reason: None },
        )
        .await
        .unwrap();
    assert!(!summary.pending_approval);

    // the inner proposal was not applied
    let inner_latest = store
        .get("ticket-11.support", &CheckpointSelector::Latest)
        .await
        .unwrap();
    assert!(!inner_latest.channels.contains("answer"));
}
