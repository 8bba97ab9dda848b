//! Classifier fallback and the clarification stage.

mod common;

use std::sync::Arc;

use serde_json::json;
use strand_contract::storage::{CheckpointSelector, CheckpointStore};
use strand_orchestrator::{Orchestrator, RuleOutcome, RoutingTable, Stage};
use strand_store_adapters::MemoryStore;

use common::{Qualifier, ScriptedClassifier};

fn ambiguous_table() -> RoutingTable {
    RoutingTable::new()
        .on(Stage::Intake, |_| RuleOutcome::Goto(Stage::Triage))
        .on(Stage::Triage, |channels| {
            if channels.contains("qualified") {
                RuleOutcome::Goto(Stage::Complete)
            } else {
                RuleOutcome::Ambiguous {
                    candidates: vec!["qualifier".into()],
                }
            }
        })
}

fn builder(store: Arc<dyn CheckpointStore>) -> strand_orchestrator::OrchestratorBuilder {
    Orchestrator::builder()
        .with_store(store)
        .with_schema(common::sales_schema())
        .with_routing_table(ambiguous_table())
        .with_worker(Arc::new(Qualifier::new()))
}

#[tokio::test]
async fn classifier_resolves_rule_ambiguity() {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryStore::new());
    let orchestrator = builder(store.clone())
        .with_classifier(Arc::new(ScriptedClassifier("qualifier")))
        .build()
        .unwrap();

    let summary = orchestrator.submit_event("t1", json!(450)).await.unwrap();
    assert_eq!(summary.stage, "complete");

    // the route record names the classifier as the decider
    let latest = store.get("t1", &CheckpointSelector::Latest).await.unwrap();
    let route = latest.channels.get("route").unwrap();
    assert_eq!(route["decided_by"], "classifier");
    assert_eq!(route["worker"], "qualifier");
}

#[tokio::test]
async fn unresolvable_ambiguity_falls_back_to_clarification() {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryStore::new());
    let orchestrator = builder(store.clone()).build().unwrap();

    let summary = orchestrator.submit_event("t1", json!(450)).await.unwrap();
    assert_eq!(summary.stage, "clarify");
    assert!(!summary.pending_approval);

    let latest = store.get("t1", &CheckpointSelector::Latest).await.unwrap();
    let clarification = latest.channels.get("clarification").unwrap();
    assert_eq!(clarification["from_stage"], "triage");

    // clarify awaits input: resuming commits nothing
    let count = store.checkpoint_count("t1").await.unwrap();
    orchestrator.resume("t1").await.unwrap();
    assert_eq!(store.checkpoint_count("t1").await.unwrap(), count);
}
