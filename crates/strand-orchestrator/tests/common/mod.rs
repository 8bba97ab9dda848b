//! Shared fixtures: a small sales-qualification flow with an approval
//! gate on the closing step.
#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use strand_contract::storage::CheckpointStore;
use strand_contract::{
    ChannelSpec, RouteClassifier, StateDelta, StateSchema, StepContext, SuspendRequest, Worker,
    WorkerError, WorkerOutcome, WorkerSpec,
};
use strand_orchestrator::{Orchestrator, RuleOutcome, RoutingTable, Stage};

pub fn sales_schema() -> StateSchema {
    StateSchema::new()
        .with_channel(ChannelSpec::overwrite("budget", "qualifier"))
        .with_channel(ChannelSpec::overwrite("qualified", "qualifier"))
        .with_channel(ChannelSpec::overwrite("payment_link", "closer"))
        .with_channel(ChannelSpec::overwrite("closed", "closer"))
        .with_channel(ChannelSpec::overwrite("rogue_note", "rogue"))
}

pub fn sales_table() -> RoutingTable {
    RoutingTable::new()
        .on(Stage::Intake, |_| RuleOutcome::Goto(Stage::Triage))
        .on(Stage::Triage, |channels| match channels.get_bool("qualified") {
            None => RuleOutcome::Invoke("qualifier".into()),
            Some(true) => RuleOutcome::Goto(Stage::Closing),
            Some(false) => RuleOutcome::Goto(Stage::Nurture),
        })
        .on(Stage::Closing, |channels| {
            if channels.get_bool("closed") == Some(true) {
                RuleOutcome::Goto(Stage::Complete)
            } else if channels.contains("payment_link") {
                RuleOutcome::Await
            } else {
                RuleOutcome::Invoke("closer".into())
            }
        })
}

/// Reads the newest event as the stated budget and qualifies at $300.
pub struct Qualifier {
    spec: WorkerSpec,
}

impl Qualifier {
    pub fn new() -> Self {
        Self {
            spec: WorkerSpec::new("qualifier")
                .with_reads(["events", "budget"])
                .with_writes(["budget", "qualified"]),
        }
    }
}

#[async_trait]
impl Worker for Qualifier {
    fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    async fn invoke(&self, ctx: StepContext<'_>) -> Result<WorkerOutcome, WorkerError> {
        let budget = ctx
            .view
            .get("events")?
            .and_then(Value::as_array)
            .and_then(|events| events.last())
            .and_then(Value::as_i64);
        let delta = match budget {
            Some(budget) => StateDelta::new()
                .with_write("budget", json!(budget))
                .with_write("qualified", json!(budget >= 300)),
            None => StateDelta::new().with_write("qualified", json!(false)),
        };
        Ok(WorkerOutcome::Delta(delta))
    }
}

/// Proposes the payment link but suspends for approval before sending.
pub struct Closer {
    spec: WorkerSpec,
}

impl Closer {
    pub fn new() -> Self {
        Self {
            spec: WorkerSpec::new("closer")
                .with_reads(["budget"])
                .with_writes(["payment_link", "closed"]),
        }
    }
}

#[async_trait]
impl Worker for Closer {
    fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    async fn invoke(&self, _ctx: StepContext<'_>) -> Result<WorkerOutcome, WorkerError> {
        let proposed = StateDelta::new()
            .with_write("payment_link", json!("https://pay.example/checkout/300"))
            .with_write("closed", json!(true));
        Ok(WorkerOutcome::Suspend(SuspendRequest::new(
            proposed,
            "send the $300 payment link",
        )))
    }
}

/// Declares one channel but writes another at runtime.
pub struct Rogue {
    spec: WorkerSpec,
}

impl Rogue {
    pub fn new() -> Self {
        Self {
            spec: WorkerSpec::new("rogue").with_writes(["rogue_note"]),
        }
    }
}

#[async_trait]
impl Worker for Rogue {
    fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    async fn invoke(&self, _ctx: StepContext<'_>) -> Result<WorkerOutcome, WorkerError> {
        Ok(WorkerOutcome::Delta(
            StateDelta::new().with_write("budget", json!(1)),
        ))
    }
}

/// Always answers with the same label.
pub struct ScriptedClassifier(pub &'static str);

#[async_trait]
impl RouteClassifier for ScriptedClassifier {
    async fn classify(
        &self,
        _request: &strand_contract::ClassifyRequest,
    ) -> Result<strand_contract::Classification, strand_contract::ClassifyError> {
        Ok(strand_contract::Classification {
            choice: self.0.to_string(),
        })
    }
}

pub fn sales_orchestrator(store: Arc<dyn CheckpointStore>) -> Orchestrator {
    Orchestrator::builder()
        .with_store(store)
        .with_schema(sales_schema())
        .with_routing_table(sales_table())
        .with_worker(Arc::new(Qualifier::new()))
        .with_worker(Arc::new(Closer::new()))
        .with_worker(Arc::new(Rogue::new()))
        .build()
        .expect("fixture orchestrator builds")
}
