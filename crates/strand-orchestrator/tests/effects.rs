//! Asynchronous side effects: pending deltas, webhook-style resumption,
//! and idempotency keys across retries.

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};
use strand_contract::storage::CheckpointStore;
use strand_contract::{
    ChannelSpec, EffectCall, EffectError, EffectOutcome, SideEffect, StateDelta, StateSchema,
    StepContext, Worker, WorkerError, WorkerOutcome, WorkerSpec,
};
use strand_orchestrator::{Orchestrator, RuleOutcome, RoutingTable, Stage};
use strand_store_adapters::MemoryStore;

/// Fake payment provider. The first accepted call reports the capture
/// as in-flight; once in flight, any later call reports it complete.
/// Records every idempotency key it accepts.
#[derive(Default)]
struct FakePayments {
    keys: Mutex<Vec<String>>,
    failures_left: Mutex<usize>,
    in_flight: Mutex<bool>,
}

impl FakePayments {
    fn with_transient_failures(n: usize) -> Self {
        Self {
            failures_left: Mutex::new(n),
            ..Default::default()
        }
    }

    fn seen_keys(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }
}

#[async_trait]
impl SideEffect for FakePayments {
    async fn execute(&self, call: &EffectCall) -> Result<EffectOutcome, EffectError> {
        {
            let mut failures = self.failures_left.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(EffectError::Transient("gateway hiccup".into()));
            }
        }
        self.keys.lock().unwrap().push(call.idempotency_key.clone());
        let mut in_flight = self.in_flight.lock().unwrap();
        if *in_flight {
            Ok(EffectOutcome::Completed(json!({ "captured": true })))
        } else {
            *in_flight = true;
            Ok(EffectOutcome::Pending {
                ref_id: "cap_1".into(),
            })
        }
    }
}

/// Issues the capture and reports it pending; a later invocation (after
/// the provider's webhook event) records completion.
struct Dispatcher {
    spec: WorkerSpec,
    payments: Arc<FakePayments>,
}

impl Dispatcher {
    fn new(payments: Arc<FakePayments>) -> Self {
        Self {
            spec: WorkerSpec::new("dispatcher")
                .with_reads(["capture"])
                .with_writes(["capture"]),
            payments,
        }
    }
}

#[async_trait]
impl Worker for Dispatcher {
    fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    async fn invoke(&self, ctx: StepContext<'_>) -> Result<WorkerOutcome, WorkerError> {
        let call = EffectCall::new(
            "payment.capture",
            format!("{}:{}:payment.capture", ctx.thread_id, ctx.step_id),
            json!({ "amount_cents": 30_000 }),
        );
        let outcome = self.payments.execute(&call).await.map_err(|e| match e {
            EffectError::Transient(msg) => WorkerError::transient(msg),
            EffectError::Permanent(msg) => WorkerError::permanent(msg),
        })?;
        let capture = match outcome {
            EffectOutcome::Pending { ref_id } => json!({ "status": "pending", "ref": ref_id }),
            EffectOutcome::Completed(result) => json!({ "status": "done", "result": result }),
        };
        Ok(WorkerOutcome::Delta(
            StateDelta::new().with_write("capture", capture),
        ))
    }
}

fn capture_orchestrator(
    store: Arc<dyn CheckpointStore>,
    payments: Arc<FakePayments>,
) -> Orchestrator {
    let schema = StateSchema::new()
        .with_channel(ChannelSpec::overwrite("capture", "dispatcher"));
    let table = RoutingTable::new()
        .on(Stage::Intake, |_| RuleOutcome::Goto(Stage::Closing))
        .on(Stage::Closing, |channels| {
            let status = channels
                .get("capture")
                .and_then(|c| c.get("status"))
                .and_then(Value::as_str);
            match status {
                None => RuleOutcome::Invoke("dispatcher".into()),
                Some("pending") => {
                    // resumed only by the provider's completion event
                    let webhook_seen = channels
                        .get("events")
                        .and_then(Value::as_array)
                        .is_some_and(|events| {
                            events.iter().any(|e| e.get("capture_ref").is_some())
                        });
                    if webhook_seen {
                        RuleOutcome::Invoke("dispatcher".into())
                    } else {
                        RuleOutcome::Await
                    }
                }
                _ => RuleOutcome::Goto(Stage::Complete),
            }
        });

    Orchestrator::builder()
        .with_store(store)
        .with_schema(schema)
        .with_routing_table(table)
        .with_worker(Arc::new(Dispatcher::new(payments)))
        .build()
        .unwrap()
}

#[tokio::test]
async fn pending_effect_awaits_the_webhook_then_completes() {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryStore::new());
    let payments = Arc::new(FakePayments::default());
    let orchestrator = capture_orchestrator(store.clone(), payments.clone());

    // the capture goes out, the thread parks without blocking on it
    let summary = orchestrator
        .submit_event("order-1", json!({ "buy": "course" }))
        .await
        .unwrap();
    assert_eq!(summary.stage, "closing");
    assert!(!summary.pending_approval);

    // the provider's completion webhook resumes the thread
    let summary = orchestrator
        .submit_event("order-1", json!({ "capture_ref": "cap_1" }))
        .await
        .unwrap();
    assert_eq!(summary.stage, "complete");

    // two calls, two distinct step ids, so two keys; each seen once
    let keys = payments.seen_keys();
    assert_eq!(keys.len(), 2);
    assert_ne!(keys[0], keys[1]);
}

#[tokio::test]
async fn retried_steps_reuse_the_same_idempotency_key() {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryStore::new());
    let payments = Arc::new(FakePayments::with_transient_failures(2));
    let orchestrator = capture_orchestrator(store.clone(), payments.clone());

    let summary = orchestrator
        .submit_event("order-2", json!({ "buy": "course" }))
        .await
        .unwrap();
    assert_eq!(summary.stage, "closing");

    // the two transient failures never reached the key log; the eventual
    // success used the key derived from the same step
    let keys = payments.seen_keys();
    assert_eq!(keys.len(), 1);
    assert!(keys[0].contains("order-2"));
}
