use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use serde_json::{json, Value};
use strand_contract::{
    ChannelSpec, StateDelta, StateSchema, StepContext, SuspendRequest, Worker, WorkerError,
    WorkerOutcome, WorkerSpec,
};
use strand_orchestrator::{
    GenaiClassifier, Orchestrator, RuleOutcome, RoutingTable, Stage,
};
use strand_server::http;
use strand_server::AppState;
use strand_store_adapters::FileStore;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "strand-server")]
struct Args {
    #[arg(long, env = "STRAND_HTTP_ADDR", default_value = "127.0.0.1:8080")]
    http_addr: String,

    #[arg(long, env = "STRAND_STORAGE_DIR", default_value = "./threads")]
    storage_dir: PathBuf,

    /// Model id for the fallback route classifier (e.g. gpt-4o-mini).
    /// When unset, ambiguous routes fall back to the clarification stage.
    #[arg(long, env = "STRAND_CLASSIFIER_MODEL")]
    classifier_model: Option<String>,

    /// Minimum budget a lead must state to qualify, in dollars.
    #[arg(long, env = "STRAND_QUALIFYING_BUDGET", default_value_t = 300)]
    qualifying_budget: i64,
}

/// Reads the newest event as the lead's stated budget.
struct BudgetQualifier {
    spec: WorkerSpec,
    threshold: i64,
}

impl BudgetQualifier {
    fn new(threshold: i64) -> Self {
        Self {
            spec: WorkerSpec::new("qualifier")
                .with_reads(["events", "budget"])
                .with_writes(["budget", "qualified"]),
            threshold,
        }
    }
}

#[async_trait]
impl Worker for BudgetQualifier {
    fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    async fn invoke(&self, ctx: StepContext<'_>) -> Result<WorkerOutcome, WorkerError> {
        let stated = ctx
            .view
            .get("events")?
            .and_then(Value::as_array)
            .and_then(|events| events.last())
            .and_then(|event| match event {
                Value::Number(n) => n.as_i64(),
                Value::Object(o) => o.get("budget").and_then(Value::as_i64),
                Value::String(s) => s.trim().trim_start_matches('$').parse().ok(),
                _ => None,
            });
        let delta = match stated {
            Some(budget) => StateDelta::new()
                .with_write("budget", json!(budget))
                .with_write("qualified", json!(budget >= self.threshold)),
            None => StateDelta::new().with_write("qualified", json!(false)),
        };
        Ok(WorkerOutcome::Delta(delta))
    }
}

/// Proposes the checkout link but waits for a human sign-off.
struct Closer {
    spec: WorkerSpec,
}

impl Closer {
    fn new() -> Self {
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

    async fn invoke(&self, ctx: StepContext<'_>) -> Result<WorkerOutcome, WorkerError> {
        let budget = ctx.view.get_i64("budget")?.unwrap_or_default();
        let proposed = StateDelta::new()
            .with_write(
                "payment_link",
                json!(format!("https://pay.example/checkout/{budget}")),
            )
            .with_write("closed", json!(true));
        Ok(WorkerOutcome::Suspend(SuspendRequest::new(
            proposed,
            format!("send the ${budget} payment link"),
        )))
    }
}

fn sales_schema() -> StateSchema {
    StateSchema::new()
        .with_channel(ChannelSpec::overwrite("budget", "qualifier"))
        .with_channel(ChannelSpec::overwrite("qualified", "qualifier"))
        .with_channel(ChannelSpec::overwrite("payment_link", "closer"))
        .with_channel(ChannelSpec::overwrite("closed", "closer"))
}

fn sales_table() -> RoutingTable {
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let store = Arc::new(FileStore::new(&args.storage_dir));
    let mut builder = Orchestrator::builder()
        .with_store(store)
        .with_schema(sales_schema())
        .with_routing_table(sales_table())
        .with_worker(Arc::new(BudgetQualifier::new(args.qualifying_budget)))
        .with_worker(Arc::new(Closer::new()));
    if let Some(model) = &args.classifier_model {
        builder = builder.with_classifier(Arc::new(GenaiClassifier::new(
            genai::Client::default(),
            model,
        )));
        tracing::info!(model = %model, "fallback classifier enabled");
    }
    let orchestrator = builder.build()?;

    let app = http::router(AppState::new(orchestrator));
    let listener = tokio::net::TcpListener::bind(&args.http_addr).await?;
    tracing::info!(addr = %args.http_addr, storage = %args.storage_dir.display(), "strand server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
