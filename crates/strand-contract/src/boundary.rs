//! Traits for the external collaborators the orchestrator consumes.
//!
//! Only the surface these services present to the core is specified here:
//! classification and completion (LLM), ranked retrieval, and opaque
//! transactional side effects. Implementations live at the edges.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use thiserror::Error;

/// A classification request: pick one of `candidates` given the context.
#[derive(Clone, Debug)]
pub struct ClassifyRequest {
    /// What to decide, in plain language.
    pub instruction: String,
    /// State projection the classifier may look at.
    pub context: Value,
    /// Allowed answers. The classifier must return one of these verbatim.
    pub candidates: Vec<String>,
}

/// A classification result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classification {
    /// The chosen candidate.
    pub choice: String,
}

/// Classification failure. The router treats this as routing ambiguity,
/// never as a reason to guess a worker.
#[derive(Debug, Error)]
#[error("classification failed: {0}")]
pub struct ClassifyError(pub String);

/// The fallback classification service consulted only when the
/// deterministic rule pass is ambiguous.
#[async_trait]
pub trait RouteClassifier: Send + Sync {
    /// Choose one candidate for the given context.
    async fn classify(&self, request: &ClassifyRequest) -> Result<Classification, ClassifyError>;
}

/// One fragment of a streamed completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fragment {
    /// Text content of this fragment.
    pub text: String,
}

/// Completion failure.
#[derive(Debug, Error)]
#[error("completion failed: {0}")]
pub struct CompletionError(pub String);

/// A lazy, finite stream of response fragments. Dropping the stream stops
/// consumption; the underlying call needs no interruption.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<Fragment, CompletionError>> + Send>>;

/// An LLM completion service producing partial output as a restartable
/// fragment sequence.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Start a completion for the prompt.
    async fn complete(&self, prompt: &str) -> Result<FragmentStream, CompletionError>;
}

/// A ranked text snippet returned by knowledge retrieval.
#[derive(Clone, Debug, PartialEq)]
pub struct Snippet {
    /// Snippet text.
    pub text: String,
    /// Relevance score, higher is better.
    pub score: f32,
    /// Where the snippet came from, if known.
    pub source: Option<String>,
}

/// Retrieval failure.
#[derive(Debug, Error)]
#[error("retrieval failed: {0}")]
pub struct RetrievalError(pub String);

/// Knowledge-retrieval service returning ranked snippets for a query.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Return up to `limit` snippets ranked by relevance.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Snippet>, RetrievalError>;
}

/// An opaque transactional side effect (payment capture, message
/// delivery) issued by a specific worker.
#[derive(Clone, Debug, PartialEq)]
pub struct EffectCall {
    /// Effect kind, meaningful only to the provider.
    pub kind: String,
    /// Deduplication key. A re-invoked worker re-issues the same key, so
    /// a provider that already completed the call returns the prior
    /// result instead of acting twice.
    pub idempotency_key: String,
    /// Provider-specific payload.
    pub payload: Value,
}

impl EffectCall {
    /// Build an effect call with an explicit idempotency key.
    pub fn new(
        kind: impl Into<String>,
        idempotency_key: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            kind: kind.into(),
            idempotency_key: idempotency_key.into(),
            payload,
        }
    }
}

/// Result of a side-effect call.
#[derive(Clone, Debug, PartialEq)]
pub enum EffectOutcome {
    /// The effect completed synchronously.
    Completed(Value),
    /// The effect is in flight; a later external event carrying `ref_id`
    /// resumes the thread. The worker returns a pending delta immediately
    /// rather than blocking on this.
    Pending { ref_id: String },
}

/// Side-effect failure, split the same way worker failures are.
#[derive(Debug, Error)]
pub enum EffectError {
    /// Safe to retry with the same idempotency key.
    #[error("transient effect failure: {0}")]
    Transient(String),

    /// The provider rejected the call.
    #[error("permanent effect failure: {0}")]
    Permanent(String),
}

/// Transactional side-effect API, treated as opaque by the core.
#[async_trait]
pub trait SideEffect: Send + Sync {
    /// Execute or resume an effect call.
    async fn execute(&self, call: &EffectCall) -> Result<EffectOutcome, EffectError>;
}
