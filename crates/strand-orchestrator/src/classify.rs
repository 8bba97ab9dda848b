//! genai-backed fallback classifier.

use async_trait::async_trait;
use genai::chat::{ChatMessage, ChatRequest};
use genai::Client;
use strand_contract::{Classification, ClassifyError, ClassifyRequest, RouteClassifier};

const SYSTEM_PROMPT: &str = "You route conversations to specialized workers. \
Answer with exactly one of the candidate labels, nothing else.";

/// Routes ambiguous decisions through an LLM chat completion.
///
/// The model must answer with one of the candidate labels; anything else
/// is reported as a classification failure and the router falls back to
/// clarification rather than guessing.
#[derive(Clone)]
pub struct GenaiClassifier {
    client: Client,
    model: String,
}

impl GenaiClassifier {
    /// Build a classifier over a genai client and model id.
    pub fn new(client: Client, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    /// Match the raw model answer against the candidate set.
    fn match_candidate(answer: &str, candidates: &[String]) -> Option<String> {
        let normalized = answer.trim().to_lowercase();
        if let Some(exact) = candidates.iter().find(|c| c.to_lowercase() == normalized) {
            return Some(exact.clone());
        }
        candidates
            .iter()
            .find(|c| normalized.contains(&c.to_lowercase()))
            .cloned()
    }
}

#[async_trait]
impl RouteClassifier for GenaiClassifier {
    async fn classify(&self, request: &ClassifyRequest) -> Result<Classification, ClassifyError> {
        let prompt = format!(
            "{}\n\nContext:\n{}\n\nCandidates: {}",
            request.instruction,
            request.context,
            request.candidates.join(", ")
        );
        let chat_req = ChatRequest::new(vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(prompt),
        ]);

        let response = self
            .client
            .exec_chat(&self.model, chat_req, None)
            .await
            .map_err(|e| ClassifyError(e.to_string()))?;
        let answer = response
            .first_text()
            .ok_or_else(|| ClassifyError("model returned no text".into()))?;

        Self::match_candidate(answer, &request.candidates)
            .map(|choice| Classification { choice })
            .ok_or_else(|| {
                ClassifyError(format!(
                    "model answered {answer:?}, not among candidates"
                ))
            })
    }
}
