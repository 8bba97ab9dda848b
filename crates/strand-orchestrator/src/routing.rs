//! Two-tier routing: a deterministic rule pass, then classification.
//!
//! Every stage gets one rule function over the current channel map. The
//! fast path never makes an external call; only an `Ambiguous` outcome
//! consults the fallback classifier, and a classifier that fails or
//! answers outside the candidate set surfaces as a routing error. The
//! router never guesses a worker.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use strand_contract::{
    ChannelMap, Classification, ClassifyRequest, DecidedBy, RouteClassifier,
};
use thiserror::Error;

use crate::stage::Stage;

/// What a stage rule concluded from the current state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuleOutcome {
    /// Run this worker next.
    Invoke(String),
    /// Move to another stage without running a worker.
    Goto(Stage),
    /// Nothing to do until the next external event.
    Await,
    /// The rules cannot pick between these workers.
    Ambiguous { candidates: Vec<String> },
}

/// A deterministic rule over the current snapshot.
pub type StageRule = Arc<dyn Fn(&ChannelMap) -> RuleOutcome + Send + Sync>;

/// Per-stage rule functions. Stages without a rule await input, and
/// terminal stages are never evaluated.
#[derive(Clone, Default)]
pub struct RoutingTable {
    rules: HashMap<Stage, StageRule>,
}

impl RoutingTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the rule for a stage (builder pattern).
    #[must_use]
    pub fn on<F>(mut self, stage: Stage, rule: F) -> Self
    where
        F: Fn(&ChannelMap) -> RuleOutcome + Send + Sync + 'static,
    {
        self.rules.insert(stage, Arc::new(rule));
        self
    }

    /// Evaluate the rule for a stage.
    pub fn evaluate(&self, stage: Stage, channels: &ChannelMap) -> RuleOutcome {
        match self.rules.get(&stage) {
            Some(rule) => rule(channels),
            None => RuleOutcome::Await,
        }
    }
}

/// Routing failures.
#[derive(Debug, Error)]
pub enum RouteError {
    /// Neither rules nor the classifier produced a usable worker. The
    /// router transitions to the clarification stage instead of guessing.
    #[error("routing ambiguous at stage {stage}: {reason}")]
    Ambiguous { stage: Stage, reason: String },
}

/// A settled routing conclusion for one pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decided {
    /// Run this worker; records how the choice was made.
    Invoke { worker: String, decided_by: DecidedBy },
    /// Transition stages without running a worker.
    Goto(Stage),
    /// Wait for the next external event.
    Await,
}

/// Run the two-tier decision: rules first, classifier only on ambiguity.
pub async fn decide(
    table: &RoutingTable,
    classifier: Option<&Arc<dyn RouteClassifier>>,
    stage: Stage,
    channels: &ChannelMap,
) -> Result<Decided, RouteError> {
    match table.evaluate(stage, channels) {
        RuleOutcome::Invoke(worker) => Ok(Decided::Invoke {
            worker,
            decided_by: DecidedBy::Rules,
        }),
        RuleOutcome::Goto(next) => Ok(Decided::Goto(next)),
        RuleOutcome::Await => Ok(Decided::Await),
        RuleOutcome::Ambiguous { candidates } => {
            let Some(classifier) = classifier else {
                return Err(RouteError::Ambiguous {
                    stage,
                    reason: "rules ambiguous and no classifier configured".into(),
                });
            };
            let request = ClassifyRequest {
                instruction: format!(
                    "Select the worker best suited to handle the conversation at stage {stage}."
                ),
                context: json!({
                    "stage": stage.as_str(),
                    "channels": channels,
                }),
                candidates: candidates.clone(),
            };
            let Classification { choice } =
                classifier
                    .classify(&request)
                    .await
                    .map_err(|e| RouteError::Ambiguous {
                        stage,
                        reason: e.to_string(),
                    })?;
            if candidates.iter().any(|c| c == &choice) {
                Ok(Decided::Invoke {
                    worker: choice,
                    decided_by: DecidedBy::Classifier,
                })
            } else {
                Err(RouteError::Ambiguous {
                    stage,
                    reason: format!("classifier chose {choice}, not among candidates"),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use strand_contract::ClassifyError;

    struct Scripted(&'static str);

    #[async_trait]
    impl RouteClassifier for Scripted {
        async fn classify(
            &self,
            _request: &ClassifyRequest,
        ) -> Result<Classification, ClassifyError> {
            Ok(Classification {
                choice: self.0.to_string(),
            })
        }
    }

    fn table() -> RoutingTable {
        RoutingTable::new()
            .on(Stage::Intake, |_| RuleOutcome::Goto(Stage::Triage))
            .on(Stage::Triage, |channels| {
                if channels.contains("budget") {
                    RuleOutcome::Invoke("closer".into())
                } else {
                    RuleOutcome::Ambiguous {
                        candidates: vec!["qualifier".into(), "support".into()],
                    }
                }
            })
    }

    #[tokio::test]
    async fn rules_win_without_classifier_call() {
        let channels: ChannelMap = [("budget".to_string(), json!(500))].into_iter().collect();
        let decided = decide(&table(), None, Stage::Triage, &channels).await.unwrap();
        assert_eq!(
            decided,
            Decided::Invoke {
                worker: "closer".into(),
                decided_by: DecidedBy::Rules
            }
        );
    }

    #[tokio::test]
    async fn ambiguity_falls_back_to_classifier() {
        let classifier: Arc<dyn RouteClassifier> = Arc::new(Scripted("support"));
        let decided = decide(&table(), Some(&classifier), Stage::Triage, &ChannelMap::new())
            .await
            .unwrap();
        assert_eq!(
            decided,
            Decided::Invoke {
                worker: "support".into(),
                decided_by: DecidedBy::Classifier
            }
        );
    }

    #[tokio::test]
    async fn out_of_candidate_answer_is_an_error_not_a_guess() {
        let classifier: Arc<dyn RouteClassifier> = Arc::new(Scripted("payments"));
        let err = decide(&table(), Some(&classifier), Stage::Triage, &ChannelMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::Ambiguous { .. }));
    }

    #[tokio::test]
    async fn missing_rule_awaits() {
        let decided = decide(&table(), None, Stage::Closing, &ChannelMap::new())
            .await
            .unwrap();
        assert_eq!(decided, Decided::Await);
    }
}
