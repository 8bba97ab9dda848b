//! The closed set of router stages.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strand_contract::ChannelMap;

use crate::constants::STAGE_CHANNEL;

/// Stages a thread moves through. The set is closed: routing rules may
/// only transition between these, and the three terminal stages have no
/// outgoing transitions. Re-opening a finished conversation means
/// forking a new thread from one of its checkpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// First contact; the thread was just created.
    Intake,
    /// Working out what the conversation needs.
    Triage,
    /// A specialist worker (often a subgraph) is handling the request.
    Delegate,
    /// Wrapping up: confirmation, payment, hand-off.
    Closing,
    /// The router could not pick a worker; awaiting clarification.
    Clarify,
    /// Terminal: finished successfully.
    Complete,
    /// Terminal: deferred for a later follow-up.
    Nurture,
    /// Terminal: aborted by a permanent failure.
    Failed,
}

impl Stage {
    /// Whether this stage has no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Complete | Stage::Nurture | Stage::Failed)
    }

    /// Canonical snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Intake => "intake",
            Stage::Triage => "triage",
            Stage::Delegate => "delegate",
            Stage::Closing => "closing",
            Stage::Clarify => "clarify",
            Stage::Complete => "complete",
            Stage::Nurture => "nurture",
            Stage::Failed => "failed",
        }
    }

    /// Read the current stage from a snapshot. A thread with no stage
    /// written yet is at `Intake`.
    pub fn of(channels: &ChannelMap) -> Stage {
        channels
            .get_str(STAGE_CHANNEL)
            .and_then(|s| s.parse().ok())
            .unwrap_or(Stage::Intake)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "intake" => Ok(Stage::Intake),
            "triage" => Ok(Stage::Triage),
            "delegate" => Ok(Stage::Delegate),
            "closing" => Ok(Stage::Closing),
            "clarify" => Ok(Stage::Clarify),
            "complete" => Ok(Stage::Complete),
            "nurture" => Ok(Stage::Nurture),
            "failed" => Ok(Stage::Failed),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_set_is_exactly_three() {
        let terminals: Vec<Stage> = [
            Stage::Intake,
            Stage::Triage,
            Stage::Delegate,
            Stage::Closing,
            Stage::Clarify,
            Stage::Complete,
            Stage::Nurture,
            Stage::Failed,
        ]
        .into_iter()
        .filter(Stage::is_terminal)
        .collect();
        assert_eq!(terminals, vec![Stage::Complete, Stage::Nurture, Stage::Failed]);
    }

    #[test]
    fn stage_of_defaults_to_intake() {
        assert_eq!(Stage::of(&ChannelMap::new()), Stage::Intake);
        let channels: ChannelMap = [("stage".to_string(), json!("closing"))].into_iter().collect();
        assert_eq!(Stage::of(&channels), Stage::Closing);
    }

    #[test]
    fn display_and_parse_are_inverse() {
        for stage in [Stage::Intake, Stage::Clarify, Stage::Failed] {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
    }
}
