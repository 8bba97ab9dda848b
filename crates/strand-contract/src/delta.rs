//! State deltas and routing decision records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One write to a named channel. How it merges is decided by the channel's
/// declared policy, not by the writer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelWrite {
    /// Target channel name.
    pub channel: String,
    /// Value to merge in.
    pub value: Value,
}

/// The incremental change a single step proposes.
///
/// Deltas are ordered: writes apply first to last, so later writes to the
/// same overwrite channel win.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    writes: Vec<ChannelWrite>,
}

impl StateDelta {
    /// Create an empty delta.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a write (builder pattern).
    #[must_use]
    pub fn with_write(mut self, channel: impl Into<String>, value: Value) -> Self {
        self.writes.push(ChannelWrite {
            channel: channel.into(),
            value,
        });
        self
    }

    /// Push a write.
    pub fn push(&mut self, channel: impl Into<String>, value: Value) {
        self.writes.push(ChannelWrite {
            channel: channel.into(),
            value,
        });
    }

    /// Append all writes from another delta.
    pub fn extend(&mut self, other: StateDelta) {
        self.writes.extend(other.writes);
    }

    /// The writes in application order.
    pub fn writes(&self) -> &[ChannelWrite] {
        &self.writes
    }

    /// Whether this delta writes nothing.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Number of writes.
    pub fn len(&self) -> usize {
        self.writes.len()
    }
}

impl FromIterator<ChannelWrite> for StateDelta {
    fn from_iter<I: IntoIterator<Item = ChannelWrite>>(iter: I) -> Self {
        Self {
            writes: iter.into_iter().collect(),
        }
    }
}

/// How a routing decision was reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecidedBy {
    /// The deterministic rule pass matched.
    Rules,
    /// The fallback classification call chose among candidates.
    Classifier,
}

/// Execution state of a recorded routing decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    /// Recorded, worker not yet committed a result. Crash recovery
    /// re-invokes the same worker instead of re-deciding.
    Decided,
    /// The decided step has committed (result, rejection, or failure).
    Done,
}

/// A routing decision, persisted into the router-owned `route` channel
/// before the chosen worker runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Worker selected to run.
    pub worker: String,
    /// Stage the thread was in when the decision was made.
    pub stage: String,
    /// Rule pass or classifier fallback.
    pub decided_by: DecidedBy,
    /// Whether the decided step has committed.
    pub status: RouteStatus,
}

impl RoutingDecision {
    /// Record a fresh decision for `worker` at `stage`.
    pub fn new(worker: impl Into<String>, stage: impl Into<String>, decided_by: DecidedBy) -> Self {
        Self {
            worker: worker.into(),
            stage: stage.into(),
            decided_by,
            status: RouteStatus::Decided,
        }
    }

    /// Copy of this decision with status flipped to `Done`.
    #[must_use]
    pub fn done(&self) -> Self {
        Self {
            status: RouteStatus::Done,
            ..self.clone()
        }
    }

    /// Serialize into a channel value.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Parse a channel value back into a decision.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delta_builder_keeps_order() {
        let delta = StateDelta::new()
            .with_write("a", json!(1))
            .with_write("b", json!(2));
        let channels: Vec<_> = delta.writes().iter().map(|w| w.channel.as_str()).collect();
        assert_eq!(channels, vec!["a", "b"]);
        assert_eq!(delta.len(), 2);
    }

    #[test]
    fn routing_decision_roundtrips_through_channel_value() {
        let decision = RoutingDecision::new("qualifier", "triage", DecidedBy::Rules);
        let value = decision.to_value();
        let parsed = RoutingDecision::from_value(&value).unwrap();
        assert_eq!(parsed, decision);
        assert_eq!(parsed.status, RouteStatus::Decided);
        assert_eq!(decision.done().status, RouteStatus::Done);
    }
}
