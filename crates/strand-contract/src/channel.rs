//! Named state channels: merge policies, ownership, and the ordered snapshot map.
//!
//! A channel is the unit of state a worker may read or write. Each channel
//! declares how concurrent-in-time writes fold into the existing value
//! (overwrite, append, or a custom reducer) and which worker group owns it.
//! Ownership is enforced before anything is persisted.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::delta::StateDelta;

/// Errors raised while validating or applying channel writes.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The delta targets a channel the schema does not declare.
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// The writer's group does not own the target channel.
    #[error("channel {channel} is owned by group {owner}, writer group {writer} may not write it")]
    NotOwner {
        channel: String,
        writer: String,
        owner: String,
    },

    /// An append landed on a non-array value.
    #[error("append requires an array value in channel {0}")]
    AppendRequiresArray(String),

    /// A worker read a channel it did not declare as an input.
    #[error("channel {0} was not declared as an input of this worker")]
    UndeclaredRead(String),
}

/// Folds an incoming write into the current channel value.
///
/// Reducers are part of the schema, not the persisted state; the same
/// schema must be supplied whenever historical deltas are re-applied.
pub trait Reducer: Send + Sync {
    /// Produce the new channel value from the current one and the write.
    fn reduce(&self, current: Option<&Value>, incoming: &Value) -> Value;
}

impl<F> Reducer for F
where
    F: Fn(Option<&Value>, &Value) -> Value + Send + Sync,
{
    fn reduce(&self, current: Option<&Value>, incoming: &Value) -> Value {
        self(current, incoming)
    }
}

/// How writes to a channel combine with its existing value.
#[derive(Clone, Default)]
pub enum MergePolicy {
    /// Replace the stored value.
    #[default]
    Overwrite,
    /// Push onto an array value; an incoming array is concatenated
    /// element-wise. The channel is created as an array on first write.
    Append,
    /// Delegate to a custom reducer.
    Reduce(Arc<dyn Reducer>),
}

impl fmt::Debug for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergePolicy::Overwrite => f.write_str("Overwrite"),
            MergePolicy::Append => f.write_str("Append"),
            MergePolicy::Reduce(_) => f.write_str("Reduce(..)"),
        }
    }
}

/// Declaration of a single state channel.
#[derive(Clone, Debug)]
pub struct ChannelSpec {
    /// Channel name, unique within a schema.
    pub name: String,
    /// Merge policy applied on every write.
    pub merge: MergePolicy,
    /// Worker group allowed to write this channel.
    pub owner: String,
}

impl ChannelSpec {
    /// Declare an overwrite channel.
    pub fn overwrite(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            merge: MergePolicy::Overwrite,
            owner: owner.into(),
        }
    }

    /// Declare an append channel.
    pub fn append(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            merge: MergePolicy::Append,
            owner: owner.into(),
        }
    }

    /// Declare a channel with a custom reducer.
    pub fn reduce(
        name: impl Into<String>,
        owner: impl Into<String>,
        reducer: Arc<dyn Reducer>,
    ) -> Self {
        Self {
            name: name.into(),
            merge: MergePolicy::Reduce(reducer),
            owner: owner.into(),
        }
    }
}

/// An ordered snapshot of channel values.
///
/// Channel order follows schema declaration order so serialized snapshots
/// are stable and diffable.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelMap(IndexMap<String, Value>);

impl ChannelMap {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a channel value.
    pub fn get(&self, channel: &str) -> Option<&Value> {
        self.0.get(channel)
    }

    /// Check whether a channel has a value.
    pub fn contains(&self, channel: &str) -> bool {
        self.0.contains_key(channel)
    }

    /// Get a channel value as a string slice.
    pub fn get_str(&self, channel: &str) -> Option<&str> {
        self.get(channel).and_then(Value::as_str)
    }

    /// Get a channel value as a bool.
    pub fn get_bool(&self, channel: &str) -> Option<bool> {
        self.get(channel).and_then(Value::as_bool)
    }

    /// Get a channel value as an i64.
    pub fn get_i64(&self, channel: &str) -> Option<i64> {
        self.get(channel).and_then(Value::as_i64)
    }

    /// Number of populated channels.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no channel holds a value. An empty map is a legitimate
    /// root snapshot.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(channel, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub(crate) fn set(&mut self, channel: impl Into<String>, value: Value) {
        self.0.insert(channel.into(), value);
    }
}

impl FromIterator<(String, Value)> for ChannelMap {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The declared channel set for one state machine, with its merge and
/// ownership rules.
#[derive(Clone, Debug, Default)]
pub struct StateSchema {
    channels: IndexMap<String, ChannelSpec>,
}

impl StateSchema {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a channel declaration (builder pattern). Re-declaring a name
    /// replaces the previous spec.
    #[must_use]
    pub fn with_channel(mut self, spec: ChannelSpec) -> Self {
        self.channels.insert(spec.name.clone(), spec);
        self
    }

    /// Whether the schema declares the channel.
    pub fn contains(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    /// The owning group of a channel, if declared.
    pub fn owner_of(&self, channel: &str) -> Option<&str> {
        self.channels.get(channel).map(|s| s.owner.as_str())
    }

    /// Iterate over declared channel names in declaration order.
    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    /// Check that every write in `delta` targets a declared channel owned
    /// by `writer_group`, without applying anything.
    pub fn validate_delta(&self, delta: &StateDelta, writer_group: &str) -> Result<(), ChannelError> {
        for write in delta.writes() {
            let spec = self
                .channels
                .get(&write.channel)
                .ok_or_else(|| ChannelError::UnknownChannel(write.channel.clone()))?;
            if spec.owner != writer_group {
                return Err(ChannelError::NotOwner {
                    channel: write.channel.clone(),
                    writer: writer_group.to_string(),
                    owner: spec.owner.clone(),
                });
            }
        }
        Ok(())
    }

    /// Apply a delta to a base snapshot, producing the next snapshot.
    ///
    /// Validation and merging happen together so a rejected delta leaves
    /// no trace: the base map is never mutated.
    pub fn apply(
        &self,
        base: &ChannelMap,
        delta: &StateDelta,
        writer_group: &str,
    ) -> Result<ChannelMap, ChannelError> {
        self.validate_delta(delta, writer_group)?;
        let mut next = base.clone();
        for write in delta.writes() {
            let Some(spec) = self.channels.get(&write.channel) else {
                return Err(ChannelError::UnknownChannel(write.channel.clone()));
            };
            let merged = match &spec.merge {
                MergePolicy::Overwrite => write.value.clone(),
                MergePolicy::Append => {
                    let mut items = match next.get(&write.channel) {
                        None => Vec::new(),
                        Some(Value::Array(existing)) => existing.clone(),
                        Some(_) => {
                            return Err(ChannelError::AppendRequiresArray(write.channel.clone()))
                        }
                    };
                    match &write.value {
                        Value::Array(incoming) => items.extend(incoming.iter().cloned()),
                        other => items.push(other.clone()),
                    }
                    Value::Array(items)
                }
                MergePolicy::Reduce(reducer) => {
                    reducer.reduce(next.get(&write.channel), &write.value)
                }
            };
            next.set(write.channel.clone(), merged);
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> StateSchema {
        StateSchema::new()
            .with_channel(ChannelSpec::overwrite("stage", "router"))
            .with_channel(ChannelSpec::append("events", "router"))
            .with_channel(ChannelSpec::overwrite("budget", "qualifier"))
            .with_channel(ChannelSpec::reduce(
                "max_offer",
                "qualifier",
                Arc::new(|current: Option<&Value>, incoming: &Value| {
                    let cur = current.and_then(Value::as_i64).unwrap_or(0);
                    let inc = incoming.as_i64().unwrap_or(0);
                    json!(cur.max(inc))
                }),
            ))
    }

    #[test]
    fn overwrite_replaces_value() {
        let s = schema();
        let base = ChannelMap::new();
        let d1 = StateDelta::new().with_write("stage", json!("triage"));
        let step1 = s.apply(&base, &d1, "router").unwrap();
        let d2 = StateDelta::new().with_write("stage", json!("closing"));
        let step2 = s.apply(&step1, &d2, "router").unwrap();
        assert_eq!(step2.get_str("stage"), Some("closing"));
    }

    #[test]
    fn append_accumulates_and_flattens_arrays() {
        let s = schema();
        let base = ChannelMap::new();
        let d1 = StateDelta::new().with_write("events", json!("hello"));
        let step1 = s.apply(&base, &d1, "router").unwrap();
        let d2 = StateDelta::new().with_write("events", json!(["a", "b"]));
        let step2 = s.apply(&step1, &d2, "router").unwrap();
        assert_eq!(step2.get("events"), Some(&json!(["hello", "a", "b"])));
    }

    #[test]
    fn reducer_keeps_maximum() {
        let s = schema();
        let base = ChannelMap::new();
        let step1 = s
            .apply(
                &base,
                &StateDelta::new().with_write("max_offer", json!(300)),
                "qualifier",
            )
            .unwrap();
        let step2 = s
            .apply(
                &step1,
                &StateDelta::new().with_write("max_offer", json!(150)),
                "qualifier",
            )
            .unwrap();
        assert_eq!(step2.get_i64("max_offer"), Some(300));
    }

    #[test]
    fn unowned_write_is_rejected_without_mutation() {
        let s = schema();
        let base = ChannelMap::new();
        let delta = StateDelta::new()
            .with_write("budget", json!(500))
            .with_write("stage", json!("closing"));
        let err = s.apply(&base, &delta, "qualifier").unwrap_err();
        assert!(matches!(err, ChannelError::NotOwner { ref channel, .. } if channel == "stage"));
        assert!(base.is_empty());
    }

    #[test]
    fn unknown_channel_is_rejected() {
        let s = schema();
        let delta = StateDelta::new().with_write("nope", json!(1));
        assert!(matches!(
            s.validate_delta(&delta, "router"),
            Err(ChannelError::UnknownChannel(_))
        ));
    }

    #[test]
    fn append_on_scalar_fails() {
        let s = schema();
        let base: ChannelMap = [("events".to_string(), json!("oops"))].into_iter().collect();
        let delta = StateDelta::new().with_write("events", json!("x"));
        assert!(matches!(
            s.apply(&base, &delta, "router"),
            Err(ChannelError::AppendRequiresArray(_))
        ));
    }

    #[test]
    fn channel_map_preserves_insertion_order() {
        let mut map = ChannelMap::new();
        map.set("z", json!(1));
        map.set("a", json!(2));
        let keys: Vec<_> = map.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["z", "a"]);
    }
}
