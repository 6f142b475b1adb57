//! Transport-facing types shared between the `models` client library and its
//! pub/sub transport adapters.
//!
//! This crate deliberately has no async runtime dependency so that transport
//! implementations can reuse the vocabulary without pulling in the client.

use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fmt,
};

use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

pub mod backoff;
mod event;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use event::{
    mutation_id_equality,
    ConfirmedEvent,
    Event,
    EventComparator,
    MergeEvent,
};

/// Reserved message headers understood by the change feed.
pub mod headers {
    /// Carries the mutation id correlating an optimistic event with its
    /// server-confirmed counterpart.
    pub const EVENT_UUID: &str = "x-ably-models-event-uuid";

    /// Marks a confirmed event as a server-side rejection of the optimistic
    /// event with the same mutation id.
    pub const REJECT: &str = "x-ably-models-reject";
}

/// A single message received from (or retained by) a channel.
///
/// `id` is the channel-scoped sequence identifier; `headers` corresponds to
/// the transport message's `extras.headers`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub data: JsonValue,
    /// Origin timestamp in milliseconds since the epoch.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Message {
    pub fn new(id: impl Into<String>, name: impl Into<String>, data: JsonValue) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            data,
            timestamp: 0,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Channel-scoped identifier used to align a snapshot with the message
/// stream. Replay seeks through history for the first message id strictly
/// greater than this boundary.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceId(String);

impl SequenceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The epoch boundary: replaying from it delivers the entire retained
    /// window of the channel.
    pub fn zero() -> Self {
        Self("0".to_string())
    }

    pub fn is_zero(&self) -> bool {
        self.0.parse::<i128>() == Ok(0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SequenceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SequenceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for SequenceId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// Default ordering for message ids: numeric when both ids parse as numbers,
/// lexicographic otherwise.
pub fn default_order(a: &str, b: &str) -> Ordering {
    match (a.parse::<i128>(), b.parse::<i128>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_default_order_numeric() {
        assert_eq!(default_order("2", "10"), Ordering::Less);
        assert_eq!(default_order("10", "10"), Ordering::Equal);
        assert_eq!(default_order("11", "2"), Ordering::Greater);
    }

    #[test]
    fn test_default_order_lexicographic_fallback() {
        // "10" < "9" lexicographically once one side fails to parse.
        assert_eq!(default_order("10:0", "9:0"), Ordering::Less);
        assert_eq!(default_order("a", "b"), Ordering::Less);
    }

    #[test]
    fn test_sequence_id_zero() {
        assert!(SequenceId::zero().is_zero());
        assert!(SequenceId::from("0").is_zero());
        assert!(!SequenceId::from("1").is_zero());
        assert!(!SequenceId::from("abc").is_zero());
        assert_eq!(SequenceId::from(42u64).to_string(), "42");
    }
}
