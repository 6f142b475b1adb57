use std::sync::Arc;

use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

use crate::{
    headers,
    Message,
    SequenceId,
};

/// An atomic change to a model.
///
/// `mutation_id` correlates an optimistic event with the confirmed event the
/// server later publishes for the same logical change. When absent on
/// submission the client assigns one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub data: JsonValue,
}

impl Event {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            mutation_id: None,
            name: name.into(),
            data: JsonValue::Null,
        }
    }

    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = data;
        self
    }

    pub fn with_mutation_id(mut self, mutation_id: impl Into<String>) -> Self {
        self.mutation_id = Some(mutation_id.into());
        self
    }
}

/// An authoritative event received from the change feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfirmedEvent {
    pub event: Event,
    pub sequence_id: SequenceId,
    /// The server may reject an already-acknowledged optimistic event; a
    /// rejection annuls the matching optimistic event instead of applying.
    pub rejected: bool,
}

impl ConfirmedEvent {
    pub fn from_message(message: &Message) -> Self {
        let rejected = message
            .headers
            .get(headers::REJECT)
            .is_some_and(|v| v == "true");
        Self {
            event: Event {
                mutation_id: message.headers.get(headers::EVENT_UUID).cloned(),
                name: message.name.clone(),
                data: message.data.clone(),
            },
            sequence_id: SequenceId::from(message.id.clone()),
            rejected,
        }
    }

    pub fn mutation_id(&self) -> Option<&str> {
        self.event.mutation_id.as_deref()
    }
}

/// The event handed to the user merge function, preserving which side of the
/// confirmation boundary it came from.
#[derive(Clone, Debug, PartialEq)]
pub enum MergeEvent {
    Optimistic(Event),
    Confirmed(ConfirmedEvent),
}

impl MergeEvent {
    pub fn event(&self) -> &Event {
        match self {
            MergeEvent::Optimistic(event) => event,
            MergeEvent::Confirmed(confirmed) => &confirmed.event,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, MergeEvent::Confirmed(_))
    }
}

/// Decides whether an optimistic event is confirmed (or rejected) by a given
/// confirmed event. The default matches on `mutation_id` equality; stricter
/// domain-specific comparators can be plugged in through the client options.
pub type EventComparator = Arc<dyn Fn(&Event, &Event) -> bool + Send + Sync>;

/// The default comparator: both events carry a mutation id and the ids are
/// equal.
pub fn mutation_id_equality(optimistic: &Event, confirmed: &Event) -> bool {
    match (&optimistic.mutation_id, &confirmed.mutation_id) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
