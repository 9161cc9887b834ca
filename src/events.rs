use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{CqrsError, Result, Uuid};

/// The `Event` struct represents an immutable fact appended to an aggregate's stream.
///
/// An event contains its unique ID, event type, aggregate ID, payload data, stream position and
/// timestamp. Events are created from a typed payload with [`Event::new`] and folded back into a
/// typed payload with [`Event::get_payload`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// The ID of the event, used to deduplicate at-least-once deliveries.
    pub id: Uuid,

    /// The type of event, equal to the payload's [`EventPayload::NAME`].
    pub event_type: String,

    /// The ID of the aggregate that the event is associated with.
    pub aggregate_id: Uuid,

    /// The payload of the event.
    payload: serde_json::Value,

    /// Position of the event in its aggregate stream, assigned on append.
    pub version: Option<u64>,

    /// The timestamp of the event.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Creates a new, not yet appended, event.
    pub fn new<T: EventPayload>(payload: T) -> Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            event_type: T::NAME.to_string(),
            aggregate_id: payload.aggregate_id(),
            payload: serde_json::to_value(&payload)?,
            version: None,
            timestamp: Utc::now(),
        })
    }

    /// Gets the payload of the event.
    pub fn get_payload<T: EventPayload>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(CqrsError::PayloadDeserialization)
    }

    /// Raw JSON payload, as stored.
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn is<T: EventPayload>(&self) -> bool {
        self.event_type == T::NAME
    }
}

/// The `EventPayload` trait defines the typed content of an event.
///
/// To create an event payload in your application, implement this trait for each event type.
/// `NAME` is the type tag used to route the event to appliers and to name its event-type stream.
pub trait EventPayload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const NAME: &'static str;

    /// Gets the ID of the aggregate that the event payload is associated with.
    fn aggregate_id(&self) -> Uuid;
}

/// An event as read from a particular stream.
///
/// `position` is the event's position in `stream`, which differs from
/// `event.version` when the stream is a category or event-type stream.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    pub stream: String,
    pub position: u64,
    pub event: Event,
}
