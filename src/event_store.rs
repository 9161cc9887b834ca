use std::{fmt, pin::Pin};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_stream::Stream;

use crate::{Event, RecordedEvent, Result, Uuid};

/// Prefix of the stream that links every event of one aggregate type.
pub const CATEGORY_PREFIX: &str = "$ce-";

/// Prefix of the stream that links every event of one event type.
pub const EVENT_TYPE_PREFIX: &str = "$et-";

/// Name of the stream holding the events of a single aggregate instance.
pub fn aggregate_stream(aggregate: &str, id: &Uuid) -> String {
    format!("{aggregate}-{id}")
}

pub fn category_stream(aggregate: &str) -> String {
    format!("{CATEGORY_PREFIX}{aggregate}")
}

pub fn event_type_stream(event_type: &str) -> String {
    format!("{EVENT_TYPE_PREFIX}{event_type}")
}

/// Category of an aggregate instance stream, i.e. everything before the first `-`.
///
/// Returns `None` for linked streams (`$ce-`, `$et-`) and names without a category.
pub fn category_of(stream: &str) -> Option<&str> {
    if stream.starts_with('$') {
        return None;
    }
    stream.split_once('-').map(|(category, _)| category)
}

/// Precondition checked by [`EventStore::append`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// Append regardless of the current version.
    Any,
    /// The stream must not contain any event yet.
    NoStream,
    /// The last event of the stream must sit at this position.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(&self, current: Option<u64>) -> bool {
        match self {
            Self::Any => true,
            Self::NoStream => current.is_none(),
            Self::Exact(v) => current == Some(*v),
        }
    }
}

impl From<Option<u64>> for ExpectedVersion {
    fn from(version: Option<u64>) -> Self {
        match version {
            Some(v) => Self::Exact(v),
            None => Self::NoStream,
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any version"),
            Self::NoStream => write!(f, "empty stream"),
            Self::Exact(v) => write!(f, "version {v}"),
        }
    }
}

/// A lazy, infinite, at-least-once sequence of events from one stream.
///
/// An `Err` item reports a delivery problem (for example a lagging consumer); the
/// subscription keeps going after it, but events may have been missed.
pub type Subscription = Pin<Box<dyn Stream<Item = Result<RecordedEvent>> + Send>>;

/// The `EventStore` trait is the durable, append-only log the engine sits on.
///
/// Implementations own stream ordering and optimistic concurrency. Every event appended to
/// an aggregate stream is expected to also show up in its category stream
/// ([`category_stream`]) and its event-type stream ([`event_type_stream`]).
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Appends `events` if the stream's current version satisfies `expected`.
    ///
    /// Returns the new version of the stream, or [`CqrsError::ConcurrencyConflict`].
    ///
    /// [`CqrsError::ConcurrencyConflict`]: crate::CqrsError::ConcurrencyConflict
    async fn append(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: &[Event],
    ) -> Result<Option<u64>>;

    /// Reads every event of `stream` at or after position `from`, in order.
    async fn read_from(&self, stream: &str, from: u64) -> Result<Vec<RecordedEvent>>;

    /// Tails `stream`.
    ///
    /// Without a checkpoint delivery starts with the next appended event; with one it
    /// starts right after that position.
    async fn subscribe(&self, stream: &str, checkpoint: Option<u64>) -> Result<Subscription>;
}
