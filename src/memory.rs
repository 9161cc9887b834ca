//! In-memory [`EventStore`], for tests and local development.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, wrappers::errors::BroadcastStreamRecvError, StreamExt};

use crate::{
    event_store::{category_of, category_stream, event_type_stream},
    CqrsError, Event, EventStore, ExpectedVersion, RecordedEvent, Result, Subscription,
};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct StreamLog {
    events: Vec<RecordedEvent>,
    live: Option<broadcast::Sender<RecordedEvent>>,
}

impl StreamLog {
    fn version(&self) -> Option<u64> {
        self.events.last().map(|r| r.position)
    }

    fn push(&mut self, stream: &str, event: Event) -> u64 {
        let position = self.version().map_or(0, |v| v + 1);
        let recorded = RecordedEvent {
            stream: stream.to_string(),
            position,
            event,
        };
        if let Some(tx) = &self.live {
            // No receivers left is fine, the history keeps the event.
            let _ = tx.send(recorded.clone());
        }
        self.events.push(recorded);
        position
    }
}

/// Event store keeping every stream in a `HashMap`.
///
/// Appends to an aggregate stream are linked into the matching category (`$ce-`) and
/// event-type (`$et-`) streams under the same lock, so linked streams observe the same
/// order as the appends. Clone-friendly via `Arc`.
#[derive(Clone)]
pub struct InMemoryEventStore {
    streams: Arc<RwLock<HashMap<String, StreamLog>>>,
    capacity: usize,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a store whose subscriptions buffer at most `capacity` undelivered events
    /// before reporting a lag.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Current version of `stream`, `None` when it holds no event.
    pub fn version(&self, stream: &str) -> Result<Option<u64>> {
        let streams = self
            .streams
            .read()
            .map_err(|_| CqrsError::store(stream, anyhow!("lock poisoned")))?;
        Ok(streams.get(stream).and_then(StreamLog::version))
    }

    /// Names of every stream, linked ones included.
    pub fn stream_names(&self) -> Vec<String> {
        match self.streams.read() {
            Ok(streams) => streams.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: &[Event],
    ) -> Result<Option<u64>> {
        let mut streams = self
            .streams
            .write()
            .map_err(|_| CqrsError::store(stream, anyhow!("lock poisoned")))?;

        let log = streams.entry(stream.to_string()).or_default();
        let current = log.version();
        if !expected.matches(current) {
            return Err(CqrsError::ConcurrencyConflict {
                stream: stream.to_string(),
                expected,
                current,
            });
        }

        let mut appended = Vec::with_capacity(events.len());
        for event in events {
            let mut event = event.clone();
            let position = log.version().map_or(0, |v| v + 1);
            event.version = Some(position);
            log.push(stream, event.clone());
            appended.push(event);
        }
        let version = log.version();

        let category = category_of(stream).map(category_stream);
        for event in appended {
            if let Some(category) = &category {
                streams
                    .entry(category.clone())
                    .or_default()
                    .push(category, event.clone());
            }
            let by_type = event_type_stream(&event.event_type);
            streams.entry(by_type.clone()).or_default().push(&by_type, event);
        }

        Ok(version)
    }

    async fn read_from(&self, stream: &str, from: u64) -> Result<Vec<RecordedEvent>> {
        let streams = self
            .streams
            .read()
            .map_err(|_| CqrsError::store(stream, anyhow!("lock poisoned")))?;

        Ok(streams
            .get(stream)
            .map(|log| {
                log.events
                    .iter()
                    .filter(|r| r.position >= from)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn subscribe(&self, stream: &str, checkpoint: Option<u64>) -> Result<Subscription> {
        let (history, receiver) = {
            let mut streams = self
                .streams
                .write()
                .map_err(|_| CqrsError::store(stream, anyhow!("lock poisoned")))?;
            let log = streams.entry(stream.to_string()).or_default();
            let capacity = self.capacity;
            let receiver = log
                .live
                .get_or_insert_with(|| broadcast::channel(capacity).0)
                .subscribe();
            let history: Vec<RecordedEvent> = match checkpoint {
                Some(cp) => log
                    .events
                    .iter()
                    .filter(|r| r.position > cp)
                    .cloned()
                    .collect(),
                None => Vec::new(),
            };
            (history, receiver)
        };

        // Receiver and history were taken under the same lock: live events either sit in
        // the history or arrive through the channel, never both with a gap in between.
        let delivered_up_to = history.last().map(|r| r.position).or(checkpoint);
        let name = stream.to_string();
        let live = BroadcastStream::new(receiver).filter_map(move |item| match item {
            Ok(recorded) if Some(recorded.position) > delivered_up_to => Some(Ok(recorded)),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                Some(Err(CqrsError::SubscriptionLagged {
                    stream: name.clone(),
                    missed,
                }))
            }
        });

        Ok(Box::pin(tokio_stream::iter(history.into_iter().map(Ok::<_, CqrsError>)).chain(live)))
    }
}
