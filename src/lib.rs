//! # droplet_es
//!
//! An in-process CQRS/ES engine sitting between an event store and application-supplied
//! aggregates and read models.
//!
//! On the write side, a [`CommandDispatcher`] rebuilds the targeted aggregate from its
//! stream, validates the command, runs its handler and appends the resulting events with an
//! optimistic-concurrency check. Conflicting writers get a
//! [`CqrsError::ConcurrencyConflict`] and are expected to retry on their own.
//!
//! On the read side, the [`ProjectionEngine`] folds the streams each read model declares into
//! its [`ReadModelCache`], indexed by primary key and any number of foreign keys. Streams
//! are either tailed through a subscription or read right before a query. Ephemeral read
//! models are built by the first query and dropped once idle. The [`QueryDispatcher`]
//! answers queries from those caches with a [`QueryResult`] telling "found", "empty" and
//! "failed" apart.
//!
//! [`Cqrs`] wires everything together:
//!
//! ```rust,ignore
//! let cqrs = Cqrs::builder(Arc::new(InMemoryEventStore::new()))
//!     .aggregate(
//!         AggregateDefinition::<Account>::new()
//!             .command::<CreateAccount>()
//!             .event::<AccountCreated>(),
//!     )?
//!     .read_model(
//!         ReadModelDefinition::<AccountDetails>::keyed("AccountDetails", |d| d.account_id)
//!             .stream(StreamSource::of_aggregate::<Account>())
//!             .on::<AccountCreated>()
//!             .query(|cache, q: &GetAccountById| Ok(cache.get(&q.0).cloned())),
//!     )?
//!     .start()
//!     .await?;
//! ```

pub mod aggregate;
pub mod command;
pub mod config;
pub mod cqrs;
pub mod dispatcher;
pub mod error;
pub mod event_store;
pub mod events;
pub mod memory;
pub mod projection;
pub mod query;
pub mod read_model;

pub use aggregate::{
    definition::{AggregateDefinition, AggregateDescriptor, HandlerKey},
    registry::AggregateRegistry,
    snapshot::{AggregateSnapshot, InMemorySnapshotStore, SnapshotStore},
    Aggregate, AggregateInstance, Applies, Handles,
};
pub use command::{Command, CommandValidator, NoValidation, RuleValidator};
pub use config::EngineConfig;
pub use cqrs::{Cqrs, CqrsBuilder};
pub use dispatcher::CommandDispatcher;
pub use error::{CqrsError, Result, ValidationError, Violation};
pub use event_store::{EventStore, ExpectedVersion, Subscription};
pub use events::{Event, EventPayload, RecordedEvent};
pub use memory::InMemoryEventStore;
pub use projection::ProjectionEngine;
pub use query::{Query, QueryDispatcher, QueryResult};
pub use read_model::{
    cache::ReadModelCache, registry::ReadModelRegistry, Entity, Lifecycle, Projects,
    ReadModelDefinition, ReadModelDescriptor, StreamSource, StreamType,
};

pub use uuid::Uuid;
