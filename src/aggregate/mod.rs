use std::fmt::Debug;

use serde::{de::DeserializeOwned, Serialize};

use crate::{Command, CqrsError, Event, EventPayload, Uuid};

pub mod definition;
pub mod registry;
pub mod snapshot;

/// The `Aggregate` trait defines a consistency boundary whose state is derived solely by folding
/// its own event stream.
///
/// Aggregates are a critical part of the framework and must be implemented for each entity you
/// want to work with. The command handlers and event appliers of an aggregate are declared with
/// [`Handles`] and [`Applies`], then listed in an [`AggregateDefinition`](definition::AggregateDefinition)
/// registered at startup.
///
/// `NAME` is the stream category: the events of instance `id` live in the stream
/// `"{NAME}-{id}"`.
pub trait Aggregate:
    Clone + Debug + Default + Send + Sync + Serialize + DeserializeOwned + 'static
{
    const NAME: &'static str;

    /// Returns the aggregate's ID.
    fn aggregate_id(&self) -> Uuid;

    /// Sets the aggregate's ID on a fresh, zero-valued instance.
    fn set_aggregate_id(&mut self, id: Uuid);
}

/// Command handler of an aggregate for commands of type `C`.
///
/// The handler sees the state folded from every stored event and returns zero or more events;
/// an empty list is a valid no-op. Invariants that need prior events (e.g. "the account must
/// exist") are the handler's to check, by returning [`CqrsError::Validation`].
pub trait Handles<C: Command>: Aggregate {
    fn handle(&self, command: &C) -> Result<Vec<Event>, CqrsError>;
}

/// Event applier of an aggregate for events of type `E`.
///
/// Must be a pure state transition: replaying the same events always yields the same state.
pub trait Applies<E: EventPayload>: Aggregate {
    fn apply(&mut self, event: &E);
}

/// An aggregate's folded state at a given stream version.
///
/// Instances are built for a single command and dropped once it completes.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregateInstance<A: Aggregate> {
    pub id: Uuid,
    pub state: A,
    /// Position of the last folded event, `None` for an empty stream.
    pub version: Option<u64>,
}
