//! Read-model definitions: source streams, cache shape and keys, appliers and query handlers.

use std::{
    any::{Any, TypeId},
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::{
    aggregate::definition::HandlerKey,
    event_store::{category_stream, event_type_stream},
    Aggregate, CqrsError, Event, EventPayload, Query, Result, Uuid,
};

pub mod cache;
pub mod registry;

use cache::{KeyFn, KeySchema, ReadModelCache};

/// Anything that can sit in a read-model cache. Implemented for every suitable type.
pub trait Entity: Clone + Default + Send + Sync + 'static {}

impl<T: Clone + Default + Send + Sync + 'static> Entity for T {}

/// Event applier of a cached entity for events of type `E`.
///
/// An error skips the event for this read model only; the entity is left as it was before
/// the call.
pub trait Projects<E: EventPayload> {
    fn on(&mut self, event: &E) -> anyhow::Result<()>;
}

/// Whether a source stream holds the events of one aggregate type or of one event type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamType {
    Aggregate,
    Event,
}

/// A stream a read model folds.
///
/// Subscribed streams are tailed continuously by the projection engine; the others are read
/// on demand, right before each query and on explicit catch-up passes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSource {
    pub name: String,
    pub stream_type: StreamType,
    pub subscribed: bool,
}

impl StreamSource {
    /// Every event of the aggregate type `name`.
    pub fn aggregate(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stream_type: StreamType::Aggregate,
            subscribed: true,
        }
    }

    /// Every event of the event type `name`, whatever aggregate emitted it.
    pub fn event(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stream_type: StreamType::Event,
            subscribed: true,
        }
    }

    pub fn of_aggregate<A: Aggregate>() -> Self {
        Self::aggregate(A::NAME)
    }

    pub fn of_event<E: EventPayload>() -> Self {
        Self::event(E::NAME)
    }

    pub fn unsubscribed(mut self) -> Self {
        self.subscribed = false;
        self
    }

    /// Name of the store stream this source reads.
    pub fn stream_name(&self) -> String {
        match self.stream_type {
            StreamType::Aggregate => category_stream(&self.name),
            StreamType::Event => event_type_stream(&self.name),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    /// Materialized when the engine starts and kept for its whole life.
    #[default]
    Persistent,
    /// Materialized by the first query and destroyed once no query touched it for
    /// `idle_timeout`. A zero timeout destroys it as soon as the query that built it returns.
    Ephemeral { idle_timeout: Duration },
}

impl Lifecycle {
    /// Ephemeral with a zero idle timeout: every query builds its own instance.
    pub fn is_per_query(&self) -> bool {
        matches!(self, Self::Ephemeral { idle_timeout } if idle_timeout.is_zero())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Shape {
    Single,
    Keyed,
}

type CorrelateFn = Box<dyn Fn(&Event) -> Result<Option<Uuid>> + Send + Sync>;
type ApplyFn<E> = Box<dyn Fn(&mut E, &Event) -> anyhow::Result<()> + Send + Sync>;
pub(crate) type QueryFn<E> = Box<
    dyn Fn(&ReadModelCache<E>, &dyn Any) -> anyhow::Result<Option<Box<dyn Any + Send>>>
        + Send
        + Sync,
>;

/// How an event finds the cache entries it updates.
pub(crate) enum Route {
    /// The entry whose primary key is the event's aggregate ID, created if absent.
    AggregateId,
    /// The entry whose primary key is a field of the event, created if absent.
    Correlated(CorrelateFn),
    /// Every existing entry indexed under the event's aggregate ID by this foreign key.
    Foreign(&'static str),
    /// The single cached object, created if absent.
    Single,
}

pub(crate) struct Applier<E> {
    pub(crate) route: Route,
    pub(crate) apply: ApplyFn<E>,
}

/// Registration table of one read model.
///
/// ```rust,ignore
/// let details = ReadModelDefinition::<AccountDetails>::keyed("AccountDetails", |d| d.account_id)
///     .foreign_key("user_id", |d| d.user_id)
///     .stream(StreamSource::of_aggregate::<Account>())
///     .stream(StreamSource::of_aggregate::<User>().unsubscribed())
///     .ephemeral(Duration::ZERO)
///     .on::<AccountCreated>()
///     .on::<FundsAdded>()
///     .on_foreign::<UserCreated>("user_id")
///     .query(|cache, q: &GetAccountById| Ok(cache.get(&q.account_id).cloned()));
/// ```
pub struct ReadModelDefinition<E: Entity> {
    name: String,
    shape: Shape,
    sources: Vec<StreamSource>,
    lifecycle: Lifecycle,
    primary: Option<KeyFn<E>>,
    foreign: Vec<(&'static str, KeyFn<E>)>,
    appliers: Vec<(&'static str, Applier<E>)>,
    queries: Vec<(HandlerKey, QueryFn<E>)>,
}

impl<E: Entity> ReadModelDefinition<E> {
    fn with_shape(name: impl Into<String>, shape: Shape, primary: Option<KeyFn<E>>) -> Self {
        Self {
            name: name.into(),
            shape,
            sources: Vec::new(),
            lifecycle: Lifecycle::Persistent,
            primary,
            foreign: Vec::new(),
            appliers: Vec::new(),
            queries: Vec::new(),
        }
    }

    /// A read model caching one `E` per primary key.
    pub fn keyed<F>(name: impl Into<String>, primary_key: F) -> Self
    where
        F: Fn(&E) -> Option<Uuid> + Send + Sync + 'static,
    {
        Self::with_shape(name, Shape::Keyed, Some(Arc::new(primary_key)))
    }

    /// A read model caching a single `E` that every event folds into.
    pub fn single(name: impl Into<String>) -> Self {
        Self::with_shape(name, Shape::Single, None)
    }

    /// Declares a secondary index over the entities' `index` field.
    pub fn foreign_key<F>(mut self, index: &'static str, key: F) -> Self
    where
        F: Fn(&E) -> Option<Uuid> + Send + Sync + 'static,
    {
        self.foreign.push((index, Arc::new(key)));
        self
    }

    pub fn stream(mut self, source: StreamSource) -> Self {
        self.sources.push(source);
        self
    }

    pub fn ephemeral(mut self, idle_timeout: Duration) -> Self {
        self.lifecycle = Lifecycle::Ephemeral { idle_timeout };
        self
    }

    /// Folds events of type `P` into the entry keyed by their aggregate ID (or into the single
    /// object).
    pub fn on<P>(self) -> Self
    where
        P: EventPayload,
        E: Projects<P>,
    {
        let route = match self.shape {
            Shape::Single => Route::Single,
            Shape::Keyed => Route::AggregateId,
        };
        self.applier::<P>(route)
    }

    /// Folds events of type `P` into the entry keyed by the field `correlate` returns.
    /// Events for which it returns `None` are ignored.
    pub fn on_correlated<P, F>(self, correlate: F) -> Self
    where
        P: EventPayload,
        E: Projects<P>,
        F: Fn(&P) -> Option<Uuid> + Send + Sync + 'static,
    {
        let correlate: CorrelateFn =
            Box::new(move |event: &Event| -> Result<Option<Uuid>> {
                Ok(correlate(&event.get_payload::<P>()?))
            });
        self.applier::<P>(Route::Correlated(correlate))
    }

    /// Folds events of type `P` into every entry whose foreign key `index` equals the event's
    /// aggregate ID. Entries are never created this way.
    pub fn on_foreign<P>(self, index: &'static str) -> Self
    where
        P: EventPayload,
        E: Projects<P>,
    {
        self.applier::<P>(Route::Foreign(index))
    }

    fn applier<P>(mut self, route: Route) -> Self
    where
        P: EventPayload,
        E: Projects<P>,
    {
        let apply: ApplyFn<E> = Box::new(|entity: &mut E, event: &Event| -> anyhow::Result<()> {
            let payload = event.get_payload::<P>()?;
            entity.on(&payload)
        });
        self.appliers.push((P::NAME, Applier { route, apply }));
        self
    }

    /// Declares the handler answering queries of type `Q` from the cache.
    ///
    /// `Ok(None)` means "nothing (yet)", which callers see as an empty result.
    pub fn query<Q, F>(mut self, handler: F) -> Self
    where
        Q: Query,
        F: Fn(&ReadModelCache<E>, &Q) -> anyhow::Result<Option<Q::Output>> + Send + Sync + 'static,
    {
        let handler: QueryFn<E> = Box::new(
            move |cache: &ReadModelCache<E>,
                  query: &dyn Any|
                  -> anyhow::Result<Option<Box<dyn Any + Send>>> {
                let query = query
                    .downcast_ref::<Q>()
                    .ok_or_else(|| anyhow!("handler received another query type"))?;
                Ok(handler(cache, query)?.map(|out| Box::new(out) as Box<dyn Any + Send>))
            },
        );
        self.queries.push((HandlerKey::of::<Q>(), handler));
        self
    }

    /// Checks the tables and freezes them into their lookup form.
    pub(crate) fn build(self) -> Result<RegisteredReadModel<E>> {
        let owner = self.name.clone();
        let duplicate = |key: &str| CqrsError::DuplicateHandler {
            owner: owner.clone(),
            key: key.to_string(),
        };

        if self.sources.is_empty() {
            return Err(CqrsError::Configuration(format!(
                "read model `{}` declares no source stream",
                self.name
            )));
        }
        let mut streams = HashSet::new();
        for source in &self.sources {
            if !streams.insert(source.stream_name()) {
                return Err(CqrsError::Configuration(format!(
                    "read model `{}` declares stream `{}` twice",
                    self.name,
                    source.stream_name()
                )));
            }
        }

        if self.shape == Shape::Single && !self.foreign.is_empty() {
            return Err(CqrsError::Configuration(format!(
                "single-object read model `{}` cannot declare foreign keys",
                self.name
            )));
        }
        let mut indexes = HashSet::new();
        for (index, _) in &self.foreign {
            if !indexes.insert(*index) {
                return Err(duplicate(index));
            }
        }
        let schema = match self.shape {
            Shape::Single => KeySchema::single(),
            Shape::Keyed => KeySchema {
                primary: self.primary,
                foreign: self.foreign,
            },
        };

        let mut appliers = HashMap::with_capacity(self.appliers.len());
        for (event_type, applier) in self.appliers {
            if let Route::Foreign(index) = &applier.route {
                if !schema.has_index(index) {
                    return Err(CqrsError::Configuration(format!(
                        "read model `{}` routes `{event_type}` through undeclared foreign key `{index}`",
                        self.name
                    )));
                }
            }
            if appliers.insert(event_type, applier).is_some() {
                return Err(duplicate(event_type));
            }
        }

        let mut queries = HashMap::with_capacity(self.queries.len());
        for (key, handler) in self.queries {
            if queries.insert(key.type_id, (key, handler)).is_some() {
                return Err(duplicate(key.type_name));
            }
        }

        Ok(RegisteredReadModel {
            name: self.name,
            sources: self.sources,
            lifecycle: self.lifecycle,
            schema: Arc::new(schema),
            appliers,
            queries,
        })
    }
}

/// Introspection of a registered read model.
pub trait ReadModelDescriptor: Send + Sync {
    fn name(&self) -> &str;
    fn sources(&self) -> &[StreamSource];
    fn lifecycle(&self) -> Lifecycle;
    fn query_types(&self) -> Vec<HandlerKey>;
    fn event_types(&self) -> Vec<&'static str>;
}

pub(crate) struct RegisteredReadModel<E: Entity> {
    pub(crate) name: String,
    pub(crate) sources: Vec<StreamSource>,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) schema: Arc<KeySchema<E>>,
    pub(crate) appliers: HashMap<&'static str, Applier<E>>,
    pub(crate) queries: HashMap<TypeId, (HandlerKey, QueryFn<E>)>,
}

impl<E: Entity> RegisteredReadModel<E> {
    /// Whether events of `event_type` read from `stream` are skipped because the read model
    /// also declares their event-type stream, which is the only one they are folded from.
    pub(crate) fn folded_elsewhere(&self, stream: &str, event_type: &str) -> bool {
        stream != event_type_stream(event_type)
            && self
                .sources
                .iter()
                .any(|source| source.stream_type == StreamType::Event && source.name == event_type)
    }

    /// Whether a delivery finding no instance builds one.
    pub(crate) fn builds_on_delivery(&self) -> bool {
        !self.lifecycle.is_per_query()
    }

    /// Whether the engine builds the instance when it starts, rather than on first query.
    pub(crate) fn materialized_at_start(&self) -> bool {
        match self.lifecycle {
            Lifecycle::Persistent => true,
            lifecycle if lifecycle.is_per_query() => false,
            Lifecycle::Ephemeral { .. } => self.sources.iter().any(|source| source.subscribed),
        }
    }
}

impl<E: Entity> ReadModelDescriptor for RegisteredReadModel<E> {
    fn name(&self) -> &str {
        &self.name
    }

    fn sources(&self) -> &[StreamSource] {
        &self.sources
    }

    fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    fn query_types(&self) -> Vec<HandlerKey> {
        self.queries.values().map(|(key, _)| *key).collect()
    }

    fn event_types(&self) -> Vec<&'static str> {
        self.appliers.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Clone, Debug, Default)]
    struct Card {
        id: Option<Uuid>,
        holder: Option<Uuid>,
        uses: u32,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct CardUsed {
        card: Uuid,
    }

    impl EventPayload for CardUsed {
        const NAME: &'static str = "CardUsed";

        fn aggregate_id(&self) -> Uuid {
            self.card
        }
    }

    impl Projects<CardUsed> for Card {
        fn on(&mut self, event: &CardUsed) -> anyhow::Result<()> {
            self.id = Some(event.card);
            self.uses += 1;
            Ok(())
        }
    }

    struct CardById(Uuid);

    impl Query for CardById {
        type Output = u32;
    }

    fn cards() -> ReadModelDefinition<Card> {
        ReadModelDefinition::keyed("Cards", |c: &Card| c.id)
            .foreign_key("holder", |c: &Card| c.holder)
            .stream(StreamSource::aggregate("Card"))
    }

    #[test]
    fn stream_sources_resolve_to_linked_streams() {
        assert_eq!(StreamSource::aggregate("Card").stream_name(), "$ce-Card");
        assert_eq!(StreamSource::of_event::<CardUsed>().stream_name(), "$et-CardUsed");
        assert!(!StreamSource::event("X").unsubscribed().subscribed);
    }

    #[test]
    fn valid_definition_builds() {
        let model = cards()
            .on::<CardUsed>()
            .query(|cache, q: &CardById| Ok(cache.get(&q.0).map(|c| c.uses)))
            .build()
            .unwrap();

        assert_eq!(model.name(), "Cards");
        assert_eq!(model.event_types(), vec!["CardUsed"]);
        assert_eq!(model.query_types().len(), 1);
        assert_eq!(model.lifecycle(), Lifecycle::Persistent);
        assert!(matches!(model.appliers["CardUsed"].route, Route::AggregateId));
    }

    #[test]
    fn duplicate_applier_is_rejected() {
        let err = cards().on::<CardUsed>().on::<CardUsed>().build().err().unwrap();
        assert!(matches!(err, CqrsError::DuplicateHandler { key, .. } if key == "CardUsed"));
    }

    #[test]
    fn duplicate_query_handler_is_rejected() {
        let err = cards()
            .query(|_, _: &CardById| Ok(None))
            .query(|_, _: &CardById| Ok(Some(1)))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, CqrsError::DuplicateHandler { .. }));
    }

    #[test]
    fn foreign_route_needs_a_declared_index() {
        let err = cards().on_foreign::<CardUsed>("owner").build().err().unwrap();
        assert!(matches!(err, CqrsError::Configuration(_)));
        assert!(cards().on_foreign::<CardUsed>("holder").build().is_ok());
    }

    #[test]
    fn definition_without_streams_is_rejected() {
        let err = ReadModelDefinition::<Card>::single("Empty").build().err().unwrap();
        assert!(matches!(err, CqrsError::Configuration(_)));
    }

    #[test]
    fn event_type_stream_owns_its_events() {
        let model = cards()
            .stream(StreamSource::of_event::<CardUsed>())
            .on::<CardUsed>()
            .build()
            .unwrap();

        assert!(model.folded_elsewhere("$ce-Card", "CardUsed"));
        assert!(!model.folded_elsewhere("$et-CardUsed", "CardUsed"));
        assert!(!model.folded_elsewhere("$ce-Card", "CardIssued"));
    }

    #[test]
    fn start_materializes_all_but_on_demand_ephemeral_models() {
        let persistent = cards().build().unwrap();
        let tailed = cards().ephemeral(Duration::from_secs(5)).build().unwrap();
        let on_demand = ReadModelDefinition::<Card>::keyed("Lookups", |c: &Card| c.id)
            .stream(StreamSource::aggregate("Card").unsubscribed())
            .ephemeral(Duration::from_secs(5))
            .build()
            .unwrap();
        let per_query = cards().ephemeral(Duration::ZERO).build().unwrap();

        assert!(persistent.materialized_at_start());
        assert!(tailed.materialized_at_start());
        assert!(!on_demand.materialized_at_start());
        assert!(!per_query.materialized_at_start());
        assert!(!per_query.builds_on_delivery());
        assert!(tailed.builds_on_delivery());
    }

    #[test]
    fn single_object_routes_everything_to_the_object() {
        let model = ReadModelDefinition::<Card>::single("Totals")
            .stream(StreamSource::of_event::<CardUsed>())
            .ephemeral(Duration::from_secs(60))
            .on::<CardUsed>()
            .build()
            .unwrap();
        assert!(matches!(model.appliers["CardUsed"].route, Route::Single));
        assert_eq!(
            model.lifecycle(),
            Lifecycle::Ephemeral {
                idle_timeout: Duration::from_secs(60)
            }
        );
    }
}
