use std::{
    any::{type_name, Any, TypeId},
    collections::HashMap,
};

use crate::{
    Aggregate, Applies, Command, CqrsError, Event, EventPayload, Handles, Result, Uuid,
};

/// Type tag of a command or query type, as used by the dispatch tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerKey {
    pub type_id: TypeId,
    pub type_name: &'static str,
}

impl HandlerKey {
    pub fn of<T: Any>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
        }
    }
}

type HandlerFn<A> = Box<dyn Fn(&A, &dyn Any) -> Result<Vec<Event>> + Send + Sync>;
type ApplierFn<A> = Box<dyn Fn(&mut A, &Event) -> Result<()> + Send + Sync>;

/// Registration table of one aggregate type: its command handlers and event appliers.
///
/// ```rust,ignore
/// let accounts = AggregateDefinition::<Account>::new()
///     .command::<CreateAccount>()
///     .command::<AddFunds>()
///     .event::<AccountCreated>()
///     .event::<FundsAdded>();
/// registry.register(accounts)?;
/// ```
///
/// Duplicates are detected when the definition is registered, not while building it.
pub struct AggregateDefinition<A: Aggregate> {
    handlers: Vec<(HandlerKey, HandlerFn<A>)>,
    appliers: Vec<(&'static str, ApplierFn<A>)>,
}

impl<A: Aggregate> Default for AggregateDefinition<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Aggregate> AggregateDefinition<A> {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            appliers: Vec::new(),
        }
    }

    /// Declares that `A` handles commands of type `C`.
    pub fn command<C>(mut self) -> Self
    where
        C: Command,
        A: Handles<C>,
    {
        let handler: HandlerFn<A> = Box::new(|state: &A, command: &dyn Any| -> Result<Vec<Event>> {
            let command = command.downcast_ref::<C>().ok_or_else(|| {
                CqrsError::Configuration(format!(
                    "`{}` handler received another command type",
                    type_name::<C>()
                ))
            })?;
            state.handle(command)
        });
        self.handlers.push((HandlerKey::of::<C>(), handler));
        self
    }

    /// Declares that `A` folds events of type `E`.
    pub fn event<E>(mut self) -> Self
    where
        E: EventPayload,
        A: Applies<E>,
    {
        let applier: ApplierFn<A> = Box::new(|state: &mut A, event: &Event| -> Result<()> {
            let payload = event.get_payload::<E>()?;
            state.apply(&payload);
            Ok(())
        });
        self.appliers.push((E::NAME, applier));
        self
    }

    /// Checks the tables and freezes them into their lookup form.
    pub(crate) fn build(self) -> Result<RegisteredAggregate<A>> {
        let mut handlers = HashMap::with_capacity(self.handlers.len());
        for (key, handler) in self.handlers {
            if handlers.insert(key.type_id, (key, handler)).is_some() {
                return Err(CqrsError::DuplicateHandler {
                    owner: A::NAME.to_string(),
                    key: key.type_name.to_string(),
                });
            }
        }

        let mut appliers = HashMap::with_capacity(self.appliers.len());
        for (event_type, applier) in self.appliers {
            if appliers.insert(event_type, applier).is_some() {
                return Err(CqrsError::DuplicateHandler {
                    owner: A::NAME.to_string(),
                    key: event_type.to_string(),
                });
            }
        }

        Ok(RegisteredAggregate {
            handlers,
            appliers,
        })
    }
}

/// Introspection of a registered aggregate type.
pub trait AggregateDescriptor: Send + Sync {
    fn name(&self) -> &'static str;
    fn command_types(&self) -> Vec<HandlerKey>;
    fn event_types(&self) -> Vec<&'static str>;
}

/// Type-erased operations the command dispatcher runs against a registered aggregate.
pub(crate) trait AggregateRuntime: AggregateDescriptor {
    fn new_state(&self, id: Uuid) -> Box<dyn Any + Send + Sync>;
    fn fold(&self, state: &mut dyn Any, events: &[Event]) -> Result<()>;
    fn handle(&self, state: &dyn Any, command: &dyn Any) -> Result<Vec<Event>>;
    fn snapshot(&self, state: &dyn Any) -> Result<serde_json::Value>;
    fn restore(&self, payload: serde_json::Value) -> Result<Box<dyn Any + Send + Sync>>;
}

pub(crate) struct RegisteredAggregate<A: Aggregate> {
    handlers: HashMap<TypeId, (HandlerKey, HandlerFn<A>)>,
    appliers: HashMap<&'static str, ApplierFn<A>>,
}

impl<A: Aggregate> RegisteredAggregate<A> {
    fn state<'a>(&self, state: &'a dyn Any) -> Result<&'a A> {
        state.downcast_ref::<A>().ok_or_else(|| state_mismatch::<A>())
    }

    pub(crate) fn fold_typed(&self, state: &mut A, events: &[Event]) -> Result<()> {
        for event in events {
            match self.appliers.get(event.event_type.as_str()) {
                Some(apply) => apply(state, event)?,
                None => tracing::debug!(
                    aggregate = A::NAME,
                    event_type = %event.event_type,
                    "no applier for event type, skipping"
                ),
            }
        }
        Ok(())
    }
}

fn state_mismatch<A: Aggregate>() -> CqrsError {
    CqrsError::Configuration(format!("state is not a `{}` aggregate", A::NAME))
}

impl<A: Aggregate> AggregateDescriptor for RegisteredAggregate<A> {
    fn name(&self) -> &'static str {
        A::NAME
    }

    fn command_types(&self) -> Vec<HandlerKey> {
        self.handlers.values().map(|(key, _)| *key).collect()
    }

    fn event_types(&self) -> Vec<&'static str> {
        self.appliers.keys().copied().collect()
    }
}

impl<A: Aggregate> AggregateRuntime for RegisteredAggregate<A> {
    fn new_state(&self, id: Uuid) -> Box<dyn Any + Send + Sync> {
        let mut state = A::default();
        state.set_aggregate_id(id);
        Box::new(state)
    }

    fn fold(&self, state: &mut dyn Any, events: &[Event]) -> Result<()> {
        let state = state
            .downcast_mut::<A>()
            .ok_or_else(|| state_mismatch::<A>())?;
        self.fold_typed(state, events)
    }

    fn handle(&self, state: &dyn Any, command: &dyn Any) -> Result<Vec<Event>> {
        let state = self.state(state)?;
        let command_type = command.type_id();
        let (_, handler) = self
            .handlers
            .get(&command_type)
            .ok_or_else(|| CqrsError::Configuration(format!("`{}` has no such handler", A::NAME)))?;
        handler(state, command)
    }

    fn snapshot(&self, state: &dyn Any) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self.state(state)?)?)
    }

    fn restore(&self, payload: serde_json::Value) -> Result<Box<dyn Any + Send + Sync>> {
        let state: A = serde_json::from_value(payload)?;
        Ok(Box::new(state))
    }
}
