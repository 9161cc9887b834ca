use std::{
    any::{type_name, TypeId},
    collections::HashMap,
    sync::Arc,
};

use crate::{
    aggregate::definition::{AggregateDefinition, AggregateDescriptor, AggregateRuntime},
    Aggregate, Command, CqrsError, Result,
};

/// Dispatch table from command type to the aggregate that handles it.
#[derive(Default)]
pub struct AggregateRegistry {
    by_command: HashMap<TypeId, Arc<dyn AggregateRuntime>>,
    by_aggregate: HashMap<TypeId, Arc<dyn AggregateRuntime>>,
    names: HashMap<&'static str, TypeId>,
}

impl AggregateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handlers and appliers of `A`.
    ///
    /// Fails with [`CqrsError::DuplicateHandler`] if the definition lists a command or event
    /// type twice, if another aggregate already handles one of its commands, or if the
    /// aggregate name (its stream category) is taken. Nothing is registered on failure.
    pub fn register<A: Aggregate>(&mut self, definition: AggregateDefinition<A>) -> Result<()> {
        let registered = definition.build()?;

        if self.names.contains_key(A::NAME) {
            return Err(CqrsError::DuplicateHandler {
                owner: "aggregate registry".to_string(),
                key: A::NAME.to_string(),
            });
        }

        let commands = registered.command_types();
        for key in &commands {
            if let Some(owner) = self.by_command.get(&key.type_id) {
                return Err(CqrsError::DuplicateHandler {
                    owner: owner.name().to_string(),
                    key: key.type_name.to_string(),
                });
            }
        }

        let runtime: Arc<dyn AggregateRuntime> = Arc::new(registered);
        for key in commands {
            self.by_command.insert(key.type_id, runtime.clone());
        }
        self.by_aggregate.insert(TypeId::of::<A>(), runtime);
        self.names.insert(A::NAME, TypeId::of::<A>());

        tracing::debug!(aggregate = A::NAME, "aggregate registered");
        Ok(())
    }

    /// The aggregate declaring a handler for commands of type `C`.
    pub fn resolve<C: Command>(&self) -> Result<Arc<dyn AggregateDescriptor>> {
        let descriptor: Arc<dyn AggregateDescriptor> = self.runtime_for::<C>()?;
        Ok(descriptor)
    }

    pub fn handles<C: Command>(&self) -> bool {
        self.by_command.contains_key(&TypeId::of::<C>())
    }

    pub fn aggregates(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.names.keys().copied()
    }

    pub(crate) fn runtime_for<C: Command>(&self) -> Result<Arc<dyn AggregateRuntime>> {
        self.by_command
            .get(&TypeId::of::<C>())
            .cloned()
            .ok_or(CqrsError::UnregisteredCommand(type_name::<C>()))
    }

    pub(crate) fn runtime_of<A: Aggregate>(&self) -> Result<Arc<dyn AggregateRuntime>> {
        self.by_aggregate
            .get(&TypeId::of::<A>())
            .cloned()
            .ok_or_else(|| CqrsError::Configuration(format!("aggregate `{}` is not registered", A::NAME)))
    }
}
