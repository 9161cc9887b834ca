use std::{
    any::{type_name, TypeId},
    collections::HashMap,
    sync::Arc,
};

use crate::{
    projection::ReadModelBlueprint,
    read_model::{Entity, ReadModelDefinition, ReadModelDescriptor},
    CqrsError, Query, Result,
};

/// Dispatch table from query type to the read model answering it.
#[derive(Default)]
pub struct ReadModelRegistry {
    models: Vec<Arc<dyn ReadModelBlueprint>>,
    by_query: HashMap<TypeId, usize>,
    names: HashMap<String, usize>,
}

impl ReadModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a read model.
    ///
    /// Fails with [`CqrsError::DuplicateHandler`] if the name is taken, if the definition
    /// lists an event or query type twice, or if another read model already answers one of
    /// its queries. Nothing is registered on failure.
    pub fn register<E: Entity>(&mut self, definition: ReadModelDefinition<E>) -> Result<()> {
        let registered = definition.build()?;

        if self.names.contains_key(registered.name()) {
            return Err(CqrsError::DuplicateHandler {
                owner: "read model registry".to_string(),
                key: registered.name().to_string(),
            });
        }

        let queries = registered.query_types();
        for key in &queries {
            if let Some(&owner) = self.by_query.get(&key.type_id) {
                return Err(CqrsError::DuplicateHandler {
                    owner: self.models[owner].name().to_string(),
                    key: key.type_name.to_string(),
                });
            }
        }

        let index = self.models.len();
        for key in queries {
            self.by_query.insert(key.type_id, index);
        }
        self.names.insert(registered.name().to_string(), index);
        tracing::debug!(read_model = registered.name(), "read model registered");
        self.models.push(Arc::new(registered));

        Ok(())
    }

    /// The read model declaring a handler for queries of type `Q`.
    pub fn resolve<Q: Query>(&self) -> Result<Arc<dyn ReadModelDescriptor>> {
        let index = self.index_of::<Q>()?;
        let descriptor: Arc<dyn ReadModelDescriptor> = self.models[index].clone();
        Ok(descriptor)
    }

    pub fn get(&self, name: &str) -> Option<&dyn ReadModelDescriptor> {
        self.names
            .get(name)
            .map(|&index| self.models[index].as_ref() as &dyn ReadModelDescriptor)
    }

    pub fn read_models(&self) -> impl Iterator<Item = &str> + '_ {
        self.models.iter().map(|model| model.name())
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub(crate) fn blueprints(&self) -> &[Arc<dyn ReadModelBlueprint>] {
        &self.models
    }

    /// Position of the read model answering `Q`, in registration order.
    pub(crate) fn index_of<Q: Query>(&self) -> Result<usize> {
        self.by_query
            .get(&TypeId::of::<Q>())
            .copied()
            .ok_or(CqrsError::UnregisteredQuery(type_name::<Q>()))
    }

    pub(crate) fn position(&self, name: &str) -> Option<usize> {
        self.names.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{read_model::StreamSource, EventPayload, Projects, Uuid};

    #[derive(Clone, Debug, Default)]
    struct Counter(u64);

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Ticked(Uuid);

    impl EventPayload for Ticked {
        const NAME: &'static str = "Ticked";

        fn aggregate_id(&self) -> Uuid {
            self.0
        }
    }

    impl Projects<Ticked> for Counter {
        fn on(&mut self, _event: &Ticked) -> anyhow::Result<()> {
            self.0 += 1;
            Ok(())
        }
    }

    struct Total;

    impl Query for Total {
        type Output = u64;
    }

    struct Missing;

    impl Query for Missing {
        type Output = ();
    }

    fn totals(name: &str) -> ReadModelDefinition<Counter> {
        ReadModelDefinition::single(name)
            .stream(StreamSource::of_event::<Ticked>())
            .on::<Ticked>()
            .query(|cache, _: &Total| Ok(cache.single().map(|c: &Counter| c.0)))
    }

    #[test]
    fn resolves_query_to_its_read_model() {
        let mut registry = ReadModelRegistry::new();
        registry.register(totals("Totals")).unwrap();

        let totals = registry.resolve::<Total>().unwrap();
        assert_eq!(totals.name(), "Totals");
        assert_eq!(totals.sources()[0].stream_name(), "$et-Ticked");
        assert!(registry.get("Totals").is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregistered_query_is_reported() {
        let registry = ReadModelRegistry::new();
        let err = registry.resolve::<Missing>().err().unwrap();
        assert!(matches!(err, CqrsError::UnregisteredQuery(name) if name.ends_with("Missing")));
    }

    #[test]
    fn two_read_models_cannot_answer_one_query() {
        let mut registry = ReadModelRegistry::new();
        registry.register(totals("Totals")).unwrap();
        let err = registry.register(totals("OtherTotals")).unwrap_err();
        assert!(matches!(err, CqrsError::DuplicateHandler { owner, .. } if owner == "Totals"));
        assert_eq!(registry.read_models().collect::<Vec<_>>(), vec!["Totals"]);
    }

    #[test]
    fn read_model_name_is_unique() {
        let mut registry = ReadModelRegistry::new();
        registry.register(totals("Totals")).unwrap();
        let err = registry
            .register(
                ReadModelDefinition::<Counter>::single("Totals")
                    .stream(StreamSource::of_event::<Ticked>()),
            )
            .unwrap_err();
        assert!(matches!(err, CqrsError::DuplicateHandler { key, .. } if key == "Totals"));
    }
}
