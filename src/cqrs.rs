use std::sync::Arc;

use crate::{
    aggregate::{registry::AggregateRegistry, snapshot::SnapshotStore},
    read_model::registry::ReadModelRegistry,
    Aggregate, AggregateDefinition, AggregateInstance, Command, CommandDispatcher, CommandValidator,
    EngineConfig, Entity, Event, EventStore, NoValidation, ProjectionEngine, Query, QueryDispatcher,
    QueryResult, ReadModelDefinition, Result, Uuid,
};

/// The engine context: owns the dispatchers, the projection engine and the event store they
/// share.
///
/// ```rust,ignore
/// let cqrs = Cqrs::builder(Arc::new(InMemoryEventStore::new()))
///     .aggregate(AggregateDefinition::<Account>::new().command::<CreateAccount>().event::<AccountCreated>())?
///     .read_model(account_details())?
///     .start()
///     .await?;
///
/// cqrs.execute_command(CreateAccount { .. }).await?;
/// let account = cqrs.execute_query(GetAccountById(id)).await;
/// ```
pub struct Cqrs {
    commands: CommandDispatcher,
    queries: QueryDispatcher,
    projections: Arc<ProjectionEngine>,
    event_store: Arc<dyn EventStore>,
}

impl Cqrs {
    pub fn builder(event_store: Arc<dyn EventStore>) -> CqrsBuilder {
        CqrsBuilder::new(event_store)
    }

    pub async fn execute_command<C: Command>(&self, command: C) -> Result<Vec<Event>> {
        self.commands.execute(command).await
    }

    pub async fn execute_query<Q: Query>(&self, query: Q) -> QueryResult<Q::Output> {
        self.queries.query(query).await
    }

    /// Folds the current state of one aggregate instance.
    pub async fn load<A: Aggregate>(&self, id: Uuid) -> Result<AggregateInstance<A>> {
        self.commands.load::<A>(id).await
    }

    pub fn commands(&self) -> &CommandDispatcher {
        &self.commands
    }

    pub fn queries(&self) -> &QueryDispatcher {
        &self.queries
    }

    pub fn projections(&self) -> &ProjectionEngine {
        &self.projections
    }

    pub fn event_store(&self) -> &Arc<dyn EventStore> {
        &self.event_store
    }

    pub async fn shutdown(&self) {
        self.projections.shutdown().await;
    }
}

/// Collects the registrations and collaborators of a [`Cqrs`] engine.
///
/// Definitions are checked as they are added, so a misconfigured engine fails before it
/// starts.
pub struct CqrsBuilder {
    event_store: Arc<dyn EventStore>,
    aggregates: AggregateRegistry,
    read_models: ReadModelRegistry,
    validator: Arc<dyn CommandValidator>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    config: EngineConfig,
}

impl CqrsBuilder {
    pub fn new(event_store: Arc<dyn EventStore>) -> Self {
        Self {
            event_store,
            aggregates: AggregateRegistry::new(),
            read_models: ReadModelRegistry::new(),
            validator: Arc::new(NoValidation),
            snapshots: None,
            config: EngineConfig::default(),
        }
    }

    pub fn aggregate<A: Aggregate>(mut self, definition: AggregateDefinition<A>) -> Result<Self> {
        self.aggregates.register(definition)?;
        Ok(self)
    }

    pub fn read_model<E: Entity>(mut self, definition: ReadModelDefinition<E>) -> Result<Self> {
        self.read_models.register(definition)?;
        Ok(self)
    }

    pub fn validator(mut self, validator: impl CommandValidator + 'static) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    pub fn snapshots(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Wires the dispatchers, then starts the projection engine.
    pub async fn start(self) -> Result<Cqrs> {
        self.config.validate()?;

        let mut commands = CommandDispatcher::new(
            Arc::new(self.aggregates),
            self.event_store.clone(),
            self.validator,
        );
        if let Some(snapshots) = self.snapshots {
            commands = commands.with_snapshots(snapshots);
        }

        let projections = Arc::new(ProjectionEngine::new(
            Arc::new(self.read_models),
            self.event_store.clone(),
            self.config,
        ));
        projections.start().await?;

        tracing::info!(
            aggregates = commands.registry().aggregates().count(),
            read_models = projections.registry().len(),
            "cqrs engine started"
        );

        Ok(Cqrs {
            commands,
            queries: QueryDispatcher::new(projections.clone()),
            projections,
            event_store: self.event_store,
        })
    }
}
