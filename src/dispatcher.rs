use std::{
    any::{type_name, Any},
    sync::Arc,
};

use crate::{
    aggregate::{
        definition::AggregateRuntime,
        registry::AggregateRegistry,
        snapshot::{AggregateSnapshot, SnapshotStore},
    },
    event_store::aggregate_stream,
    Aggregate, AggregateInstance, Command, CommandValidator, CqrsError, Event, EventStore,
    ExpectedVersion, Result, Uuid,
};

type State = Box<dyn Any + Send + Sync>;

/// Routes commands to their aggregate and appends the resulting events.
///
/// Each call rebuilds the aggregate from its stream, so nothing is kept between commands
/// unless a [`SnapshotStore`] is layered on top. Concurrency control is optimistic: the
/// append is conditioned on the version read while loading, and the dispatcher never
/// retries a conflicting command on its own.
pub struct CommandDispatcher {
    registry: Arc<AggregateRegistry>,
    event_store: Arc<dyn EventStore>,
    validator: Arc<dyn CommandValidator>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
}

impl CommandDispatcher {
    pub fn new(
        registry: Arc<AggregateRegistry>,
        event_store: Arc<dyn EventStore>,
        validator: Arc<dyn CommandValidator>,
    ) -> Self {
        Self {
            registry,
            event_store,
            validator,
            snapshots: None,
        }
    }

    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn registry(&self) -> &AggregateRegistry {
        &self.registry
    }

    /// Handles `command` and returns the events it appended, positions included.
    ///
    /// # Errors
    ///
    /// - [`CqrsError::UnregisteredCommand`] if no aggregate handles `C`;
    /// - [`CqrsError::MissingAggregateId`] if the command names no instance;
    /// - [`CqrsError::Validation`] from the validator or the handler, before any append;
    /// - [`CqrsError::ConcurrencyConflict`] if the stream moved since it was read.
    pub async fn execute<C: Command>(&self, command: C) -> Result<Vec<Event>> {
        let runtime = self.registry.runtime_for::<C>()?;
        let id = command
            .aggregate_id()
            .ok_or(CqrsError::MissingAggregateId(type_name::<C>()))?;
        let stream = aggregate_stream(runtime.name(), &id);

        let (mut state, version) = self.rehydrate(runtime.as_ref(), id, &stream).await?;

        self.validator.validate(&command)?;

        let mut events = runtime.handle(&*state, &command)?;
        if events.is_empty() {
            tracing::debug!(aggregate = runtime.name(), %id, "command produced no events");
            return Ok(events);
        }
        if let Some(stray) = events.iter().find(|e| e.aggregate_id != id) {
            return Err(CqrsError::Configuration(format!(
                "`{}` handler emitted `{}` for aggregate {} while handling {id}",
                runtime.name(),
                stray.event_type,
                stray.aggregate_id
            )));
        }

        let new_version = self
            .event_store
            .append(&stream, ExpectedVersion::from(version), &events)
            .await?;

        let first = version.map_or(0, |v| v + 1);
        for (offset, event) in events.iter_mut().enumerate() {
            event.version = Some(first + offset as u64);
        }
        runtime.fold(&mut *state, &events)?;

        tracing::info!(
            aggregate = runtime.name(),
            %id,
            count = events.len(),
            version = ?new_version,
            "events appended"
        );

        if let (Some(snapshots), Some(version)) = (&self.snapshots, new_version) {
            // The append already succeeded, so a failed snapshot only costs a longer replay.
            if let Err(err) = self.save_snapshot(snapshots.as_ref(), runtime.as_ref(), id, &state, version).await {
                tracing::warn!(aggregate = runtime.name(), %id, error = %err, "failed to save snapshot");
            }
        }

        Ok(events)
    }

    /// Folds the stream of aggregate `A` with the given ID.
    pub async fn load<A: Aggregate>(&self, id: Uuid) -> Result<AggregateInstance<A>> {
        let runtime = self.registry.runtime_of::<A>()?;
        let stream = aggregate_stream(A::NAME, &id);
        let (state, version) = self.rehydrate(runtime.as_ref(), id, &stream).await?;
        let state = state
            .downcast::<A>()
            .map_err(|_| CqrsError::Configuration(format!("state is not a `{}` aggregate", A::NAME)))?;

        Ok(AggregateInstance {
            id,
            state: *state,
            version,
        })
    }

    async fn rehydrate(
        &self,
        runtime: &dyn AggregateRuntime,
        id: Uuid,
        stream: &str,
    ) -> Result<(State, Option<u64>)> {
        let (mut state, mut version) = match self.restore_snapshot(runtime, id).await {
            Some((state, version)) => (state, Some(version)),
            None => (runtime.new_state(id), None),
        };

        let from = version.map_or(0, |v| v + 1);
        let history = self.event_store.read_from(stream, from).await?;
        if let Some(last) = history.last() {
            version = Some(last.position);
        }

        let events: Vec<Event> = history.into_iter().map(|r| r.event).collect();
        runtime.fold(&mut *state, &events)?;

        Ok((state, version))
    }

    async fn restore_snapshot(&self, runtime: &dyn AggregateRuntime, id: Uuid) -> Option<(State, u64)> {
        let snapshots = self.snapshots.as_ref()?;
        let restored = match snapshots.load_snapshot(runtime.name(), id).await {
            Ok(Some(snapshot)) => runtime
                .restore(snapshot.payload)
                .map(|state| (state, snapshot.version)),
            Ok(None) => return None,
            Err(err) => Err(err),
        };

        match restored {
            Ok(restored) => Some(restored),
            Err(err) => {
                tracing::warn!(
                    aggregate = runtime.name(),
                    %id,
                    error = %err,
                    "unusable snapshot, replaying the full stream"
                );
                None
            }
        }
    }

    async fn save_snapshot(
        &self,
        snapshots: &dyn SnapshotStore,
        runtime: &dyn AggregateRuntime,
        id: Uuid,
        state: &State,
        version: u64,
    ) -> Result<()> {
        let payload = runtime.snapshot(&**state)?;
        snapshots
            .save_snapshot(AggregateSnapshot::new(runtime.name(), id, payload, version))
            .await
    }
}
