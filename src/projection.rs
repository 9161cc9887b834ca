//! The projection engine: keeps read-model caches in step with their source streams.
//!
//! Every read model owns at most one live instance at a time. Subscribed streams are
//! tailed by one background task per stream, fanning each event out to every read model
//! declaring it; unsubscribed streams are read from the per-stream checkpoint right before
//! each query. Subscriptions outlive instances: a delivery finding no instance builds one,
//! except for read models rebuilt by every query, which drop it since their next query
//! replays every declared stream from the start.

use std::{
    any::{Any, TypeId},
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tokio_stream::StreamExt;

use crate::{
    config::EngineConfig,
    read_model::{
        cache::ReadModelCache, registry::ReadModelRegistry, Entity, Lifecycle, ReadModelDescriptor,
        RegisteredReadModel, Route,
    },
    CqrsError, Event, EventStore, Query, RecordedEvent, Result, Subscription, Uuid,
};

pub(crate) type QueryOutput = Option<Box<dyn Any + Send>>;

/// Foreign-routed events by foreign-key index and key value.
type Joined = HashMap<(&'static str, Uuid), Vec<Event>>;

/// A registered read model, ready to be turned into its runtime.
pub(crate) trait ReadModelBlueprint: ReadModelDescriptor {
    fn instantiate(
        self: Arc<Self>,
        store: Arc<dyn EventStore>,
        config: &EngineConfig,
    ) -> Arc<dyn ReadModelRuntime>;
}

impl<E: Entity> ReadModelBlueprint for RegisteredReadModel<E> {
    fn instantiate(
        self: Arc<Self>,
        store: Arc<dyn EventStore>,
        config: &EngineConfig,
    ) -> Arc<dyn ReadModelRuntime> {
        Arc::new(Projection::new(self, store, config.clone()))
    }
}

/// Type-erased face of a projection, as driven by the engine.
#[async_trait]
pub(crate) trait ReadModelRuntime: Send + Sync {
    fn model(&self) -> &dyn ReadModelDescriptor;

    /// Whether the engine builds the instance when it starts.
    fn materialized_at_start(&self) -> bool;

    /// Builds the instance if there is none.
    async fn materialize(&self) -> Result<()>;

    /// Folds one event read from a subscribed stream.
    async fn deliver(&self, recorded: &RecordedEvent) -> Result<()>;

    /// Reads `stream` from the checkpoint of the current instance, if any.
    async fn resync(&self, stream: &str) -> Result<()>;

    /// Reads every unsubscribed stream from its checkpoint, if an instance exists.
    async fn catch_up(&self) -> Result<()>;

    async fn query(&self, query_type: TypeId, query: &(dyn Any + Send + Sync)) -> Result<QueryOutput>;

    /// Destroys an ephemeral instance nobody queried for its idle timeout.
    async fn evict_if_idle(&self, now: Instant) -> bool;

    async fn is_materialized(&self) -> bool;
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The ids of the last `capacity` events folded.
struct RecentIds {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Records `id`. Returns `false` if it is already in the window.
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.ids.remove(&oldest);
        }
        true
    }
}

/// One materialized read model: its cache and how far it has read each source stream.
struct Instance<E: Entity> {
    cache: RwLock<ReadModelCache<E>>,
    partitions: Vec<Mutex<()>>,
    checkpoints: HashMap<String, tokio::sync::Mutex<Option<u64>>>,
    seen: Mutex<RecentIds>,
    joined: Mutex<Joined>,
}

impl<E: Entity> Instance<E> {
    fn new(model: &RegisteredReadModel<E>, config: &EngineConfig) -> Self {
        Self {
            cache: RwLock::new(ReadModelCache::new(model.schema.clone())),
            partitions: (0..config.partitions.max(1)).map(|_| Mutex::new(())).collect(),
            checkpoints: model
                .sources
                .iter()
                .map(|source| (source.stream_name(), tokio::sync::Mutex::new(None)))
                .collect(),
            seen: Mutex::new(RecentIds::new(config.dedup_window)),
            joined: Mutex::new(HashMap::new()),
        }
    }

    fn checkpoint(&self, stream: &str) -> Result<&tokio::sync::Mutex<Option<u64>>> {
        self.checkpoints
            .get(stream)
            .ok_or_else(|| CqrsError::Configuration(format!("stream `{stream}` is not a source")))
    }

    /// Locks the partitions owning `keys`, in ascending order.
    fn lock_partitions(&self, keys: &[Uuid]) -> Vec<MutexGuard<'_, ()>> {
        let count = self.partitions.len() as u128;
        let mut owners: Vec<usize> = keys.iter().map(|key| (key.as_u128() % count) as usize).collect();
        owners.sort_unstable();
        owners.dedup();
        owners.into_iter().map(|p| lock(&self.partitions[p])).collect()
    }

    /// Applies `event`, read from `stream`, to the entities it routes to.
    ///
    /// Appliers run on copies; the copies replace the cached entities in one write, so no
    /// reader sees the indexes half updated. Foreign-routed events are kept per key and
    /// replayed onto entities that take that key later, so the cache does not depend on
    /// which source stream delivered first.
    fn fold(&self, model: &RegisteredReadModel<E>, stream: &str, event: &Event) -> Result<()> {
        if model.folded_elsewhere(stream, &event.event_type) {
            return Ok(());
        }
        let Some(applier) = model.appliers.get(event.event_type.as_str()) else {
            return Ok(());
        };
        if !lock(&self.seen).insert(event.id) {
            return Ok(());
        }

        let failed = |source: anyhow::Error| CqrsError::ProjectionApply {
            read_model: model.name.clone(),
            event_id: event.id,
            event_type: event.event_type.clone(),
            source,
        };

        let (keys, create) = match &applier.route {
            Route::AggregateId => (vec![event.aggregate_id], true),
            Route::Single => (vec![Uuid::nil()], true),
            Route::Correlated(correlate) => match correlate(event).map_err(|e| failed(e.into()))? {
                Some(key) => (vec![key], true),
                None => return Ok(()),
            },
            Route::Foreign(index) => {
                let mut joined = lock(&self.joined);
                joined
                    .entry((*index, event.aggregate_id))
                    .or_default()
                    .push(event.clone());
                (read(&self.cache).keys_by(index, &event.aggregate_id), false)
            }
        };
        if keys.is_empty() {
            return Ok(());
        }

        let _partitions = self.lock_partitions(&keys);

        let mut updated = Vec::with_capacity(keys.len());
        {
            let cache = read(&self.cache);
            for key in keys {
                let entity = match cache.get(&key) {
                    Some(entity) => entity.clone(),
                    None if create => E::default(),
                    None => continue,
                };
                updated.push((key, model.schema.foreign_keys(&entity), entity));
            }
        }

        // Held until the write so a foreign event either sees the new entity or is replayed.
        let joined = lock(&self.joined);
        for (key, before, entity) in &mut updated {
            (applier.apply)(entity, event).map_err(failed)?;
            replay_joined(model, &joined, before, entity);
            if let Some(primary) = &model.schema.primary
                && let Some(pk) = primary(&*entity).filter(|pk| *pk != *key)
            {
                return Err(failed(anyhow::anyhow!(
                    "entity routed to {key} reports primary key {pk}"
                )));
            }
        }

        let mut cache = write(&self.cache);
        for (key, _, entity) in updated {
            cache.upsert(key, entity);
        }
        Ok(())
    }

    /// Runs the handler against the cache unless an update holds it.
    fn try_query(
        &self,
        handler: &crate::read_model::QueryFn<E>,
        query: &dyn Any,
    ) -> Option<anyhow::Result<QueryOutput>> {
        let cache = match self.cache.try_read() {
            Ok(cache) => cache,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        Some(handler(&*cache, query))
    }

    fn len(&self) -> usize {
        read(&self.cache).len()
    }
}

/// Applies the foreign events recorded under every key `entity` took since `before`.
fn replay_joined<E: Entity>(
    model: &RegisteredReadModel<E>,
    joined: &Joined,
    before: &[Option<Uuid>],
    entity: &mut E,
) {
    for ((index, extract), previous) in model.schema.foreign.iter().zip(before) {
        let Some(key) = extract(&*entity).filter(|key| Some(*key) != *previous) else {
            continue;
        };
        for event in joined.get(&(*index, key)).into_iter().flatten() {
            let Some(applier) = model.appliers.get(event.event_type.as_str()) else {
                continue;
            };
            if let Err(err) = (applier.apply)(entity, event) {
                tracing::warn!(
                    read_model = %model.name,
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %err,
                    "skipping foreign event"
                );
            }
        }
    }
}

struct Slot<E: Entity> {
    instance: Option<Arc<Instance<E>>>,
    in_flight: usize,
    last_access: Instant,
}

/// A query's hold on an instance. Dropping it releases the instance, also when the query
/// future is dropped midway.
struct Lease<'a, E: Entity> {
    projection: &'a Projection<E>,
    instance: Arc<Instance<E>>,
}

impl<E: Entity> Drop for Lease<'_, E> {
    fn drop(&mut self) {
        self.projection.release();
    }
}

/// Runtime of one read model: its definition and the slot its instance lives in.
struct Projection<E: Entity> {
    model: Arc<RegisteredReadModel<E>>,
    store: Arc<dyn EventStore>,
    config: EngineConfig,
    slot: Mutex<Slot<E>>,
    building: tokio::sync::Mutex<()>,
}

impl<E: Entity> Projection<E> {
    fn new(model: Arc<RegisteredReadModel<E>>, store: Arc<dyn EventStore>, config: EngineConfig) -> Self {
        Self {
            model,
            store,
            config,
            slot: Mutex::new(Slot {
                instance: None,
                in_flight: 0,
                last_access: Instant::now(),
            }),
            building: tokio::sync::Mutex::new(()),
        }
    }

    fn current(&self) -> Option<Arc<Instance<E>>> {
        lock(&self.slot).instance.clone()
    }

    /// The current instance, built first if there is none. Only one build runs at a time.
    async fn current_or_build(&self) -> Result<Arc<Instance<E>>> {
        if let Some(instance) = self.current() {
            return Ok(instance);
        }
        let _building = self.building.lock().await;
        if let Some(instance) = self.current() {
            return Ok(instance);
        }

        let instance = self.build().await?;
        let mut slot = lock(&self.slot);
        slot.instance = Some(instance.clone());
        slot.last_access = Instant::now();
        Ok(instance)
    }

    /// Replays every source stream into a fresh instance.
    async fn build(&self) -> Result<Arc<Instance<E>>> {
        let instance = Instance::new(&self.model, &self.config);
        for source in &self.model.sources {
            let stream = source.stream_name();
            let mut checkpoint = instance.checkpoint(&stream)?.lock().await;
            self.read_into(&instance, &stream, &mut checkpoint).await?;
        }

        tracing::info!(
            read_model = %self.model.name,
            entries = instance.len(),
            "read model materialized"
        );
        Ok(Arc::new(instance))
    }

    /// Folds what `stream` holds past `checkpoint`, moving the checkpoint along.
    async fn read_into(
        &self,
        instance: &Instance<E>,
        stream: &str,
        checkpoint: &mut Option<u64>,
    ) -> Result<()> {
        let from = checkpoint.map_or(0, |c| c + 1);
        let history = self.store.read_from(stream, from).await?;
        for recorded in history {
            self.fold_logged(instance, stream, &recorded.event);
            *checkpoint = Some(recorded.position);
        }
        Ok(())
    }

    fn fold_logged(&self, instance: &Instance<E>, stream: &str, event: &Event) {
        if let Err(err) = instance.fold(&self.model, stream, event) {
            tracing::warn!(
                read_model = %self.model.name,
                event_id = %event.id,
                event_type = %event.event_type,
                error = %err,
                "skipping event"
            );
        }
    }

    async fn acquire(&self) -> Result<Lease<'_, E>> {
        let instance = self.current_or_build().await?;
        let mut slot = lock(&self.slot);
        slot.in_flight += 1;
        slot.last_access = Instant::now();
        Ok(Lease {
            projection: self,
            instance,
        })
    }

    fn release(&self) {
        let mut slot = lock(&self.slot);
        slot.in_flight = slot.in_flight.saturating_sub(1);
        slot.last_access = Instant::now();

        if self.model.lifecycle.is_per_query() && slot.in_flight == 0 && slot.instance.take().is_some() {
            tracing::debug!(read_model = %self.model.name, "read model destroyed after query");
        }
    }

    async fn catch_up_instance(&self, instance: &Instance<E>) -> Result<()> {
        for source in self.model.sources.iter().filter(|s| !s.subscribed) {
            let stream = source.stream_name();
            let mut checkpoint = instance.checkpoint(&stream)?.lock().await;
            self.read_into(instance, &stream, &mut checkpoint).await?;
        }
        Ok(())
    }

    /// Polls the cache until it is free or the configured wait runs out.
    async fn wait_and_query(
        &self,
        instance: &Instance<E>,
        query_type: TypeId,
        query: &(dyn Any + Send + Sync),
    ) -> Result<QueryOutput> {
        let (_, handler) = self.model.queries.get(&query_type).ok_or_else(|| {
            CqrsError::Configuration(format!("read model `{}` has no such query handler", self.model.name))
        })?;

        let started = Instant::now();
        loop {
            if let Some(result) = instance.try_query(handler, query) {
                return result.map_err(|source| CqrsError::QueryHandler {
                    read_model: self.model.name.clone(),
                    source,
                });
            }
            let waited = started.elapsed();
            if waited >= self.config.query_wait {
                return Err(CqrsError::QueryTimeout {
                    read_model: self.model.name.clone(),
                    waited,
                });
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[async_trait]
impl<E: Entity> ReadModelRuntime for Projection<E> {
    fn model(&self) -> &dyn ReadModelDescriptor {
        self.model.as_ref()
    }

    fn materialized_at_start(&self) -> bool {
        self.model.materialized_at_start()
    }

    async fn materialize(&self) -> Result<()> {
        self.current_or_build().await.map(|_| ())
    }

    async fn deliver(&self, recorded: &RecordedEvent) -> Result<()> {
        let instance = match self.current() {
            Some(instance) => instance,
            None if self.model.builds_on_delivery() => self.current_or_build().await?,
            None => {
                tracing::trace!(
                    read_model = %self.model.name,
                    position = recorded.position,
                    "no instance, event dropped"
                );
                return Ok(());
            }
        };

        let mut checkpoint = instance.checkpoint(&recorded.stream)?.lock().await;
        let next = checkpoint.map_or(0, |c| c + 1);
        if recorded.position < next {
            return Ok(());
        }
        if recorded.position > next {
            tracing::debug!(
                read_model = %self.model.name,
                stream = %recorded.stream,
                expected = next,
                got = recorded.position,
                "gap in subscription, catching up"
            );
            return self.read_into(&instance, &recorded.stream, &mut checkpoint).await;
        }

        self.fold_logged(&instance, &recorded.stream, &recorded.event);
        *checkpoint = Some(recorded.position);
        Ok(())
    }

    async fn resync(&self, stream: &str) -> Result<()> {
        let Some(instance) = self.current() else {
            return Ok(());
        };
        let mut checkpoint = instance.checkpoint(stream)?.lock().await;
        self.read_into(&instance, stream, &mut checkpoint).await
    }

    async fn catch_up(&self) -> Result<()> {
        match self.current() {
            Some(instance) => self.catch_up_instance(&instance).await,
            None => Ok(()),
        }
    }

    async fn query(&self, query_type: TypeId, query: &(dyn Any + Send + Sync)) -> Result<QueryOutput> {
        let lease = self.acquire().await?;
        self.catch_up_instance(&lease.instance).await?;
        self.wait_and_query(&lease.instance, query_type, query).await
    }

    async fn evict_if_idle(&self, now: Instant) -> bool {
        let Lifecycle::Ephemeral { idle_timeout } = self.model.lifecycle else {
            return false;
        };
        let mut slot = lock(&self.slot);
        if slot.instance.is_none()
            || slot.in_flight > 0
            || now.saturating_duration_since(slot.last_access) < idle_timeout
        {
            return false;
        }

        slot.instance = None;
        tracing::info!(read_model = %self.model.name, ?idle_timeout, "idle read model destroyed");
        true
    }

    async fn is_materialized(&self) -> bool {
        lock(&self.slot).instance.is_some()
    }
}

struct Task {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Task {
    async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.handle.await {
            tracing::error!(error = %err, "projection task panicked");
        }
    }
}

#[derive(Default)]
struct Tasks {
    tails: HashMap<String, Task>,
    reaper: Option<Task>,
}

/// Owns the read-model runtimes and the background tasks feeding and evicting them.
pub struct ProjectionEngine {
    registry: Arc<ReadModelRegistry>,
    store: Arc<dyn EventStore>,
    config: EngineConfig,
    runtimes: Vec<Arc<dyn ReadModelRuntime>>,
    tasks: tokio::sync::Mutex<Tasks>,
}

impl ProjectionEngine {
    pub fn new(registry: Arc<ReadModelRegistry>, store: Arc<dyn EventStore>, config: EngineConfig) -> Self {
        let runtimes = registry
            .blueprints()
            .iter()
            .map(|blueprint| blueprint.clone().instantiate(store.clone(), &config))
            .collect();

        Self {
            registry,
            store,
            config,
            runtimes,
            tasks: tokio::sync::Mutex::new(Tasks::default()),
        }
    }

    pub fn registry(&self) -> &ReadModelRegistry {
        &self.registry
    }

    /// Subscribes to every subscribed stream, materializes the persistent read models and
    /// the ephemeral ones fed by a subscription, then starts the idle sweep. Calling it
    /// again is a no-op.
    ///
    /// Subscriptions are opened before materializing, so nothing appended in between is
    /// missed.
    pub async fn start(&self) -> Result<()> {
        self.config.validate()?;

        let mut tasks = self.tasks.lock().await;
        if !tasks.tails.is_empty() || tasks.reaper.is_some() {
            return Ok(());
        }

        let mut subscribers: HashMap<String, Vec<Arc<dyn ReadModelRuntime>>> = HashMap::new();
        for runtime in &self.runtimes {
            for source in runtime.model().sources().iter().filter(|s| s.subscribed) {
                subscribers
                    .entry(source.stream_name())
                    .or_default()
                    .push(runtime.clone());
            }
        }

        let mut subscriptions = Vec::with_capacity(subscribers.len());
        for (stream, runtimes) in subscribers {
            let subscription = self.store.subscribe(&stream, None).await?;
            subscriptions.push((stream, subscription, runtimes));
        }

        for runtime in self.runtimes.iter().filter(|runtime| runtime.materialized_at_start()) {
            runtime.materialize().await?;
        }

        for (stream, subscription, runtimes) in subscriptions {
            let (stop, stopped) = watch::channel(false);
            tracing::info!(%stream, read_models = runtimes.len(), "subscribed");
            let handle = tokio::spawn(tail(stream.clone(), subscription, runtimes, stopped));
            tasks.tails.insert(stream, Task { stop, handle });
        }

        let ephemeral = self.runtimes.iter().any(|runtime| {
            let lifecycle = runtime.model().lifecycle();
            lifecycle != Lifecycle::Persistent && !lifecycle.is_per_query()
        });
        if ephemeral {
            let (stop, stopped) = watch::channel(false);
            let handle = tokio::spawn(reap(self.runtimes.clone(), self.config.eviction_interval, stopped));
            tasks.reaper = Some(Task { stop, handle });
        }

        Ok(())
    }

    /// Tears down the subscription to `stream`. Returns whether one was active.
    ///
    /// Read models sourcing the stream keep their instance; they just stop receiving its
    /// events until they are rebuilt.
    pub async fn unsubscribe(&self, stream: &str) -> bool {
        let task = self.tasks.lock().await.tails.remove(stream);
        match task {
            Some(task) => {
                task.stop().await;
                tracing::info!(%stream, "unsubscribed");
                true
            }
            None => false,
        }
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.tasks.lock().await.tails.keys().cloned().collect()
    }

    /// Stops every subscription and the idle sweep.
    pub async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for (_, task) in tasks.tails {
            task.stop().await;
        }
        if let Some(reaper) = tasks.reaper {
            reaper.stop().await;
        }
        tracing::info!("projection engine stopped");
    }

    pub async fn is_materialized(&self, read_model: &str) -> Result<bool> {
        let index = self
            .registry
            .position(read_model)
            .ok_or_else(|| CqrsError::Configuration(format!("unknown read model `{read_model}`")))?;
        Ok(self.runtimes[index].is_materialized().await)
    }

    /// Reads the unsubscribed streams of every live instance up to their end.
    pub async fn catch_up(&self) -> Result<()> {
        for runtime in &self.runtimes {
            runtime.catch_up().await?;
        }
        Ok(())
    }

    pub(crate) fn runtime_for<Q: Query>(&self) -> Result<Arc<dyn ReadModelRuntime>> {
        let index = self.registry.index_of::<Q>()?;
        Ok(self.runtimes[index].clone())
    }
}

async fn tail(
    stream: String,
    mut subscription: Subscription,
    runtimes: Vec<Arc<dyn ReadModelRuntime>>,
    mut stopped: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stopped.changed() => break,
            next = subscription.next() => match next {
                Some(Ok(recorded)) => {
                    for runtime in &runtimes {
                        if let Err(err) = runtime.deliver(&recorded).await {
                            tracing::error!(
                                %stream,
                                read_model = runtime.model().name(),
                                error = %err,
                                "delivery failed"
                            );
                        }
                    }
                }
                Some(Err(CqrsError::SubscriptionLagged { missed, .. })) => {
                    tracing::warn!(%stream, missed, "subscription lagged, resynchronising");
                    for runtime in &runtimes {
                        if let Err(err) = runtime.resync(&stream).await {
                            tracing::error!(
                                %stream,
                                read_model = runtime.model().name(),
                                error = %err,
                                "resync failed"
                            );
                        }
                    }
                }
                Some(Err(err)) => {
                    tracing::error!(%stream, error = %err, "subscription error");
                }
                None => {
                    tracing::info!(%stream, "subscription ended");
                    break;
                }
            },
        }
    }
}

async fn reap(
    runtimes: Vec<Arc<dyn ReadModelRuntime>>,
    period: Duration,
    mut stopped: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = stopped.changed() => break,
            _ = interval.tick() => {
                let now = Instant::now();
                for runtime in &runtimes {
                    runtime.evict_if_idle(now).await;
                }
            }
        }
    }
}
