use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use crate::Uuid;

pub(crate) type KeyFn<E> = Arc<dyn Fn(&E) -> Option<Uuid> + Send + Sync>;

/// Cache key declarations of one entity type.
pub(crate) struct KeySchema<E> {
    pub(crate) primary: Option<KeyFn<E>>,
    pub(crate) foreign: Vec<(&'static str, KeyFn<E>)>,
}

impl<E> KeySchema<E> {
    pub(crate) fn single() -> Self {
        Self {
            primary: None,
            foreign: Vec::new(),
        }
    }

    pub(crate) fn has_index(&self, index: &str) -> bool {
        self.foreign.iter().any(|(name, _)| *name == index)
    }

    /// Foreign-key values of `entity`, in declaration order.
    pub(crate) fn foreign_keys(&self, entity: &E) -> Vec<Option<Uuid>> {
        self.foreign.iter().map(|(_, extract)| extract(entity)).collect()
    }
}

/// The query-serving state of a read-model instance.
///
/// Entities are stored by primary key; every declared foreign key gets a secondary index
/// from foreign-key value to the primary keys of the entities carrying it. Both are updated
/// together by the projection engine, and a query only ever sees the cache between two
/// updates.
///
/// Single-object read models store their object under [`Uuid::nil`], see [`single`](Self::single).
pub struct ReadModelCache<E> {
    schema: Arc<KeySchema<E>>,
    entries: HashMap<Uuid, E>,
    foreign: HashMap<&'static str, HashMap<Uuid, BTreeSet<Uuid>>>,
}

impl<E> ReadModelCache<E> {
    pub(crate) fn new(schema: Arc<KeySchema<E>>) -> Self {
        let foreign = schema
            .foreign
            .iter()
            .map(|(name, _)| (*name, HashMap::new()))
            .collect();
        Self {
            schema,
            entries: HashMap::new(),
            foreign,
        }
    }

    pub fn get(&self, key: &Uuid) -> Option<&E> {
        self.entries.get(key)
    }

    /// The cached object of a single-object read model.
    pub fn single(&self) -> Option<&E> {
        self.entries.get(&Uuid::nil())
    }

    /// Primary keys of the entities whose foreign key `index` equals `key`, in key order.
    pub fn keys_by(&self, index: &str, key: &Uuid) -> Vec<Uuid> {
        self.foreign
            .get(index)
            .and_then(|idx| idx.get(key))
            .map(|keys| keys.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Entities whose foreign key `index` equals `key`, in primary key order.
    pub fn find_by(&self, index: &str, key: &Uuid) -> Vec<&E> {
        self.keys_by(index, key)
            .iter()
            .filter_map(|pk| self.entries.get(pk))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Uuid, &E)> {
        self.entries.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &E> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts or replaces the entity stored under `key`, re-indexing its foreign keys.
    pub(crate) fn upsert(&mut self, key: Uuid, entity: E) {
        self.unindex(&key);
        for (name, extract) in &self.schema.foreign {
            if let Some(value) = extract(&entity) {
                self.foreign
                    .entry(*name)
                    .or_default()
                    .entry(value)
                    .or_default()
                    .insert(key);
            }
        }
        self.entries.insert(key, entity);
    }

    fn unindex(&mut self, key: &Uuid) {
        let Some(previous) = self.entries.get(key) else {
            return;
        };
        for (name, extract) in &self.schema.foreign {
            let Some(value) = extract(previous) else {
                continue;
            };
            if let Some(index) = self.foreign.get_mut(name) {
                if let Some(keys) = index.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(&value);
                    }
                }
            }
        }
    }

    /// Checks that the secondary indexes match the stored entities exactly: every indexed
    /// key resolves to a stored entity carrying that foreign key, and every foreign key of
    /// a stored entity is indexed.
    pub fn is_consistent(&self) -> bool {
        for (name, extract) in &self.schema.foreign {
            let Some(index) = self.foreign.get(name) else {
                return false;
            };
            for (value, keys) in index {
                if keys.is_empty() {
                    return false;
                }
                for key in keys {
                    match self.entries.get(key) {
                        Some(entity) if extract(entity) == Some(*value) => {}
                        _ => return false,
                    }
                }
            }
            for (key, entity) in &self.entries {
                if let Some(value) = extract(entity) {
                    if !index.get(&value).is_some_and(|keys| keys.contains(key)) {
                        return false;
                    }
                }
            }
        }

        if let Some(primary) = &self.schema.primary {
            return self
                .entries
                .iter()
                .all(|(key, entity)| primary(entity).is_none_or(|pk| pk == *key));
        }
        true
    }
}
