use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CqrsError, Result, Uuid};

/// The `SnapshotStore` trait defines the behavior for storing and loading aggregate snapshots.
///
/// Aggregate snapshots are a copy of an aggregate's state at a specific stream version, allowing
/// the dispatcher to read only the events appended after it instead of replaying the whole
/// stream. Snapshots are an optimisation: the event stream stays the source of truth.
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    /// Saves or replaces the snapshot of one aggregate instance.
    async fn save_snapshot(&self, snapshot: AggregateSnapshot) -> Result<()>;

    /// Loads the latest snapshot of one aggregate instance, if any.
    async fn load_snapshot(&self, aggregate: &str, id: Uuid) -> Result<Option<AggregateSnapshot>>;
}

/// The `AggregateSnapshot` struct represents the serialized state of an aggregate instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    /// The aggregate type (its stream category).
    pub aggregate: String,

    /// The ID of the aggregate.
    pub aggregate_id: Uuid,

    /// The serialized payload of the aggregate.
    pub(crate) payload: serde_json::Value,

    /// Stream position of the last event folded into the payload.
    pub version: u64,

    pub taken_at: DateTime<Utc>,
}

impl AggregateSnapshot {
    pub fn new(aggregate: &str, aggregate_id: Uuid, payload: serde_json::Value, version: u64) -> Self {
        Self {
            aggregate: aggregate.to_string(),
            aggregate_id,
            payload,
            version,
            taken_at: Utc::now(),
        }
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
}

/// Snapshot store kept in a `HashMap`, keyed by aggregate type and ID.
#[derive(Clone, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Arc<RwLock<HashMap<(String, Uuid), AggregateSnapshot>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save_snapshot(&self, snapshot: AggregateSnapshot) -> Result<()> {
        let mut snapshots = self
            .snapshots
            .write()
            .map_err(|_| CqrsError::Snapshot("lock poisoned".to_string()))?;
        snapshots.insert(
            (snapshot.aggregate.clone(), snapshot.aggregate_id),
            snapshot,
        );
        Ok(())
    }

    async fn load_snapshot(&self, aggregate: &str, id: Uuid) -> Result<Option<AggregateSnapshot>> {
        let snapshots = self
            .snapshots
            .read()
            .map_err(|_| CqrsError::Snapshot("lock poisoned".to_string()))?;
        Ok(snapshots.get(&(aggregate.to_string(), id)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latest_snapshot_wins() {
        let store = InMemorySnapshotStore::new();
        let id = Uuid::new_v4();

        store
            .save_snapshot(AggregateSnapshot::new("Account", id, serde_json::json!({"balance": 1}), 0))
            .await
            .unwrap();
        store
            .save_snapshot(AggregateSnapshot::new("Account", id, serde_json::json!({"balance": 5}), 3))
            .await
            .unwrap();

        let snapshot = store.load_snapshot("Account", id).await.unwrap().unwrap();
        assert_eq!(snapshot.version, 3);
        assert_eq!(snapshot.payload()["balance"], 5);
        assert!(store.load_snapshot("User", id).await.unwrap().is_none());
    }
}
