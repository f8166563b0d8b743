//! In-memory snapshot store implementation.

use std::{
    collections::HashMap,
    convert::Infallible,
    hash::Hash,
    sync::{Arc, PoisonError, RwLock},
};

use super::{Snapshot, SnapshotStore};
use crate::shard::Location;

type SnapshotMap<Id> = HashMap<SnapshotKey<Id>, Snapshot>;

/// In-memory snapshot store.
///
/// Reference implementation for tests and development. Keeps the highest
/// version per `(table, id)`; older or equal saves are ignored.
#[derive(Clone, Debug)]
pub struct Store<Id> {
    snapshots: Arc<RwLock<SnapshotMap<Id>>>,
}

impl<Id> Store<Id> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            snapshots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of stored snapshots across all entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<Id> Default for Store<Id> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id> SnapshotStore<Id> for Store<Id>
where
    Id: Clone + Eq + Hash + Send + Sync + 'static,
{
    type Error = Infallible;

    #[tracing::instrument(skip(self, state_id))]
    async fn load<'a>(
        &'a self,
        location: &'a Location,
        state_id: &'a Id,
    ) -> Result<Option<Snapshot>, Infallible> {
        let key = SnapshotKey::new(location, state_id.clone());
        let snapshot = self
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();
        tracing::trace!(found = snapshot.is_some(), "snapshot lookup");
        Ok(snapshot)
    }

    #[tracing::instrument(skip(self, state_id, snapshot), fields(version = snapshot.version))]
    async fn save<'a>(
        &'a self,
        location: &'a Location,
        state_id: &'a Id,
        snapshot: Snapshot,
    ) -> Result<(), Infallible> {
        let key = SnapshotKey::new(location, state_id.clone());
        let mut snapshots = self
            .snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let stored = match snapshots.get(&key) {
            Some(existing) if existing.version >= snapshot.version => false,
            _ => {
                snapshots.insert(key, snapshot);
                true
            }
        };
        drop(snapshots);
        tracing::debug!(stored, "snapshot save evaluated");
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
struct SnapshotKey<Id> {
    table: String,
    id: Id,
}

impl<Id> SnapshotKey<Id> {
    fn new(location: &Location, id: Id) -> Self {
        Self {
            table: location.table.clone(),
            id,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn snapshot(version: u64, data: &str) -> Snapshot {
        Snapshot {
            version,
            data: data.as_bytes().to_vec(),
            taken_at: Utc::now(),
        }
    }

    fn location() -> Location {
        Location::new("default", "account_snapshot")
    }

    #[tokio::test]
    async fn load_returns_none_for_missing() {
        let store = Store::<String>::new();
        let loaded = store.load(&location(), &"a-1".to_string()).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn save_is_idempotent_per_version() {
        let store = Store::<String>::new();
        let id = "a-1".to_string();
        store.save(&location(), &id, snapshot(5, "five")).await.unwrap();
        store.save(&location(), &id, snapshot(5, "five")).await.unwrap();
        assert_eq!(store.len(), 1);

        let loaded = store.load(&location(), &id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 5);
        assert_eq!(loaded.data, b"five");
    }

    #[tokio::test]
    async fn save_keeps_newer_snapshot() {
        let store = Store::<String>::new();
        let id = "a-1".to_string();
        store.save(&location(), &id, snapshot(10, "ten")).await.unwrap();
        store.save(&location(), &id, snapshot(4, "four")).await.unwrap();

        let loaded = store.load(&location(), &id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 10);
        assert_eq!(loaded.data, b"ten");
    }
}
