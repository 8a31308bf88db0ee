//! In-memory snapshot cache for testing.

use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{Arc, RwLock},
};

use super::{Snapshot, SnapshotCache, SnapshotKey};

type SharedSnapshots = Arc<RwLock<HashMap<SnapshotKey, Snapshot>>>;

/// Thread-safe in-memory [`SnapshotCache`].
///
/// Reference implementation for unit tests and examples; production
/// deployments back the cache with a real blob store.
#[derive(Clone, Debug, Default)]
pub struct InMemorySnapshotCache {
    snapshots: SharedSnapshots,
}

impl InMemorySnapshotCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots
            .read()
            .expect("snapshot cache lock poisoned")
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotCache for InMemorySnapshotCache {
    type Error = Infallible;

    async fn get_snapshot(&self, key: &SnapshotKey) -> Result<Option<Snapshot>, Self::Error> {
        let snapshots = self
            .snapshots
            .read()
            .expect("snapshot cache lock poisoned");
        Ok(snapshots.get(key).cloned())
    }

    async fn set_snapshot(&self, snapshot: Snapshot) -> Result<(), Self::Error> {
        let mut snapshots = self
            .snapshots
            .write()
            .expect("snapshot cache lock poisoned");
        snapshots.insert(snapshot.key.clone(), snapshot);
        Ok(())
    }

    async fn delete_snapshot(&self, key: &SnapshotKey) -> Result<(), Self::Error> {
        let mut snapshots = self
            .snapshots
            .write()
            .expect("snapshot cache lock poisoned");
        snapshots.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::FactId;

    fn snapshot(key: &str) -> Snapshot {
        Snapshot {
            key: SnapshotKey(key.to_string()),
            last_fact: FactId::random(),
            bytes: b"{}".to_vec(),
            compressed: false,
        }
    }

    #[tokio::test]
    async fn get_returns_none_for_missing_key() {
        let cache = InMemorySnapshotCache::new();
        let found = cache.get_snapshot(&SnapshotKey("missing:0".into())).await;
        assert_eq!(found, Ok(None));
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = InMemorySnapshotCache::new();
        let stored = snapshot("p:0");

        cache.set_snapshot(stored.clone()).await.unwrap();

        let found = cache.get_snapshot(&stored.key).await.unwrap();
        assert_eq!(found, Some(stored));
    }

    #[tokio::test]
    async fn set_overwrites_previous_snapshot() {
        let cache = InMemorySnapshotCache::new();
        cache.set_snapshot(snapshot("p:0")).await.unwrap();
        let newer = snapshot("p:0");
        cache.set_snapshot(newer.clone()).await.unwrap();

        assert_eq!(cache.len(), 1);
        let found = cache.get_snapshot(&newer.key).await.unwrap().unwrap();
        assert_eq!(found.last_fact, newer.last_fact);
    }

    #[tokio::test]
    async fn delete_removes_snapshot() {
        let cache = InMemorySnapshotCache::new();
        let stored = snapshot("p:0");
        cache.set_snapshot(stored.clone()).await.unwrap();

        cache.delete_snapshot(&stored.key).await.unwrap();

        assert!(cache.is_empty());
    }
}
