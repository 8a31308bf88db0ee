//! Snapshot persistence.
//!
//! Snapshots pin a serialized projection state to a cursor so later
//! materializations replay only the facts past it. This module provides:
//!
//! - [`Snapshot`] and the versioned [`SnapshotKey`] layout
//! - [`SnapshotCache`] - the blob-store contract (an external collaborator)
//! - [`SnapshotSerializer`] with the JSON default
//! - the two repositories the engine goes through:
//!   [`ProjectionSnapshotRepository`] and [`AggregateSnapshotRepository`]
//! - [`inmemory`] - reference cache implementation

use std::{fmt, future::Future, sync::Arc};

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    event::SerializationError,
    fact::FactId,
    projection::{Aggregate, SnapshotProjection, SnapshotState},
};

pub mod inmemory;

/// Key under which a snapshot is stored.
///
/// The rendered layout is stable and observable in the backing store:
/// `<name>:<schema-version>` for projections, with `:<aggregate-uuid>`
/// appended for aggregates. Bumping a type's schema version therefore
/// orphans all of its previous snapshots.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotKey(String);

impl SnapshotKey {
    #[must_use]
    pub fn for_projection<P: SnapshotState>() -> Self {
        Self(format!("{}:{}", P::NAME, P::SCHEMA_VERSION))
    }

    #[must_use]
    pub fn for_aggregate<A: Aggregate>(id: Uuid) -> Self {
        Self(format!("{}:{}:{}", A::NAME, A::SCHEMA_VERSION, id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A serialized projection state pinned to a cursor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub key: SnapshotKey,
    /// Cursor the serialized state reflects: all matching facts up to and
    /// including this one have been applied.
    pub last_fact: FactId,
    pub bytes: Vec<u8>,
    /// Whether `bytes` are already compressed by the serializer.
    pub compressed: bool,
}

/// The blob store snapshots live in.
///
/// Payloads are opaque to the cache. All operations may suspend.
pub trait SnapshotCache: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn get_snapshot(
        &self,
        key: &SnapshotKey,
    ) -> impl Future<Output = Result<Option<Snapshot>, Self::Error>> + Send;

    fn set_snapshot(&self, snapshot: Snapshot)
    -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn delete_snapshot(
        &self,
        key: &SnapshotKey,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Snapshot payload codec.
///
/// Implementations that compress report it via
/// [`includes_compression`](Self::includes_compression) so the flag is
/// persisted alongside the bytes.
pub trait SnapshotSerializer: Clone + Send + Sync + 'static {
    /// # Errors
    ///
    /// Returns [`SerializationError::Encode`] when the projection cannot
    /// be encoded.
    fn serialize<P: Serialize>(&self, projection: &P) -> Result<Vec<u8>, SerializationError>;

    /// # Errors
    ///
    /// Returns [`SerializationError::Decode`] when the bytes do not parse
    /// as `P`.
    fn deserialize<P: DeserializeOwned>(&self, bytes: &[u8]) -> Result<P, SerializationError>;

    fn includes_compression(&self) -> bool {
        false
    }
}

/// JSON serializer over the projection's serde shape. The default.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSnapshotSerializer;

impl SnapshotSerializer for JsonSnapshotSerializer {
    fn serialize<P: Serialize>(&self, projection: &P) -> Result<Vec<u8>, SerializationError> {
        serde_json::to_vec(projection).map_err(SerializationError::Encode)
    }

    fn deserialize<P: DeserializeOwned>(&self, bytes: &[u8]) -> Result<P, SerializationError> {
        serde_json::from_slice(bytes).map_err(|source| SerializationError::Decode {
            target: std::any::type_name::<P>().to_string(),
            source,
        })
    }
}

/// Snapshot cache i/o failure.
#[derive(Debug, Error)]
#[error("snapshot cache i/o failed: {0}")]
pub struct SnapshotIoError<E: std::error::Error + 'static>(#[source] pub E);

/// Failure to persist a snapshot synchronously.
#[derive(Debug, Error)]
pub enum SnapshotWriteError<E: std::error::Error + 'static> {
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error("snapshot cache i/o failed: {0}")]
    Cache(#[source] E),
}

/// Read/write versioned snapshots for projections without instance
/// identity.
pub struct ProjectionSnapshotRepository<C, S> {
    cache: Arc<C>,
    serializer: S,
}

impl<C, S> Clone for ProjectionSnapshotRepository<C, S>
where
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            serializer: self.serializer.clone(),
        }
    }
}

impl<C, S> ProjectionSnapshotRepository<C, S>
where
    C: SnapshotCache,
    S: SnapshotSerializer,
{
    pub fn new(cache: Arc<C>, serializer: S) -> Self {
        Self { cache, serializer }
    }

    /// Latest snapshot under the projection's current version key.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotIoError`] when the cache read fails; callers
    /// treat this as a miss.
    pub async fn find_latest<P: SnapshotProjection>(
        &self,
    ) -> Result<Option<Snapshot>, SnapshotIoError<C::Error>> {
        let key = SnapshotKey::for_projection::<P>();
        let found = self.cache.get_snapshot(&key).await.map_err(SnapshotIoError)?;
        tracing::trace!(key = %key, found = found.is_some(), "snapshot lookup");
        Ok(found)
    }

    /// Serialize and persist asynchronously.
    ///
    /// The cache write happens on a background task; write failures are
    /// logged there and discarded. The returned handle lets tests await
    /// the write.
    ///
    /// # Errors
    ///
    /// Returns [`SerializationError`] when the projection cannot be
    /// encoded; nothing is written in that case.
    pub fn put<P: SnapshotProjection>(
        &self,
        projection: &P,
        cursor: FactId,
    ) -> Result<JoinHandle<()>, SerializationError> {
        let snapshot = Snapshot {
            key: SnapshotKey::for_projection::<P>(),
            last_fact: cursor,
            bytes: self.serializer.serialize(projection)?,
            compressed: self.serializer.includes_compression(),
        };
        Ok(spawn_write(Arc::clone(&self.cache), snapshot))
    }

    /// Decode a snapshot previously returned by
    /// [`find_latest`](Self::find_latest).
    ///
    /// # Errors
    ///
    /// Returns [`SerializationError::Decode`] when the bytes do not parse;
    /// callers treat the snapshot as absent and rebuild.
    pub fn decode<P: SnapshotProjection>(
        &self,
        snapshot: &Snapshot,
    ) -> Result<P, SerializationError> {
        self.serializer.deserialize(&snapshot.bytes)
    }
}

/// Read/write versioned snapshots keyed by (projection, aggregate id).
pub struct AggregateSnapshotRepository<C, S> {
    cache: Arc<C>,
    serializer: S,
}

impl<C, S> Clone for AggregateSnapshotRepository<C, S>
where
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            serializer: self.serializer.clone(),
        }
    }
}

impl<C, S> AggregateSnapshotRepository<C, S>
where
    C: SnapshotCache,
    S: SnapshotSerializer,
{
    pub fn new(cache: Arc<C>, serializer: S) -> Self {
        Self { cache, serializer }
    }

    /// # Errors
    ///
    /// Returns [`SnapshotIoError`] when the cache read fails; callers
    /// treat this as a miss.
    pub async fn find_latest<A: Aggregate>(
        &self,
        id: Uuid,
    ) -> Result<Option<Snapshot>, SnapshotIoError<C::Error>> {
        let key = SnapshotKey::for_aggregate::<A>(id);
        let found = self.cache.get_snapshot(&key).await.map_err(SnapshotIoError)?;
        tracing::trace!(key = %key, found = found.is_some(), "snapshot lookup");
        Ok(found)
    }

    /// Serialize and persist asynchronously, like
    /// [`ProjectionSnapshotRepository::put`].
    ///
    /// # Errors
    ///
    /// Returns [`SerializationError`] when the aggregate cannot be
    /// encoded.
    pub fn put<A: Aggregate>(
        &self,
        aggregate: &A,
        id: Uuid,
        cursor: FactId,
    ) -> Result<JoinHandle<()>, SerializationError> {
        let snapshot = self.snapshot_of(aggregate, id, cursor)?;
        Ok(spawn_write(Arc::clone(&self.cache), snapshot))
    }

    /// Serialize and persist, returning only once the cache write is
    /// durable. Used where the caller is about to act on the returned
    /// state.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotWriteError`] when encoding or the cache write
    /// fails.
    pub async fn put_blocking<A: Aggregate>(
        &self,
        aggregate: &A,
        id: Uuid,
        cursor: FactId,
    ) -> Result<(), SnapshotWriteError<C::Error>> {
        let snapshot = self.snapshot_of(aggregate, id, cursor)?;
        self.cache
            .set_snapshot(snapshot)
            .await
            .map_err(SnapshotWriteError::Cache)
    }

    /// # Errors
    ///
    /// Returns [`SerializationError::Decode`] when the bytes do not parse.
    pub fn decode<A: Aggregate>(&self, snapshot: &Snapshot) -> Result<A, SerializationError> {
        self.serializer.deserialize(&snapshot.bytes)
    }

    fn snapshot_of<A: Aggregate>(
        &self,
        aggregate: &A,
        id: Uuid,
        cursor: FactId,
    ) -> Result<Snapshot, SerializationError> {
        Ok(Snapshot {
            key: SnapshotKey::for_aggregate::<A>(id),
            last_fact: cursor,
            bytes: self.serializer.serialize(aggregate)?,
            compressed: self.serializer.includes_compression(),
        })
    }
}

fn spawn_write<C: SnapshotCache>(cache: Arc<C>, snapshot: Snapshot) -> JoinHandle<()> {
    tokio::spawn(async move {
        let key = snapshot.key.clone();
        if let Err(error) = cache.set_snapshot(snapshot).await {
            tracing::warn!(key = %key, error = %error, "snapshot write failed; discarding");
        }
    })
}
