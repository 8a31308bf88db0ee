#![doc = include_str!("../README.md")]

pub use factline_core::{
    driver,
    driver::{FOREVER, Subscription},
    engine,
    engine::{Engine, EngineConfig, EngineError},
    event,
    event::{EventConverter, EventObject, SerializationError},
    fact,
    fact::{Fact, FactId, FactSpec, VersionRange},
    lock,
    lock::{LockError, Locked, PublishBuffer},
    metrics,
    metrics::EngineMetrics,
    projection,
    projection::{
        Aggregate, FactModel, Managed, SnapshotProjection, SnapshotState, Subscribed, WriterToken,
        WriterTokenProvider,
    },
    projector,
    projector::{Apply, Dispatch, UnhandledFactError},
    snapshot,
    snapshot::{Snapshot, SnapshotCache, SnapshotKey, SnapshotSerializer},
};

pub mod store {

    pub use factline_core::store::{
        FactStore, FactStream, FactStreamItem, NonEmpty, PublishError, SubscriptionMode,
        SubscriptionRequest, inmemory,
    };
}
