//! Core traits and runtime for the factline event-sourcing client.
//!
//! factline sits between an application and a remote fact store (an
//! append-only event log) and materializes application-defined
//! projections from ordered streams of immutable facts:
//!
//! - [`fact`] - The data model (`Fact`, `FactId`, `FactSpec`)
//! - [`event`] - Event declaration and conversion (`EventObject`,
//!   `EventConverter`)
//! - [`projection`] - Projection capabilities (`FactModel`,
//!   `SnapshotProjection`, `Aggregate`, `Managed`, `Subscribed`)
//! - [`projector`] - Fact dispatch (`Dispatch`, `Apply`)
//! - [`snapshot`] - Versioned snapshot persistence
//! - [`store`] - The fact store contract and the in-memory reference
//!   implementation
//! - [`driver`] - Catchup and follow subscription driving
//! - [`lock`] - Optimistic publish-on-state (`Locked`)
//! - [`engine`] - The orchestrating [`Engine`](engine::Engine)
//! - [`metrics`] - Prometheus instrumentation hooks
//!
//! # Example
//!
//! ```
//! use factline_core::{
//!     engine::Engine, snapshot::inmemory::InMemorySnapshotCache,
//!     store::inmemory::InMemoryFactStore,
//! };
//!
//! let engine = Engine::new(InMemoryFactStore::new(), InMemorySnapshotCache::new());
//! ```
//!
//! Most users should depend on the `factline` crate, which re-exports
//! these types with a cleaner API surface.

pub mod driver;
pub mod engine;
pub mod event;
pub mod fact;
pub mod lock;
pub mod metrics;
pub mod projection;
pub mod projector;
pub mod snapshot;
pub mod store;
