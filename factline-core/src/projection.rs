//! Projection capability traits and managed wrappers.
//!
//! The hierarchy is a compile-time split of what the engine can do with a
//! projection:
//!
//! - [`FactModel`] - can consume facts (dispatch table + lifecycle hooks)
//! - [`SnapshotState`] - additionally snapshot-serializable with a stable
//!   name and schema version
//! - [`SnapshotProjection`] - snapshot-backed, keyed by name alone; the
//!   entry point is [`Engine::fetch`](crate::engine::Engine::fetch)
//! - [`Aggregate`] - snapshot-backed, keyed by (name, aggregate id); the
//!   entry point is [`Engine::find`](crate::engine::Engine::find)
//!
//! An aggregate type deliberately does not implement
//! [`SnapshotProjection`], so passing one to `fetch` is a type error
//! rather than a runtime surprise.
//!
//! [`Managed`] wraps a projection whose storage the caller owns, adding
//! the cursor and the intra-process write lock; [`Subscribed`] extends it
//! with a cross-process writer-token source for single-writer leadership.

use std::{sync::Arc, time::Duration};

use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::{fact::FactId, projector::Dispatch};

/// A type that can consume facts.
pub trait FactModel: Send + Sized + 'static {
    /// Stable projection identity, used for snapshot keys and metric tags.
    const NAME: &'static str;

    /// The routing table: which facts this projection handles, and how.
    ///
    /// Called once per materialization; the result is reused for the whole
    /// run of a subscription.
    fn dispatch() -> Dispatch<Self>;

    /// Called when a subscription has drained the historical backlog.
    fn on_catchup(&mut self) {}

    /// Called when a bounded subscription completes.
    fn on_complete(&mut self) {}

    /// Called when the subscription terminates with an error. The
    /// subscription is over once this fires.
    fn on_error(&mut self, _error: &(dyn std::error::Error + 'static)) {}
}

/// A [`FactModel`] whose state can be persisted as a snapshot.
pub trait SnapshotState: FactModel + Default + Serialize + DeserializeOwned {
    /// Bumping this invalidates all previously persisted snapshots of the
    /// type; they are ignored and the projection is rebuilt from the log.
    const SCHEMA_VERSION: u64 = 0;
}

/// Snapshot-backed projection without instance identity.
pub trait SnapshotProjection: SnapshotState {}

/// Snapshot-backed projection keyed by an aggregate id.
///
/// The id is assigned by the engine right after construction and before
/// any fact is applied.
pub trait Aggregate: SnapshotState {
    fn aggregate_id(&self) -> Option<Uuid>;

    fn set_aggregate_id(&mut self, id: Uuid);
}

pub(crate) struct ManagedState<P> {
    pub(crate) projection: P,
    pub(crate) cursor: Option<FactId>,
}

/// A projection whose storage the application manages.
///
/// The wrapper owns the state cursor (id of the last applied fact) and the
/// intra-process write lock: every mutation performed by the engine runs
/// inside the lock, and readers go through [`read`](Self::read). Clones
/// share the same underlying state.
pub struct Managed<P> {
    state: Arc<tokio::sync::Mutex<ManagedState<P>>>,
}

impl<P> Clone for Managed<P> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<P: FactModel> Managed<P> {
    /// Wrap a projection that has not applied any facts yet.
    #[must_use]
    pub fn new(projection: P) -> Self {
        Self {
            state: Arc::new(tokio::sync::Mutex::new(ManagedState {
                projection,
                cursor: None,
            })),
        }
    }

    /// Wrap externally persisted state together with its cursor.
    #[must_use]
    pub fn with_cursor(projection: P, cursor: FactId) -> Self {
        Self {
            state: Arc::new(tokio::sync::Mutex::new(ManagedState {
                projection,
                cursor: Some(cursor),
            })),
        }
    }

    /// Read the projection under the lock.
    pub async fn read<R>(&self, f: impl FnOnce(&P) -> R) -> R {
        let state = self.state.lock().await;
        f(&state.projection)
    }

    /// Id of the last fact applied to this projection, if any.
    pub async fn cursor(&self) -> Option<FactId> {
        self.state.lock().await.cursor
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, ManagedState<P>> {
        self.state.lock().await
    }
}

/// A managed projection driven by a single writer across processes.
///
/// The token provider decides leadership;
/// [`Engine::subscribe_and_block`](crate::engine::Engine::subscribe_and_block)
/// keeps asking it for a token and only opens the follow subscription once
/// one is granted.
pub struct Subscribed<P, T> {
    managed: Managed<P>,
    tokens: Arc<T>,
}

impl<P: FactModel, T: WriterTokenProvider> Subscribed<P, T> {
    #[must_use]
    pub fn new(projection: P, tokens: T) -> Self {
        Self {
            managed: Managed::new(projection),
            tokens: Arc::new(tokens),
        }
    }

    #[must_use]
    pub fn managed(&self) -> &Managed<P> {
        &self.managed
    }

    pub(crate) fn tokens(&self) -> &Arc<T> {
        &self.tokens
    }
}

/// An externally issued, time-bounded single-writer lease.
///
/// Release is guaranteed on every exit path: dropping the token runs the
/// release action if [`close`](Self::close) was never called.
pub struct WriterToken {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl WriterToken {
    /// Create a token whose lease is released by running `release`.
    #[must_use]
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A token with no release action, for providers that lease by
    /// side-effect-free timeout.
    #[must_use]
    pub const fn leaked() -> Self {
        Self { release: None }
    }

    /// Release the lease now.
    pub fn close(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for WriterToken {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for WriterToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterToken")
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// Source of writer tokens.
///
/// Acquisition is non-blocking apart from the provider's own short
/// timeout: `None` means the lease is currently held elsewhere and the
/// caller should retry later.
pub trait WriterTokenProvider: Send + Sync + 'static {
    fn acquire(&self, lease: Duration) -> impl Future<Output = Option<WriterToken>> + Send;
}
