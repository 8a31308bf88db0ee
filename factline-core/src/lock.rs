//! Optimistic publish-on-state.
//!
//! A [`Locked`] value couples a freshly materialized projection view with
//! the fact specs guarding it. [`attempt`](Locked::attempt) brings the
//! view to the current log tail, lets a synchronous closure inspect it and
//! stage new facts in a [`PublishBuffer`], and publishes them
//! conditionally: the publish succeeds only if no guarded fact was ordered
//! after the view's cursor in the meantime. On a conflict the view is
//! rebuilt and the closure re-run, up to a bounded number of attempts.
//!
//! The closure being synchronous makes publish re-entry impossible to
//! write in safe async code; the thread-local [`scope`] guard additionally
//! catches paths smuggled in via `block_on`.

use std::num::NonZeroUsize;

use nonempty::NonEmpty;
use thiserror::Error;

use crate::{
    driver::{FOREVER, SubscriptionError},
    engine::Engine,
    event::{EventConverter, EventObject, SerializationError},
    fact::{Fact, FactId, FactSpec},
    projection::{Aggregate, FactModel, Managed, SnapshotProjection},
    projector::Dispatch,
    snapshot::{SnapshotCache, SnapshotSerializer},
    store::{FactStore, PublishError},
};

/// Failure of a locked operation.
#[derive(Debug, Error)]
pub enum LockError<UE, TE>
where
    UE: std::error::Error + 'static,
    TE: std::error::Error + 'static,
{
    /// The engine was closed before or during the operation.
    #[error("engine is already closed")]
    Closed,
    /// A locked operation was started from within another one.
    #[error("nested locked operation detected")]
    Nested,
    /// Conflicting facts kept arriving; every attempt was stale.
    #[error("locked operation still conflicted after {attempts} attempts")]
    Exceeded { attempts: usize },
    /// The caller's closure failed; no facts were published for this
    /// attempt.
    #[error("locked operation handler failed: {0}")]
    Handler(#[source] UE),
    /// Refreshing the projection view failed.
    #[error(transparent)]
    Subscription(#[from] SubscriptionError<TE>),
    /// The publish itself failed for a non-conflict reason.
    #[error("failed to publish: {0}")]
    Publish(#[source] TE),
}

/// Staging area for facts produced inside a locked operation.
pub struct PublishBuffer {
    converter: EventConverter,
    facts: Vec<Fact>,
}

impl PublishBuffer {
    pub(crate) const fn new() -> Self {
        Self {
            converter: EventConverter::new(),
            facts: Vec::new(),
        }
    }

    /// Stage an event for publication.
    ///
    /// # Errors
    ///
    /// Returns [`SerializationError`] when the event cannot be converted.
    pub fn publish<E: EventObject>(&mut self, event: &E) -> Result<(), SerializationError> {
        self.facts.push(self.converter.to_fact(event)?);
        Ok(())
    }

    /// Stage an already-built fact.
    pub fn publish_fact(&mut self, fact: Fact) {
        self.facts.push(fact);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub(crate) fn into_facts(self) -> Vec<Fact> {
        self.facts
    }
}

pub(crate) mod scope {
    //! Thread-local guard marking "inside a locked operation".
    //!
    //! The guarded region is the synchronous closure invocation only, so
    //! it never spans an await point and cannot leak across tasks.

    use std::cell::Cell;

    thread_local! {
        static DEPTH: Cell<u32> = const { Cell::new(0) };
    }

    pub(crate) struct LockScope(());

    impl LockScope {
        pub(crate) fn enter() -> Self {
            DEPTH.with(|depth| depth.set(depth.get() + 1));
            Self(())
        }
    }

    impl Drop for LockScope {
        fn drop(&mut self) {
            DEPTH.with(|depth| depth.set(depth.get() - 1));
        }
    }

    pub(crate) fn in_locked_operation() -> bool {
        DEPTH.with(|depth| depth.get() > 0)
    }
}

mod private {
    pub trait Sealed {}

    impl<P> Sealed for super::FetchedTarget<P> {}
    impl<A> Sealed for super::AggregateTarget<A> {}
    impl<P> Sealed for super::ManagedTarget<P> {}
}

/// How a [`Locked`] operation materializes and re-materializes its view.
#[doc(hidden)]
pub trait LockTarget<F, C, S>: private::Sealed + Send
where
    F: FactStore,
    C: SnapshotCache,
    S: SnapshotSerializer,
{
    type View: FactModel;

    /// Bring the view to the current log tail, discarding stale state.
    fn refresh<'a>(
        &'a mut self,
        engine: &'a Engine<F, C, S>,
    ) -> impl Future<Output = Result<(), SubscriptionError<F::Error>>> + Send + 'a;

    /// Run the caller's closure against the refreshed view.
    fn run<'a, UE>(
        &'a mut self,
        handler: &'a mut (dyn FnMut(&Self::View, &mut PublishBuffer) -> Result<(), UE> + Send),
        buffer: &'a mut PublishBuffer,
    ) -> impl Future<Output = Result<(), UE>> + Send + 'a
    where
        UE: Send;

    /// Cursor the view reflects after the last refresh.
    fn cursor(&self) -> Option<FactId>;
}

/// Lock view over a snapshot projection, rebuilt via snapshot + catchup.
pub struct FetchedTarget<P> {
    view: P,
    cursor: Option<FactId>,
}

impl<P: SnapshotProjection> FetchedTarget<P> {
    pub(crate) fn new() -> Self {
        Self {
            view: P::default(),
            cursor: None,
        }
    }
}

impl<P, F, C, S> LockTarget<F, C, S> for FetchedTarget<P>
where
    P: SnapshotProjection,
    F: FactStore,
    C: SnapshotCache,
    S: SnapshotSerializer,
{
    type View = P;

    async fn refresh(
        &mut self,
        engine: &Engine<F, C, S>,
    ) -> Result<(), SubscriptionError<F::Error>> {
        let started = std::time::Instant::now();
        let (view, cursor) = engine.materialize_projection::<P>().await?;
        engine
            .metrics()
            .record_fetch_duration(P::NAME, true, started.elapsed());
        self.view = view;
        self.cursor = cursor;
        Ok(())
    }

    async fn run<UE>(
        &mut self,
        handler: &mut (dyn FnMut(&P, &mut PublishBuffer) -> Result<(), UE> + Send),
        buffer: &mut PublishBuffer,
    ) -> Result<(), UE>
    where
        UE: Send,
    {
        let _scope = scope::LockScope::enter();
        handler(&self.view, buffer)
    }

    fn cursor(&self) -> Option<FactId> {
        self.cursor
    }
}

/// Lock view over an aggregate, rebuilt via find-or-initial.
pub struct AggregateTarget<A> {
    id: uuid::Uuid,
    view: A,
    cursor: Option<FactId>,
}

impl<A: Aggregate> AggregateTarget<A> {
    pub(crate) fn new(id: uuid::Uuid) -> Self {
        let mut view = A::default();
        view.set_aggregate_id(id);
        Self {
            id,
            view,
            cursor: None,
        }
    }
}

impl<A, F, C, S> LockTarget<F, C, S> for AggregateTarget<A>
where
    A: Aggregate,
    F: FactStore,
    C: SnapshotCache,
    S: SnapshotSerializer,
{
    type View = A;

    async fn refresh(
        &mut self,
        engine: &Engine<F, C, S>,
    ) -> Result<(), SubscriptionError<F::Error>> {
        let started = std::time::Instant::now();
        let (view, cursor) = engine.materialize_aggregate::<A>(self.id).await?;
        engine
            .metrics()
            .record_find_duration(A::NAME, true, started.elapsed());
        self.view = view;
        self.cursor = cursor;
        Ok(())
    }

    async fn run<UE>(
        &mut self,
        handler: &mut (dyn FnMut(&A, &mut PublishBuffer) -> Result<(), UE> + Send),
        buffer: &mut PublishBuffer,
    ) -> Result<(), UE>
    where
        UE: Send,
    {
        let _scope = scope::LockScope::enter();
        handler(&self.view, buffer)
    }

    fn cursor(&self) -> Option<FactId> {
        self.cursor
    }
}

/// Lock view over a managed projection, caught up in place under its
/// write lock.
pub struct ManagedTarget<P> {
    managed: Managed<P>,
    dispatch: Dispatch<P>,
    cursor: Option<FactId>,
}

impl<P: FactModel> ManagedTarget<P> {
    pub(crate) fn new(managed: Managed<P>) -> Self {
        Self {
            managed,
            dispatch: P::dispatch(),
            cursor: None,
        }
    }
}

impl<P, F, C, S> LockTarget<F, C, S> for ManagedTarget<P>
where
    P: FactModel,
    F: FactStore,
    C: SnapshotCache,
    S: SnapshotSerializer,
{
    type View = P;

    async fn refresh(
        &mut self,
        engine: &Engine<F, C, S>,
    ) -> Result<(), SubscriptionError<F::Error>> {
        let specs = self.dispatch.fact_specs();
        let mut state = self.managed.lock().await;
        let mut cursor = state.cursor;
        crate::driver::catchup(
            engine.store(),
            &self.dispatch,
            specs,
            &mut state.projection,
            &mut cursor,
            FOREVER,
        )
        .await?;
        state.cursor = cursor;
        self.cursor = cursor;
        Ok(())
    }

    async fn run<UE>(
        &mut self,
        handler: &mut (dyn FnMut(&P, &mut PublishBuffer) -> Result<(), UE> + Send),
        buffer: &mut PublishBuffer,
    ) -> Result<(), UE>
    where
        UE: Send,
    {
        let state = self.managed.lock().await;
        let _scope = scope::LockScope::enter();
        handler(&state.projection, buffer)
    }

    fn cursor(&self) -> Option<FactId> {
        self.cursor
    }
}

/// A projection view prepared for an optimistic-locked publish.
///
/// Built by the engine's `with_lock_on*` methods; consumed by
/// [`attempt`](Self::attempt).
pub struct Locked<'e, F, C, S, T>
where
    F: FactStore,
    C: SnapshotCache,
    S: SnapshotSerializer,
{
    engine: &'e Engine<F, C, S>,
    target: T,
    specs: Vec<FactSpec>,
    max_attempts: NonZeroUsize,
}

impl<'e, F, C, S, T> Locked<'e, F, C, S, T>
where
    F: FactStore,
    C: SnapshotCache,
    S: SnapshotSerializer,
    T: LockTarget<F, C, S>,
{
    pub(crate) fn new(
        engine: &'e Engine<F, C, S>,
        target: T,
        specs: Vec<FactSpec>,
        max_attempts: NonZeroUsize,
    ) -> Self {
        Self {
            engine,
            target,
            specs,
            max_attempts,
        }
    }

    /// Override the retry bound for this operation.
    #[must_use]
    pub const fn max_attempts(mut self, attempts: NonZeroUsize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Execute the locked operation.
    ///
    /// The closure sees the view at the current log tail and stages facts
    /// in the buffer; staging nothing makes the whole operation a
    /// successful no-op. Returns the ids of the published facts, in
    /// publication order.
    ///
    /// # Errors
    ///
    /// [`LockError::Exceeded`] once every attempt hit a conflicting
    /// concurrent publish; see [`LockError`] for the other cases.
    pub async fn attempt<UE>(
        mut self,
        mut handler: impl FnMut(&T::View, &mut PublishBuffer) -> Result<(), UE> + Send,
    ) -> Result<Vec<FactId>, LockError<UE, F::Error>>
    where
        UE: std::error::Error + Send + 'static,
    {
        if self.engine.is_closed() {
            return Err(LockError::Closed);
        }
        if scope::in_locked_operation() {
            return Err(LockError::Nested);
        }

        let max_attempts = self.max_attempts.get();
        for attempt in 1..=max_attempts {
            self.target.refresh(self.engine).await?;

            let mut buffer = PublishBuffer::new();
            self.target
                .run(&mut handler, &mut buffer)
                .await
                .map_err(LockError::Handler)?;

            let Some(facts) = NonEmpty::from_vec(buffer.into_facts()) else {
                tracing::debug!("locked operation staged no facts, nothing to publish");
                return Ok(Vec::new());
            };
            let ids: Vec<FactId> = facts.iter().map(Fact::id).collect();

            match self
                .engine
                .store()
                .publish_if_unchanged(facts, &self.specs, self.target.cursor())
                .await
            {
                Ok(()) => {
                    tracing::debug!(attempt, published = ids.len(), "locked publish succeeded");
                    return Ok(ids);
                }
                Err(PublishError::Conflict) => {
                    tracing::debug!(attempt, "conflicting fact during locked publish, retrying");
                }
                Err(PublishError::Transport(error)) => return Err(LockError::Publish(error)),
            }
        }

        Err(LockError::Exceeded {
            attempts: max_attempts,
        })
    }
}
