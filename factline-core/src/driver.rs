//! Subscription driving.
//!
//! Turns the raw fact stream from the store into projection state: every
//! delivered fact is routed through the dispatch table inside the
//! projection's critical section, the cursor is advanced, and the
//! lifecycle hooks fire at the right moments. [`catchup`] is the bounded
//! variant used by `fetch`/`find`/`update`; [`follow`] spawns the
//! unbounded variant behind a [`Subscription`] handle.

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{sync::oneshot, task::JoinHandle};
use tokio_stream::StreamExt as _;

use crate::{
    event::SerializationError,
    fact::{Fact, FactId, FactSpec},
    projection::{FactModel, Managed},
    projector::{Dispatch, DispatchError, UnhandledFactError},
    store::{FactStore, FactStreamItem, SubscriptionRequest},
};

/// Sentinel for an unbounded catchup wait.
pub const FOREVER: Duration = Duration::MAX;

/// Failure of a subscription run.
#[derive(Debug, Error)]
pub enum SubscriptionError<E: std::error::Error + 'static> {
    /// The bounded catchup did not reach the log tail in time.
    #[error("catchup did not complete within {timeout:?}")]
    CatchupTimeout { timeout: Duration },
    /// A fact arrived that the projection has no handler for. Fatal for
    /// this subscription.
    #[error(transparent)]
    Unhandled(#[from] UnhandledFactError),
    /// A fact payload could not be decoded.
    #[error(transparent)]
    Decode(SerializationError),
    /// The upstream subscription failed.
    #[error("transport error: {0}")]
    Transport(#[source] E),
}

impl<E: std::error::Error + 'static> From<DispatchError> for SubscriptionError<E> {
    fn from(error: DispatchError) -> Self {
        match error {
            DispatchError::Unhandled(e) => Self::Unhandled(e),
            DispatchError::Decode(e) => Self::Decode(e),
        }
    }
}

/// Run a bounded catchup: apply every matching fact after `cursor` up to
/// the log's current tail.
///
/// The cursor is advanced fact by fact, so a timeout or error leaves it
/// consistent with the state actually applied. Returns the id of the last
/// applied fact, or `None` when the log held nothing new.
///
/// # Errors
///
/// [`SubscriptionError::CatchupTimeout`] when `max_wait` (unless
/// [`FOREVER`]) elapses first; otherwise the dispatch or transport
/// failure, which has also been reported through the projection's
/// `on_error` hook.
pub(crate) async fn catchup<P, F>(
    store: &F,
    dispatch: &Dispatch<P>,
    specs: Vec<FactSpec>,
    projection: &mut P,
    cursor: &mut Option<FactId>,
    max_wait: Duration,
) -> Result<Option<FactId>, SubscriptionError<F::Error>>
where
    P: FactModel,
    F: FactStore,
{
    let stream = store.subscribe(SubscriptionRequest::catchup(specs).from(*cursor));
    let run = drive(stream, dispatch, projection, cursor);

    if max_wait == FOREVER {
        run.await
    } else {
        match tokio::time::timeout(max_wait, run).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(?max_wait, "catchup timed out");
                Err(SubscriptionError::CatchupTimeout { timeout: max_wait })
            }
        }
    }
}

/// Consume a catchup stream to its end.
async fn drive<P, E>(
    mut stream: crate::store::FactStream<E>,
    dispatch: &Dispatch<P>,
    projection: &mut P,
    cursor: &mut Option<FactId>,
) -> Result<Option<FactId>, SubscriptionError<E>>
where
    P: FactModel,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut advanced = None;
    let mut applied: u64 = 0;

    while let Some(item) = stream.next().await {
        match item {
            Ok(FactStreamItem::Fact(fact)) => {
                if let Err(error) = dispatch.apply(projection, &fact) {
                    let error = SubscriptionError::from(error);
                    projection.on_error(&error);
                    return Err(error);
                }
                *cursor = Some(fact.id());
                advanced = Some(fact.id());
                applied += 1;
            }
            Ok(FactStreamItem::CaughtUp) => projection.on_catchup(),
            Err(error) => {
                let error = SubscriptionError::Transport(error);
                projection.on_error(&error);
                return Err(error);
            }
        }
    }

    projection.on_complete();
    tracing::debug!(applied, cursor = ?advanced, "catchup complete");
    Ok(advanced)
}

/// Handle onto a running follow subscription.
///
/// Clones share the subscription; the first [`close`](Self::close) stops
/// it, later calls are no-ops. Dropping all handles does not stop the
/// subscription by itself.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

struct SubscriptionInner {
    stop: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    /// Stop the subscription and wait for its task to wind down.
    ///
    /// Task failures are logged and swallowed.
    pub async fn close(&self) {
        let stop = self
            .inner
            .stop
            .lock()
            .expect("subscription stop lock poisoned")
            .take();
        if let Some(stop) = stop {
            let _ = stop.send(());
        }

        let task = self.inner.task.lock().await.take();
        if let Some(task) = task {
            if let Err(error) = task.await {
                tracing::warn!(%error, "follow subscription task failed during close");
            }
        }
    }

    /// Whether the subscription task is still running.
    pub async fn is_running(&self) -> bool {
        self.inner
            .task
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

/// Spawn an unbounded follow subscription feeding a managed projection.
///
/// Each fact is applied inside the managed write lock and advances the
/// managed cursor; `after_apply` runs once per applied fact (outside the
/// lock) for instrumentation. Terminates on [`Subscription::close`], when
/// the upstream stream ends, or on a fatal error reported through the
/// projection's `on_error` hook.
pub(crate) fn follow<P, F, O>(
    store: F,
    dispatch: Arc<Dispatch<P>>,
    specs: Vec<FactSpec>,
    managed: Managed<P>,
    from: Option<FactId>,
    after_apply: O,
) -> Subscription
where
    P: FactModel,
    F: FactStore,
    O: Fn(&Fact) + Send + 'static,
{
    let (stop_tx, mut stop_rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        let mut stream = store.subscribe(SubscriptionRequest::follow(specs).from(from));

        loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => {
                    tracing::debug!("follow subscription stopped");
                    break;
                }
                item = stream.next() => {
                    let Some(item) = item else {
                        tracing::debug!("follow subscription stream ended");
                        break;
                    };
                    match item {
                        Ok(FactStreamItem::Fact(fact)) => {
                            let failed = {
                                let mut state = managed.lock().await;
                                match dispatch.apply(&mut state.projection, &fact) {
                                    Ok(()) => {
                                        state.cursor = Some(fact.id());
                                        false
                                    }
                                    Err(error) => {
                                        let error = SubscriptionError::<F::Error>::from(error);
                                        tracing::error!(%error, "follow subscription failed");
                                        state.projection.on_error(&error);
                                        true
                                    }
                                }
                            };
                            if failed {
                                break;
                            }
                            after_apply(&fact);
                        }
                        Ok(FactStreamItem::CaughtUp) => {
                            managed.lock().await.projection.on_catchup();
                        }
                        Err(error) => {
                            let error = SubscriptionError::<F::Error>::Transport(error);
                            tracing::error!(%error, "follow subscription failed");
                            managed.lock().await.projection.on_error(&error);
                            break;
                        }
                    }
                }
            }
        }
    });

    Subscription {
        inner: Arc::new(SubscriptionInner {
            stop: std::sync::Mutex::new(Some(stop_tx)),
            task: tokio::sync::Mutex::new(Some(task)),
        }),
    }
}
