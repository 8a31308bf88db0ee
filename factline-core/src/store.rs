//! The fact store contract.
//!
//! The wire transport to the fact log is an external collaborator; this
//! module pins down the interface the engine drives it through: publishing
//! (plain and conditional) and subscribing in catchup or follow mode. The
//! [`inmemory`] submodule is the reference implementation used throughout
//! the tests.

use std::{future::Future, pin::Pin};

pub use nonempty::NonEmpty;
use futures_core::Stream;
use thiserror::Error;

use crate::fact::{Fact, FactId, FactSpec};

pub mod inmemory;

/// Bounded replay versus unbounded live subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Replay matching facts up to the log's current tail, then complete.
    Catchup,
    /// Replay the backlog, then keep delivering facts as they arrive.
    Follow,
}

/// What a subscription should deliver.
#[derive(Clone, Debug)]
pub struct SubscriptionRequest {
    pub mode: SubscriptionMode,
    pub specs: Vec<FactSpec>,
    /// Exclusive cursor: deliver only facts ordered after this one.
    /// `None` replays from the start of the log.
    pub from: Option<FactId>,
}

impl SubscriptionRequest {
    #[must_use]
    pub const fn catchup(specs: Vec<FactSpec>) -> Self {
        Self {
            mode: SubscriptionMode::Catchup,
            specs,
            from: None,
        }
    }

    #[must_use]
    pub const fn follow(specs: Vec<FactSpec>) -> Self {
        Self {
            mode: SubscriptionMode::Follow,
            specs,
            from: None,
        }
    }

    #[must_use]
    pub const fn from(mut self, cursor: Option<FactId>) -> Self {
        self.from = cursor;
        self
    }
}

/// One delivery on a subscription stream.
#[derive(Clone, Debug)]
pub enum FactStreamItem {
    Fact(Fact),
    /// The historical backlog has been drained. In catchup mode the stream
    /// ends right after; in follow mode live facts keep flowing.
    CaughtUp,
}

/// Boxed subscription stream. Ends on completion (catchup mode) or after
/// yielding a fatal error.
pub type FactStream<E> = Pin<Box<dyn Stream<Item = Result<FactStreamItem, E>> + Send>>;

/// Failure of a conditional publish.
#[derive(Debug, Error)]
pub enum PublishError<E: std::error::Error + 'static> {
    /// A fact matching the guard specs was ordered after the expected
    /// cursor; the caller's view is stale.
    #[error("fact log advanced past the expected cursor")]
    Conflict,
    #[error("transport error: {0}")]
    Transport(#[source] E),
}

/// Client for the remote fact store.
///
/// Implementations are cheap to clone (handles onto a shared connection)
/// so subscriptions can run on their own tasks.
pub trait FactStore: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Append facts to the log, atomically and in order.
    fn publish(&self, facts: NonEmpty<Fact>)
    -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Append facts provided no fact matching `guards` has been ordered
    /// after `expected`.
    ///
    /// `expected = None` means the caller saw no matching fact at all.
    /// Stores without a native conditional append simulate it by
    /// re-checking the log before acknowledging, and report staleness as
    /// [`PublishError::Conflict`].
    fn publish_if_unchanged(
        &self,
        facts: NonEmpty<Fact>,
        guards: &[FactSpec],
        expected: Option<FactId>,
    ) -> impl Future<Output = Result<(), PublishError<Self::Error>>> + Send;

    /// Open a subscription. Facts are delivered strictly in log order.
    fn subscribe(&self, request: SubscriptionRequest) -> FactStream<Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builders_set_mode_and_cursor() {
        let catchup = SubscriptionRequest::catchup(vec![]).from(Some(FactId::random()));
        assert_eq!(catchup.mode, SubscriptionMode::Catchup);
        assert!(catchup.from.is_some());

        let follow = SubscriptionRequest::follow(vec![]);
        assert_eq!(follow.mode, SubscriptionMode::Follow);
        assert!(follow.from.is_none());
    }
}
