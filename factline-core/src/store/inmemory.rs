//! In-memory fact store for testing.
//!
//! Keeps the whole log in a `Vec` guarded by an `RwLock` and fans live
//! facts out through a `tokio::sync::broadcast` channel. Follow
//! subscriptions snapshot the backlog and attach the live receiver under
//! the same lock the publishers write behind, so the catchup-to-live seam
//! neither drops nor duplicates facts.

use std::sync::{Arc, RwLock};

use nonempty::NonEmpty;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::{StreamExt as _, wrappers::BroadcastStream};

use super::{
    FactStore, FactStream, FactStreamItem, PublishError, SubscriptionMode, SubscriptionRequest,
};
use crate::fact::{Fact, FactId, FactSpec};

const LIVE_CHANNEL_CAPACITY: usize = 1024;

/// A fact with its server-assigned log position.
#[derive(Clone, Debug)]
struct StoredFact {
    position: u64,
    fact: Fact,
}

struct Log {
    facts: Vec<StoredFact>,
    next_position: u64,
}

/// Error type for the in-memory store.
#[derive(Debug, Error)]
pub enum InMemoryStoreError {
    /// A follow subscriber fell behind the live channel and missed facts.
    #[error("live fact feed lagged by {0} facts")]
    Lagged(u64),
}

/// In-memory [`FactStore`] backed by a growable log.
#[derive(Clone)]
pub struct InMemoryFactStore {
    log: Arc<RwLock<Log>>,
    live: broadcast::Sender<StoredFact>,
}

impl InMemoryFactStore {
    #[must_use]
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            log: Arc::new(RwLock::new(Log {
                facts: Vec::new(),
                next_position: 1,
            })),
            live,
        }
    }

    /// Append facts synchronously, bypassing the async publish path.
    ///
    /// Intended for seeding test fixtures and for injecting concurrent
    /// writes from inside synchronous closures.
    pub fn ingest(&self, facts: impl IntoIterator<Item = Fact>) {
        let mut log = self.log.write().expect("fact log lock poisoned");
        for fact in facts {
            let stored = StoredFact {
                position: log.next_position,
                fact,
            };
            log.next_position += 1;
            log.facts.push(stored.clone());
            // Receiver-less sends only mean nobody follows yet.
            let _ = self.live.send(stored);
        }
    }

    /// Number of facts on the log.
    #[must_use]
    pub fn len(&self) -> usize {
        self.log.read().expect("fact log lock poisoned").facts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All fact ids in log order.
    #[must_use]
    pub fn fact_ids(&self) -> Vec<FactId> {
        let log = self.log.read().expect("fact log lock poisoned");
        log.facts.iter().map(|stored| stored.fact.id()).collect()
    }

    fn position_of(log: &Log, id: FactId) -> Option<u64> {
        log.facts
            .iter()
            .find(|stored| stored.fact.id() == id)
            .map(|stored| stored.position)
    }

    fn resolve_cursor(log: &Log, from: Option<FactId>) -> u64 {
        match from {
            None => 0,
            Some(id) => Self::position_of(log, id).unwrap_or_else(|| {
                tracing::warn!(cursor = %id, "unknown cursor, replaying from the start");
                0
            }),
        }
    }
}

impl Default for InMemoryFactStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FactStore for InMemoryFactStore {
    type Error = InMemoryStoreError;

    async fn publish(&self, facts: NonEmpty<Fact>) -> Result<(), Self::Error> {
        self.ingest(facts);
        Ok(())
    }

    async fn publish_if_unchanged(
        &self,
        facts: NonEmpty<Fact>,
        guards: &[FactSpec],
        expected: Option<FactId>,
    ) -> Result<(), PublishError<Self::Error>> {
        let mut log = self.log.write().expect("fact log lock poisoned");

        let expected_position = Self::resolve_cursor(&log, expected);
        let intervening = log.facts.iter().any(|stored| {
            stored.position > expected_position
                && guards.iter().any(|spec| spec.matches(&stored.fact))
        });
        if intervening {
            return Err(PublishError::Conflict);
        }

        // Append under the same lock so the check-and-publish is atomic.
        for fact in facts {
            let stored = StoredFact {
                position: log.next_position,
                fact,
            };
            log.next_position += 1;
            log.facts.push(stored.clone());
            let _ = self.live.send(stored);
        }
        Ok(())
    }

    fn subscribe(&self, request: SubscriptionRequest) -> FactStream<Self::Error> {
        let SubscriptionRequest { mode, specs, from } = request;

        // Snapshot the backlog and (for follow mode) attach the live
        // receiver while holding the lock: publishers append and broadcast
        // behind the write lock, so every fact lands either in the backlog
        // or in the receiver, never both, never neither.
        let (backlog, live) = {
            let log = self.log.read().expect("fact log lock poisoned");
            let after = Self::resolve_cursor(&log, from);
            let backlog: Vec<StoredFact> = log
                .facts
                .iter()
                .filter(|stored| {
                    stored.position > after && specs.iter().any(|spec| spec.matches(&stored.fact))
                })
                .cloned()
                .collect();
            let live = match mode {
                SubscriptionMode::Catchup => None,
                SubscriptionMode::Follow => Some(self.live.subscribe()),
            };
            (backlog, live)
        };

        let history = tokio_stream::iter(
            backlog
                .into_iter()
                .map(|stored| Ok(FactStreamItem::Fact(stored.fact))),
        )
        .chain(tokio_stream::once(Ok(FactStreamItem::CaughtUp)));

        match live {
            None => Box::pin(history),
            Some(receiver) => {
                let live = BroadcastStream::new(receiver).filter_map(move |delivery| {
                    match delivery {
                        Ok(stored) => specs
                            .iter()
                            .any(|spec| spec.matches(&stored.fact))
                            .then(|| Ok(FactStreamItem::Fact(stored.fact))),
                        Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(
                            missed,
                        )) => Some(Err(InMemoryStoreError::Lagged(missed))),
                    }
                });
                Box::pin(history.chain(live))
            }
        }
    }
}
