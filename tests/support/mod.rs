//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use factline::{
    Snapshot, WriterToken, WriterTokenProvider,
    snapshot::{SnapshotCache, SnapshotKey, inmemory::InMemorySnapshotCache},
};

/// Snapshot cache that records writes and can fail reads on demand.
#[derive(Clone, Default)]
pub struct RecordingSnapshotCache {
    inner: InMemorySnapshotCache,
    writes: Arc<AtomicUsize>,
    last_write: Arc<Mutex<Option<Snapshot>>>,
    fail_reads: Arc<AtomicBool>,
}

impl RecordingSnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn last_write(&self) -> Option<Snapshot> {
        self.last_write
            .lock()
            .expect("last write lock poisoned")
            .clone()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Plant a snapshot directly, bypassing the write counters.
    pub async fn plant(&self, snapshot: Snapshot) {
        self.inner.set_snapshot(snapshot).await.unwrap();
    }
}

impl SnapshotCache for RecordingSnapshotCache {
    type Error = io::Error;

    async fn get_snapshot(&self, key: &SnapshotKey) -> Result<Option<Snapshot>, Self::Error> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected snapshot read failure"));
        }
        let found = self.inner.get_snapshot(key).await;
        Ok(found.expect("in-memory cache reads are infallible"))
    }

    async fn set_snapshot(&self, snapshot: Snapshot) -> Result<(), Self::Error> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        *self.last_write.lock().expect("last write lock poisoned") = Some(snapshot.clone());
        self.inner
            .set_snapshot(snapshot)
            .await
            .expect("in-memory cache writes are infallible");
        Ok(())
    }

    async fn delete_snapshot(&self, key: &SnapshotKey) -> Result<(), Self::Error> {
        self.inner
            .delete_snapshot(key)
            .await
            .expect("in-memory cache deletes are infallible");
        Ok(())
    }
}

/// Token provider following a script of grant/deny outcomes.
///
/// Outcomes are consumed front to back; once the script is exhausted
/// every further acquisition follows the configured fallback. Grants
/// release into a shared counter so tests can assert exactly-once
/// release.
#[derive(Clone)]
pub struct ScriptedTokenProvider {
    script: Arc<Mutex<VecDeque<bool>>>,
    grant_after_script: bool,
    attempts: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
}

impl ScriptedTokenProvider {
    pub fn granting() -> Self {
        Self::with_script([])
    }

    /// `false` entries deny the acquisition, `true` entries grant it;
    /// past the end of the script, everything is granted.
    pub fn with_script(outcomes: impl IntoIterator<Item = bool>) -> Self {
        Self {
            script: Arc::new(Mutex::new(outcomes.into_iter().collect())),
            grant_after_script: true,
            attempts: Arc::new(AtomicUsize::new(0)),
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Provider that never grants a token.
    pub fn denying() -> Self {
        Self {
            grant_after_script: false,
            ..Self::with_script([])
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl WriterTokenProvider for ScriptedTokenProvider {
    async fn acquire(&self, _lease: Duration) -> Option<WriterToken> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let granted = self
            .script
            .lock()
            .expect("token script lock poisoned")
            .pop_front()
            .unwrap_or(self.grant_after_script);
        if !granted {
            return None;
        }
        let releases = Arc::clone(&self.releases);
        Some(WriterToken::new(move || {
            releases.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

/// Poll the scheduler a few times so detached tasks (async snapshot
/// writes, follow subscriptions) get to run.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
