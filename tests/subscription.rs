//! Integration tests for token-guarded follow subscriptions and engine
//! shutdown.

mod support;

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use support::{RecordingSnapshotCache, ScriptedTokenProvider};
use uuid::Uuid;

use factline::{
    Apply, Dispatch, Engine, EngineConfig, EngineError, EventObject, Fact, FactModel, FOREVER,
    Subscribed,
    store::inmemory::InMemoryFactStore,
};

// ============================================================================
// Test Domain
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReadingTaken {
    sensor: Uuid,
    value: i64,
}

impl EventObject for ReadingTaken {
    const NAMESPACE: &'static str = "telemetry";
    const KIND: &'static str = "reading-taken";
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SensorFeed {
    readings: u64,
    sum: i64,
    caught_up: u32,
    errors: u32,
}

impl FactModel for SensorFeed {
    const NAME: &'static str = "telemetry.SensorFeed";

    fn dispatch() -> Dispatch<Self> {
        Dispatch::builder().on::<ReadingTaken>().build()
    }

    fn on_catchup(&mut self) {
        self.caught_up += 1;
    }

    fn on_error(&mut self, _error: &(dyn std::error::Error + 'static)) {
        self.errors += 1;
    }
}

impl Apply<ReadingTaken> for SensorFeed {
    fn apply(&mut self, event: ReadingTaken, _fact: &Fact) {
        self.readings += 1;
        self.sum += event.value;
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn engine_with_fast_retry() -> (
    Engine<InMemoryFactStore, RecordingSnapshotCache>,
    InMemoryFactStore,
) {
    let store = InMemoryFactStore::new();
    let engine = Engine::new(store.clone(), RecordingSnapshotCache::new()).with_config(
        EngineConfig {
            token_retry_interval: Duration::from_millis(10),
            ..EngineConfig::default()
        },
    );
    (engine, store)
}

fn reading(value: i64) -> ReadingTaken {
    ReadingTaken {
        sensor: Uuid::new_v4(),
        value,
    }
}

// ============================================================================
// subscribe_and_block
// ============================================================================

#[tokio::test(start_paused = true)]
async fn token_denials_delay_the_subscription_until_granted() {
    let (engine, store) = engine_with_fast_retry();
    let tokens = ScriptedTokenProvider::with_script([false, false, true]);
    let subscribed = Subscribed::new(SensorFeed::default(), tokens.clone());

    engine.publish(&reading(5)).await.unwrap();

    let subscription = engine.subscribe_and_block(&subscribed).await.unwrap();

    assert_eq!(tokens.attempts(), 3, "two denials, then the grant");
    assert_eq!(
        tokens.releases(),
        0,
        "failed attempts must not leak half-acquired tokens"
    );
    assert!(subscription.is_running().await);

    support::settle().await;
    assert_eq!(subscribed.managed().read(|f| f.sum).await, 5);
    assert_eq!(subscribed.managed().read(|f| f.caught_up).await, 1);

    store.ingest([factline::EventConverter::new()
        .to_fact(&reading(7))
        .unwrap()]);
    support::settle().await;
    assert_eq!(subscribed.managed().read(|f| f.sum).await, 12);

    engine.close().await;
}

#[tokio::test(start_paused = true)]
async fn subscription_resumes_from_the_managed_cursor() {
    let (engine, _store) = engine_with_fast_retry();
    let subscribed = Subscribed::new(SensorFeed::default(), ScriptedTokenProvider::granting());

    engine.publish(&reading(1)).await.unwrap();
    engine.publish(&reading(2)).await.unwrap();

    // Catch the projection up before subscribing.
    engine.update(subscribed.managed(), FOREVER).await.unwrap();
    assert_eq!(subscribed.managed().read(|f| f.readings).await, 2);

    let _subscription = engine.subscribe_and_block(&subscribed).await.unwrap();
    engine.publish(&reading(3)).await.unwrap();
    support::settle().await;

    assert_eq!(
        subscribed.managed().read(|f| f.readings).await,
        3,
        "the backlog before the cursor must not be re-applied"
    );
    assert_eq!(subscribed.managed().read(|f| f.sum).await, 6);

    engine.close().await;
}

#[tokio::test(start_paused = true)]
async fn close_winds_down_subscription_and_token_exactly_once() {
    let (engine, _store) = engine_with_fast_retry();
    let tokens = ScriptedTokenProvider::granting();
    let subscribed = Subscribed::new(SensorFeed::default(), tokens.clone());

    let subscription = engine.subscribe_and_block(&subscribed).await.unwrap();
    assert_eq!(tokens.releases(), 0);

    engine.close().await;
    assert!(!subscription.is_running().await);
    assert_eq!(tokens.releases(), 1, "the lease is released on shutdown");

    // Second close: a warning, not an error, and no double release.
    engine.close().await;
    assert_eq!(tokens.releases(), 1);
}

#[tokio::test(start_paused = true)]
async fn closing_the_engine_interrupts_token_acquisition() {
    let (engine, _store) = engine_with_fast_retry();
    let engine = Arc::new(engine);
    let tokens = ScriptedTokenProvider::denying();
    let subscribed = Subscribed::new(SensorFeed::default(), tokens.clone());

    let waiting = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.subscribe_and_block(&subscribed).await.map(|_| ()) })
    };

    // Let the acquisition loop spin a few denials.
    support::settle().await;
    assert!(tokens.attempts() > 0);
    assert!(!waiting.is_finished());

    engine.close().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let outcome = waiting.await.unwrap();
    assert!(matches!(outcome, Err(EngineError::Closed)));
    assert_eq!(tokens.releases(), 0, "nothing was acquired, nothing to release");
}

#[tokio::test(start_paused = true)]
async fn closed_engine_refuses_new_subscriptions() {
    let (engine, _store) = engine_with_fast_retry();
    let subscribed = Subscribed::new(SensorFeed::default(), ScriptedTokenProvider::granting());

    engine.close().await;

    let result = engine.subscribe_and_block(&subscribed).await;
    assert!(matches!(result, Err(EngineError::Closed)));
}

#[tokio::test(start_paused = true)]
async fn caller_may_close_the_subscription_before_the_engine() {
    let (engine, _store) = engine_with_fast_retry();
    let tokens = ScriptedTokenProvider::granting();
    let subscribed = Subscribed::new(SensorFeed::default(), tokens.clone());

    let subscription = engine.subscribe_and_block(&subscribed).await.unwrap();
    subscription.close().await;
    assert!(!subscription.is_running().await);

    // Engine close finds the subscription already stopped and still
    // releases the token without erroring.
    engine.close().await;
    assert_eq!(tokens.releases(), 1);
}

#[tokio::test(start_paused = true)]
async fn unhandled_live_fact_terminates_the_subscription() {
    let (engine, store) = engine_with_fast_retry();
    let subscribed = Subscribed::new(SensorFeed::default(), ScriptedTokenProvider::granting());

    let subscription = engine.subscribe_and_block(&subscribed).await.unwrap();
    support::settle().await;

    // Same coordinates the projection subscribes to, but a version the
    // dispatch table has no handler for.
    store.ingest([Fact::builder("telemetry", "reading-taken")
        .version(9)
        .build()]);
    support::settle().await;

    assert_eq!(subscribed.managed().read(|f| f.errors).await, 1);
    assert!(!subscription.is_running().await);

    engine.close().await;
}
