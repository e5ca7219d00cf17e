//! Unit-level coverage of the subscription multiplexer in isolation from
//! the coordinator, using the same in-memory fake the integration tests
//! use (the multiplexer only needs the narrower `SubscriptionBackingStore`
//! half of it).

use std::sync::Arc;
use std::time::Duration;

use memolock::multiplexer::SubscriptionMultiplexer;

#[path = "../integration/helpers.rs"]
mod helpers;
use helpers::FakeBackingStore;

fn ok_probe() -> memolock::multiplexer::DecodeProbe {
    Arc::new(|_payload: &str| Ok(()))
}

fn failing_probe() -> memolock::multiplexer::DecodeProbe {
    Arc::new(|_payload: &str| anyhow::bail!("always fails"))
}

fn handler() -> memolock::config::ErrorHandler {
    Arc::new(|err| tracing::warn!(error = %err, "multiplexer test: cleanup error"))
}

#[tokio::test]
async fn single_waiter_receives_the_published_message() {
    let (backend, inbound) = FakeBackingStore::new();
    let backend = Arc::new(backend);
    let mux = Arc::new(SubscriptionMultiplexer::new(backend.clone(), handler()));
    tokio::spawn(Arc::clone(&mux).run_dispatch_loop(inbound));

    let wait = {
        let mux = mux.clone();
        tokio::spawn(async move {
            mux.subscribe_once("chan_done", Duration::from_millis(500), ok_probe())
                .await
        })
    };

    // Give subscribe_once time to register and issue the upstream
    // `subscribe` before we publish.
    tokio::time::sleep(Duration::from_millis(20)).await;
    use memolock::backing_store::BackingStore;
    backend.publish("chan_done", "hello").await.unwrap();

    let payload = wait.await.unwrap().expect("should receive the payload");
    assert_eq!(payload, "hello");
}

#[tokio::test]
async fn two_concurrent_waiters_on_one_channel_both_fire_from_one_subscription() {
    let (backend, inbound) = FakeBackingStore::new();
    let backend = Arc::new(backend);
    let mux = Arc::new(SubscriptionMultiplexer::new(backend.clone(), handler()));
    tokio::spawn(Arc::clone(&mux).run_dispatch_loop(inbound));

    let mux1 = mux.clone();
    let w1 = tokio::spawn(async move {
        mux1.subscribe_once("chan_done", Duration::from_millis(500), ok_probe())
            .await
    });
    let mux2 = mux.clone();
    let w2 = tokio::spawn(async move {
        mux2.subscribe_once("chan_done", Duration::from_millis(500), ok_probe())
            .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    use memolock::backing_store::BackingStore;
    backend.publish("chan_done", "shared-value").await.unwrap();

    assert_eq!(w1.await.unwrap().unwrap(), "shared-value");
    assert_eq!(w2.await.unwrap().unwrap(), "shared-value");
}

#[tokio::test]
async fn waiter_times_out_when_nothing_is_published() {
    let (backend, inbound) = FakeBackingStore::new();
    let backend = Arc::new(backend);
    let mux = Arc::new(SubscriptionMultiplexer::new(backend, handler()));
    tokio::spawn(Arc::clone(&mux).run_dispatch_loop(inbound));

    let err = mux
        .subscribe_once("never_published", Duration::from_millis(30), ok_probe())
        .await
        .expect_err("should time out");
    assert!(matches!(
        err,
        memolock::multiplexer::SubscribeOnceError::Timeout
    ));
}

#[tokio::test]
async fn decode_failure_is_delivered_to_every_registered_waiter() {
    let (backend, inbound) = FakeBackingStore::new();
    let backend = Arc::new(backend);
    let mux = Arc::new(SubscriptionMultiplexer::new(backend.clone(), handler()));
    tokio::spawn(Arc::clone(&mux).run_dispatch_loop(inbound));

    let mux1 = mux.clone();
    let w1 = tokio::spawn(async move {
        mux1.subscribe_once("chan_done", Duration::from_millis(500), failing_probe())
            .await
    });
    let mux2 = mux.clone();
    let w2 = tokio::spawn(async move {
        mux2.subscribe_once("chan_done", Duration::from_millis(500), failing_probe())
            .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    use memolock::backing_store::BackingStore;
    backend.publish("chan_done", "bad-payload").await.unwrap();

    assert!(matches!(
        w1.await.unwrap().unwrap_err(),
        memolock::multiplexer::SubscribeOnceError::Decode(_)
    ));
    assert!(matches!(
        w2.await.unwrap().unwrap_err(),
        memolock::multiplexer::SubscribeOnceError::Decode(_)
    ));
}
