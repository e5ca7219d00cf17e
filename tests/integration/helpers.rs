//! In-memory stand-in for Redis, exercising the real coordinator and
//! multiplexer against the [`BackingStore`]/[`SubscriptionBackingStore`]
//! traits instead of a live server.
//!
//! Grounded on the teacher's own integration-test fakes (`TestStorage`,
//! `TestMlService` in this crate's teacher's `tests/integration/helpers.rs`):
//! a plain struct implementing the trait with `async_trait`, no mocking
//! framework, held behind an `Arc` and shared across the test's concurrent
//! callers. Spec §4.A explicitly allows a single backing implementation to
//! satisfy both traits when the store supports mixed command/subscribe
//! mode — this fake does, since it never blocks on real sockets.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use memolock::backing_store::{BackingStore, InboundMessage, PipelineOp, SubscriptionBackingStore};
use memolock::error::BackingStoreError;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

struct Entry {
    value: String,
    expires_at: Instant,
}

struct Inner {
    store: HashMap<String, Entry>,
    subscribed: HashSet<String>,
    outbound: mpsc::UnboundedSender<InboundMessage>,
}

/// Shared fake standing in for both the command and subscription Redis
/// connections spec §4.A calls out. `clone()` returns a cheap handle onto
/// the same underlying state, the way a real `RedisBackingStore` would be
/// shared behind an `Arc`.
#[derive(Clone)]
pub struct FakeBackingStore {
    inner: Arc<Mutex<Inner>>,
}

impl FakeBackingStore {
    /// Builds the fake and returns it alongside the inbound message stream
    /// the multiplexer's dispatch loop drains — the fake's analogue of
    /// `RedisSubscriptionClient::connect`'s returned receiver.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<InboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            store: HashMap::new(),
            subscribed: HashSet::new(),
            outbound: tx,
        };
        (
            Self {
                inner: Arc::new(Mutex::new(inner)),
            },
            rx,
        )
    }

    async fn get_live(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock().await;
        let live = match inner.store.get(key) {
            Some(e) if e.expires_at > Instant::now() => true,
            Some(_) => false,
            None => return None,
        };
        if live {
            inner.store.get(key).map(|e| e.value.clone())
        } else {
            inner.store.remove(key);
            None
        }
    }
}

#[async_trait]
impl BackingStore for FakeBackingStore {
    async fn get(&self, key: &str) -> Result<Option<String>, BackingStoreError> {
        Ok(self.get_live(key).await)
    }

    async fn set_px(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackingStoreError> {
        let mut inner = self.inner.lock().await;
        inner.store.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn set_nx_px(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, BackingStoreError> {
        if self.get_live(key).await.is_some() {
            return Ok(false);
        }
        let mut inner = self.inner.lock().await;
        inner.store.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<u64, BackingStoreError> {
        let mut inner = self.inner.lock().await;
        Ok(if inner.store.remove(key).is_some() { 1 } else { 0 })
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BackingStoreError> {
        let inner = self.inner.lock().await;
        if inner.subscribed.contains(channel) {
            let _ = inner.outbound.send(InboundMessage {
                channel: channel.to_string(),
                payload: payload.to_string(),
            });
        }
        Ok(())
    }

    async fn pipeline(&self, ops: &[PipelineOp<'_>]) -> Result<(), BackingStoreError> {
        for op in ops {
            match op {
                PipelineOp::SetPx { key, value, ttl } => self.set_px(key, value, *ttl).await?,
                PipelineOp::Publish { channel, payload } => self.publish(channel, payload).await?,
                PipelineOp::Del { key } => {
                    self.del(key).await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionBackingStore for FakeBackingStore {
    async fn subscribe(&self, channel: &str) -> Result<(), BackingStoreError> {
        self.inner.lock().await.subscribed.insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BackingStoreError> {
        self.inner.lock().await.subscribed.remove(channel);
        Ok(())
    }
}

/// A fetch function standing in for the user-supplied `fetch` in spec §4.C:
/// returns the current counter value, then increments it — matching the
/// literal fixture spec §8's end-to-end scenarios are written against.
pub struct CountingFetcher {
    counter: AtomicU64,
}

impl CountingFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            counter: AtomicU64::new(0),
        })
    }

    pub fn calls(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    pub async fn fetch(&self) -> anyhow::Result<u64> {
        Ok(self.counter.fetch_add(1, Ordering::SeqCst))
    }
}

/// A fetcher that fails its first `N` calls with the given message, then
/// behaves like [`CountingFetcher`] — the fixture spec §8 scenario 3 needs.
pub struct FlakyFetcher {
    calls: AtomicU64,
    fail_first: u64,
}

impl FlakyFetcher {
    pub fn new(fail_first: u64) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU64::new(0),
            fail_first,
        })
    }

    pub async fn fetch(&self) -> anyhow::Result<u64> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            anyhow::bail!("synthetic fetch failure on call #{call}");
        }
        Ok(call - self.fail_first)
    }
}
