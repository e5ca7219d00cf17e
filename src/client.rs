//! The client surface (spec §4.D).
//!
//! Grounded on how the teacher constructs its own shared infrastructure:
//! one `RedisCache`/`RedisQueue` built once in `main.rs` from a single
//! `redis::Client` and handed out behind an `Arc` to every handler that
//! needs it. `connect_redis` here plays the same role — it wires a
//! [`RedisBackingStore`], a [`RedisSubscriptionClient`], and the
//! [`SubscriptionMultiplexer`]'s dispatch loop together once, and returns
//! the shared [`MemolockCore`] every [`Client`] is built on top of.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::backing_store::redis::{RedisBackingStore, RedisSubscriptionClient};
use crate::config::{ErrorHandler, MemolockOptions};
use crate::coordinator::MemolockCore;
use crate::error::MemolockError;
use crate::multiplexer::SubscriptionMultiplexer;

/// Connects to Redis and wires up the full coordination stack: a command
/// connection for [`crate::backing_store::BackingStore`] operations, a
/// dedicated subscription connection for the multiplexer (spec §4.A dual-
/// client discipline), and the dispatch loop that drains inbound pub/sub
/// messages into it. Returns the shared core every [`Client`]/[`Cache`]
/// should be built on top of.
pub async fn connect_redis(
    redis_url: &str,
    error_handler: ErrorHandler,
) -> Result<Arc<MemolockCore>, MemolockError> {
    let backend = Arc::new(RedisBackingStore::connect(redis_url).await?);
    let (subscription, inbound) = RedisSubscriptionClient::connect(redis_url).await?;
    let multiplexer = Arc::new(SubscriptionMultiplexer::new(Arc::new(subscription), error_handler));

    tokio::spawn(Arc::clone(&multiplexer).run_dispatch_loop(inbound));

    Ok(Arc::new(MemolockCore::new(backend, multiplexer)))
}

/// Raw string-keyed façade (spec §4.D: "A cache service also exposes
/// Get/Delete/Set directly... for callers that do not want a typed
/// client").
#[derive(Clone)]
pub struct Cache {
    core: Arc<MemolockCore>,
}

impl Cache {
    pub fn new(core: Arc<MemolockCore>) -> Self {
        Self { core }
    }

    pub async fn get<V, F, Fut>(
        &self,
        key: &str,
        opts: &MemolockOptions<V>,
        fetch: F,
    ) -> Result<V, MemolockError>
    where
        V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = anyhow::Result<V>> + Send,
    {
        self.core.get(key, opts, fetch).await
    }

    pub async fn delete(&self, key: &str) -> Result<u64, MemolockError> {
        self.core.delete(key).await
    }

    pub async fn set<V: Serialize>(
        &self,
        key: &str,
        value: &V,
        ttl: std::time::Duration,
    ) -> Result<(), MemolockError> {
        self.core.set(key, value, ttl).await
    }

    pub async fn disconnect(&self) {
        self.core.disconnect().await
    }
}

/// A typed client binding a caller-side key derivation (`get_key`) and a
/// fetch function to the coordinator (spec §4.D `New`).
///
/// `K` is the caller's input type; `V` is the cached value type. `get_key`
/// and `fetch` are plain closures rather than trait objects so that
/// monomorphized call sites pay no dynamic-dispatch cost — the same
/// tradeoff the teacher's generic `RedisCache::get<T>`/`get_or_fetch<T, F,
/// Fut>` make.
pub struct Client<K, V, G, F> {
    core: Arc<MemolockCore>,
    get_key: G,
    fetch: F,
    options: MemolockOptions<V>,
    _input: std::marker::PhantomData<fn(&K)>,
}

impl<K, V, G, F, Fut> Client<K, V, G, F>
where
    K: Sync,
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    G: Fn(&K) -> String + Send + Sync,
    F: Fn(&K) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<V>> + Send,
{
    pub fn new(core: Arc<MemolockCore>, get_key: G, fetch: F, options: MemolockOptions<V>) -> Self {
        Self {
            core,
            get_key,
            fetch,
            options,
            _input: std::marker::PhantomData,
        }
    }

    /// `Get(v)` (spec §4.D): derives `key = getKey(v)`, then calls
    /// `Coordinator.Get(key, opts, () => fetchFn(v))`.
    pub async fn get(&self, input: &K) -> Result<V, MemolockError> {
        let key = (self.get_key)(input);
        let fetch = &self.fetch;
        self.core.get(&key, &self.options, || fetch(input)).await
    }

    /// `Get(v, overrideOpts)` (spec §4.D): same as [`Client::get`] but with
    /// a per-call options override.
    pub async fn get_with(
        &self,
        input: &K,
        overrides: impl FnOnce(MemolockOptions<V>) -> MemolockOptions<V>,
    ) -> Result<V, MemolockError> {
        let key = (self.get_key)(input);
        let fetch = &self.fetch;
        let opts = overrides(self.options.clone());
        self.core.get(&key, &opts, || fetch(input)).await
    }

    /// `Delete(v)` (spec §4.D). Does not touch the lock sentinel or notify
    /// waiters.
    pub async fn delete(&self, input: &K) -> Result<u64, MemolockError> {
        let key = (self.get_key)(input);
        self.core.delete(&key).await
    }

    /// `Set(v, data)` (spec §4.D). Cache-warming only; races with any
    /// concurrent `Get` pipeline on the same key (spec §6, §9 Open
    /// Question — last writer to the pipeline wins, by design).
    pub async fn set(&self, input: &K, data: &V) -> Result<(), MemolockError> {
        let key = (self.get_key)(input);
        let ttl = self.options.ttl.resolve(data);
        self.core.set(&key, data, ttl).await
    }

    pub async fn disconnect(&self) {
        self.core.disconnect().await
    }
}
