//! The lock/wait coordinator (spec §4.C) — the memolock algorithm itself.
//!
//! Grounded directly on `infrastructure/cache/redis_cache.rs::RedisCache::get_or_fetch`:
//! same shape (read-through, `SET NX PX` lock race, fetcher/waiter branch,
//! retry loop, "backing-store failures are degraded, fetch failures are
//! fatal to the caller" philosophy), generalized from that module's single
//! bespoke stale-while-revalidate cache into the full distributed lock/wait
//! protocol of spec §4.C.
//!
//! One deliberate departure from the teacher: `RedisCache::get_or_fetch`
//! falls back to a direct, unprotected fetch whenever the backing store
//! itself is unreachable (its own "degraded, not fatal" policy for an
//! opportunistic cache). This coordinator does not — a backing-store
//! failure while reading the cache is returned to the caller as
//! [`MemolockError::Backing`], and a failure while *acquiring* the lock is
//! treated as "not acquired" rather than "fetch directly", because either
//! shortcut would let two processes fetch concurrently, which is exactly
//! the property spec §8 requires ("at most one fetcher per key").
//!
//! Retries are modeled as a loop over `opts.max_attempts`, not recursion —
//! spec §4.C's `Get(key, opts, fetch, attempts=0)` recursion and this loop
//! are observationally identical (each iteration re-reads the cache first,
//! exactly like a fresh recursive call would), and the loop avoids the
//! `Box::pin` boxing async recursion would otherwise require.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::backing_store::{BackingStore, PipelineOp};
use crate::config::MemolockOptions;
use crate::error::MemolockError;
use crate::multiplexer::{DecodeProbe, SubscribeOnceError, SubscriptionMultiplexer};

enum AcquireOutcome<V> {
    Resolved(V),
    Retry,
}

/// Owns the per-instance state spec §3 calls out: `lockedLocally` and (via
/// the [`SubscriptionMultiplexer`] it holds) `subInfo`. One `MemolockCore`
/// is constructed per process and shared behind an `Arc`, exactly as the
/// teacher constructs one `RedisCache`/`RedisQueue` in `main.rs` and shares
/// them across handlers.
pub struct MemolockCore {
    backend: Arc<dyn BackingStore>,
    multiplexer: Arc<SubscriptionMultiplexer>,
    locked_locally: Mutex<HashSet<String>>,
}

impl MemolockCore {
    pub fn new(backend: Arc<dyn BackingStore>, multiplexer: Arc<SubscriptionMultiplexer>) -> Self {
        Self {
            backend,
            multiplexer,
            locked_locally: Mutex::new(HashSet::new()),
        }
    }

    /// Raw string-keyed delete (spec §4.D: "A cache service also exposes
    /// Get/Delete/Set directly ... for callers that do not want a typed
    /// client"). Invalidates the cache only — does not touch the lock
    /// sentinel or notify waiters (spec §6: "does not interrupt an
    /// in-flight fetch").
    pub async fn delete(&self, key: &str) -> Result<u64, MemolockError> {
        Ok(self.backend.del(key).await?)
    }

    /// Raw string-keyed cache warm (spec §4.D `Set`). Races with any
    /// in-flight `Get` pipeline on the same key — last writer to the
    /// pipeline wins (spec §6). This is intentional per spec §9's Open
    /// Question and is not resolved here; see DESIGN.md.
    pub async fn set<V>(&self, key: &str, value: &V, ttl: Duration) -> Result<(), MemolockError>
    where
        V: Serialize,
    {
        let encoded = encode_default(value).map_err(MemolockError::Decode)?;
        self.backend.set_px(key, &encoded, ttl).await?;
        Ok(())
    }

    /// Quits both backing-store resources concurrently (spec §4.D
    /// `Disconnect`), swallowing "already closed" style failures rather
    /// than surfacing them — there is no caller left to surface them to.
    pub async fn disconnect(&self) {
        let (command_result, subscription_result) =
            tokio::join!(self.backend.disconnect(), self.multiplexer.disconnect());
        if let Err(err) = command_result {
            warn!(error = %err, "memolock: command connection disconnect reported an error");
        }
        if let Err(err) = subscription_result {
            warn!(error = %err, "memolock: subscription connection disconnect reported an error");
        }
    }

    /// The memolock algorithm (spec §4.C `Get`).
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
        let lock_key = format!("{key}:lock");
        let done_channel = format!("{key}_done");
        let max_attempts = opts.max_attempts.max(1);

        for attempt in 0..max_attempts {
            if !opts.force_refresh {
                match self.backend.get(key).await {
                    Ok(Some(raw)) => {
                        debug!(key, "memolock: cache hit");
                        return (opts.decode)(&raw).map_err(MemolockError::Decode);
                    }
                    Ok(None) => {
                        debug!(key, attempt, "memolock: cache miss");
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            match self
                .acquire_or_wait(key, &lock_key, &done_channel, opts, &fetch)
                .await?
            {
                AcquireOutcome::Resolved(value) => return Ok(value),
                AcquireOutcome::Retry => continue,
            }
        }

        Err(MemolockError::Timeout)
    }

    async fn acquire_or_wait<V, F, Fut>(
        &self,
        key: &str,
        lock_key: &str,
        done_channel: &str,
        opts: &MemolockOptions<V>,
        fetch: &F,
    ) -> Result<AcquireOutcome<V>, MemolockError>
    where
        V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = anyhow::Result<V>> + Send,
    {
        let already_locked_locally = {
            let mut locked = self.locked_locally.lock().await;
            if locked.contains(key) {
                true
            } else {
                locked.insert(key.to_string());
                false
            }
        };

        let acquired = if already_locked_locally {
            false
        } else {
            match self.backend.set_nx_px(lock_key, "locked", opts.lock_timeout).await {
                Ok(acquired) => acquired,
                Err(err) => {
                    warn!(key, error = %err, "memolock: SET NX failed acquiring lock, treating as not-acquired");
                    (opts.error_handler)(&err);
                    false
                }
            }
        };

        if acquired {
            let value = self.run_fetcher(key, lock_key, done_channel, opts, fetch).await?;
            Ok(AcquireOutcome::Resolved(value))
        } else {
            self.run_waiter(key, done_channel, opts).await
        }
    }

    async fn run_fetcher<V, F, Fut>(
        &self,
        key: &str,
        lock_key: &str,
        done_channel: &str,
        opts: &MemolockOptions<V>,
        fetch: &F,
    ) -> Result<V, MemolockError>
    where
        V: Serialize + Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = anyhow::Result<V>> + Send,
    {
        debug!(key, "memolock: lock acquired, fetching from source");
        let fetch_result = fetch().await;
        self.locked_locally.lock().await.remove(key);

        let value = match fetch_result {
            Ok(value) => value,
            Err(err) => {
                if let Err(del_err) = self.backend.del(lock_key).await {
                    warn!(key, error = %del_err, "memolock: failed to release lock after fetch failure, will auto-expire");
                    (opts.error_handler)(&del_err);
                }
                return Err(MemolockError::Fetch(err));
            }
        };

        match (opts.encode)(&value) {
            Ok(encoded) => {
                let ttl = opts.ttl.resolve(&value);
                let cache_if = (opts.cache_if)(&value);
                let mut ops = Vec::with_capacity(3);
                if cache_if {
                    ops.push(PipelineOp::SetPx {
                        key,
                        value: &encoded,
                        ttl,
                    });
                }
                ops.push(PipelineOp::Publish {
                    channel: done_channel,
                    payload: &encoded,
                });
                ops.push(PipelineOp::Del { key: lock_key });

                if let Err(err) = self.backend.pipeline(&ops).await {
                    warn!(
                        key,
                        error = %err,
                        "memolock: fetch succeeded but cache/publish pipeline failed, response served uncached"
                    );
                    (opts.error_handler)(&err);
                }
            }
            Err(encode_err) => {
                error!(key, error = %encode_err, "memolock: encode failed, skipping cache write and waiter notification");
                if let Err(del_err) = self.backend.del(lock_key).await {
                    warn!(key, error = %del_err, "memolock: failed to release lock after encode failure");
                    (opts.error_handler)(&del_err);
                }
            }
        }

        Ok(value)
    }

    async fn run_waiter<V>(
        &self,
        key: &str,
        done_channel: &str,
        opts: &MemolockOptions<V>,
    ) -> Result<AcquireOutcome<V>, MemolockError>
    where
        V: DeserializeOwned + Send + Sync + 'static,
    {
        let decode_for_probe = opts.decode.clone();
        let probe: DecodeProbe = Arc::new(move |payload: &str| decode_for_probe(payload).map(|_| ()));

        let outcome = self
            .multiplexer
            .subscribe_once(done_channel, opts.lock_timeout, probe)
            .await;

        self.locked_locally.lock().await.remove(key);

        match outcome {
            Ok(raw_payload) => {
                let value = (opts.decode)(&raw_payload).map_err(MemolockError::Decode)?;
                Ok(AcquireOutcome::Resolved(value))
            }
            // Spec §7 class 3: surfaced to the subscribing caller only, not
            // retried — unlike a timeout, there is no reason to expect a
            // second attempt at the same upstream subscribe to behave
            // differently.
            Err(SubscribeOnceError::UpstreamSubscribe(err)) => {
                debug!(key, error = %err, "memolock: upstream subscribe failed while waiting");
                Err(MemolockError::Backing(err))
            }
            // Spec §7 class 2 + §8 scenario 6: a decode failure on the
            // done-channel payload is user-visible on this waiter's `Get`
            // immediately. It must NOT be folded into the retry/exhaustion
            // path — the fetcher already resolved its own caller with the
            // in-memory value, so retrying here would only ever observe the
            // same bad payload (or nothing, once the channel is gone).
            Err(SubscribeOnceError::Decode(msg)) => {
                debug!(key, error = %msg, "memolock: done-channel payload failed to decode");
                Err(MemolockError::Decode(anyhow::anyhow!(msg)))
            }
            Err(SubscribeOnceError::Timeout) => {
                debug!(key, "memolock: timed out waiting for done-channel message, retrying");
                Ok(AcquireOutcome::Retry)
            }
        }
    }
}

fn encode_default<V: Serialize>(value: &V) -> anyhow::Result<String> {
    let json = serde_json::to_string(value)?;
    Ok(if json.is_empty() { "null".to_string() } else { json })
}
