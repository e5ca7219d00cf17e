//! User-facing configuration (spec §6).
//!
//! This is deliberately *not* an env-var loader like `through-your-letters`'s
//! `Config::from_env()` — spec §1 places configuration loading for a whole
//! deployable service out of scope. What remains in scope is the enumerated
//! per-client/per-call options table: a plain struct with documented
//! defaults, built and overridden the way the teacher crate's narrower
//! feature configs (e.g. its rate limiter and performance-monitor configs)
//! are, rather than the monolithic app `Config`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::BackingStoreError;

/// Sink for best-effort cleanup failures and swallowed user-callback panics
/// (spec §7 classes 4 and 6). Defaults to logging via `tracing::error!`,
/// the same "log loudly, never fail the caller" posture
/// `infrastructure/cache/redis_cache.rs` uses for degraded Redis ops.
pub type ErrorHandler = Arc<dyn Fn(&BackingStoreError) + Send + Sync>;

pub(crate) fn default_error_handler() -> ErrorHandler {
    Arc::new(|err| {
        tracing::error!(error = %err, "memolock: best-effort cleanup failed");
    })
}

/// Cache TTL (spec §6): either a fixed duration or a function of the
/// produced value, evaluated once per successful fetch. `0` means "skip
/// caching on a per-value basis" per spec §8 boundary behavior.
#[derive(Clone)]
pub enum Ttl<V> {
    Fixed(Duration),
    OfValue(Arc<dyn Fn(&V) -> Duration + Send + Sync>),
}

impl<V> Ttl<V> {
    pub fn resolve(&self, value: &V) -> Duration {
        match self {
            Ttl::Fixed(d) => *d,
            Ttl::OfValue(f) => f(value),
        }
    }
}

type EncodeFn<V> = Arc<dyn Fn(&V) -> anyhow::Result<String> + Send + Sync>;
type DecodeFn<V> = Arc<dyn Fn(&str) -> anyhow::Result<V> + Send + Sync>;
type CacheIfFn<V> = Arc<dyn Fn(&V) -> bool + Send + Sync>;

/// Per-call options for [`crate::coordinator::MemolockCore::get`] and the
/// client surface built on top of it. Field names and defaults match the
/// enumerated table in spec §6 exactly.
#[derive(Clone)]
pub struct MemolockOptions<V> {
    /// Cache TTL; required (no default), may be zero.
    pub ttl: Ttl<V>,
    /// Lock sentinel TTL and waiter subscription timeout. Default 1000ms.
    pub lock_timeout: Duration,
    /// Total attempts before `Get` gives up with [`crate::error::MemolockError::Timeout`]. Default 3.
    pub max_attempts: u32,
    /// Skip the initial cache read; still participates in the lock protocol. Default false.
    pub force_refresh: bool,
    pub encode: EncodeFn<V>,
    pub decode: DecodeFn<V>,
    /// If false, publish to waiters but skip the `SET`. Default: always true.
    pub cache_if: CacheIfFn<V>,
    pub error_handler: ErrorHandler,
}

fn default_encode<V: Serialize>(value: &V) -> anyhow::Result<String> {
    let json = serde_json::to_string(value)?;
    // spec §6: JSON.stringify of an empty/absent result is stored as the
    // literal string "null", never as an empty string.
    Ok(if json.is_empty() {
        "null".to_string()
    } else {
        json
    })
}

fn default_decode<V: DeserializeOwned>(payload: &str) -> anyhow::Result<V> {
    Ok(serde_json::from_str(payload)?)
}

impl<V> MemolockOptions<V>
where
    V: Serialize + DeserializeOwned + 'static,
{
    /// Builds options with every documented default except `ttl`, which
    /// spec §6 marks as required.
    pub fn new(ttl: Ttl<V>) -> Self {
        Self {
            ttl,
            lock_timeout: Duration::from_millis(1000),
            max_attempts: 3,
            force_refresh: false,
            encode: Arc::new(default_encode::<V>),
            decode: Arc::new(default_decode::<V>),
            cache_if: Arc::new(|_| true),
            error_handler: default_error_handler(),
        }
    }

    pub fn with_ttl_millis(mut self, millis: u64) -> Self {
        self.ttl = Ttl::Fixed(Duration::from_millis(millis));
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    pub fn with_cache_if(mut self, cache_if: impl Fn(&V) -> bool + Send + Sync + 'static) -> Self {
        self.cache_if = Arc::new(cache_if);
        self
    }

    pub fn with_codec(
        mut self,
        encode: impl Fn(&V) -> anyhow::Result<String> + Send + Sync + 'static,
        decode: impl Fn(&str) -> anyhow::Result<V> + Send + Sync + 'static,
    ) -> Self {
        self.encode = Arc::new(encode);
        self.decode = Arc::new(decode);
        self
    }

    pub fn with_error_handler(
        mut self,
        handler: impl Fn(&BackingStoreError) + Send + Sync + 'static,
    ) -> Self {
        self.error_handler = Arc::new(handler);
        self
    }
}
