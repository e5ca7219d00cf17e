//! A distributed memoization lock (a "memolock") backed by a shared
//! key-value store with publish/subscribe capability (e.g. Redis).
//!
//! Coordinates concurrent requests across many processes so that for any
//! given cache key, at most one fetch of the underlying expensive resource
//! is in progress at a time; all other concurrent callers — local or on
//! other nodes — block on a notification channel and receive the computed
//! value as soon as it becomes available, without themselves invoking the
//! fetch.
//!
//! This is not a replacement for a strongly consistent distributed lock:
//! the correctness target is "avoid duplicate work under normal operation,
//! make progress under all failures", not mutual exclusion under arbitrary
//! partitioned conditions.
//!
//! # Layout
//!
//! - [`backing_store`] — the facade the core depends on instead of a
//!   concrete client crate, plus a Redis implementation.
//! - [`multiplexer`] — fans one upstream pub/sub subscription per channel
//!   out to any number of local waiters.
//! - [`coordinator`] — the lock/wait algorithm itself.
//! - [`client`] — the typed and raw façades applications use.
//! - [`config`] — per-call options (TTL, lock timeout, codec, ...).
//! - [`error`] — the error taxonomy surfaced to callers.

pub mod backing_store;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod multiplexer;

pub use client::{Cache, Client, connect_redis};
pub use config::{MemolockOptions, Ttl};
pub use coordinator::MemolockCore;
pub use error::{BackingStoreError, MemolockError};
