//! Error taxonomy for the memolock core.
//!
//! Mirrors the propagation policy in spec §7: a `MemolockError` is the only
//! error ever returned to a caller of [`crate::client::Client::get`] /
//! [`crate::coordinator::MemolockCore::get`]. Best-effort cleanup failures
//! and user-callback panics never reach this type — they are routed to the
//! configured [`crate::config::ErrorHandler`] instead.

use thiserror::Error;

/// Error surfaced by a [`crate::backing_store::BackingStore`] implementation.
///
/// Kept distinct from the concrete client's own error type (e.g.
/// `redis::RedisError`) so that callers depending only on the trait aren't
/// forced to pull in a specific backing-store crate.
#[derive(Debug, Error)]
pub enum BackingStoreError {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[error("backing store operation timed out")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

/// The error returned from a `Get` call (spec §7).
#[derive(Debug, Error)]
pub enum MemolockError {
    /// The backing store itself failed (connection, command, pipeline).
    #[error("backing store error: {0}")]
    Backing(#[from] BackingStoreError),

    /// The user-supplied `fetch` function failed. The original error is
    /// preserved verbatim (spec §7 class 1).
    #[error("fetch failed: {0}")]
    Fetch(#[source] anyhow::Error),

    /// A `decode` call failed, either on a direct cache hit or on a
    /// published done-channel payload (spec §7 class 2).
    #[error("decode failed: {0}")]
    Decode(#[source] anyhow::Error),

    /// `maxAttempts` was exhausted waiting for the done channel (spec §7
    /// class 5). The message is a fixed literal per spec §6/§8 — tests
    /// depend on this exact wording.
    #[error("Never received message that key was unlocked.")]
    Timeout,
}
