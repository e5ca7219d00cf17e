//! The backing-store facade (spec §4.A).
//!
//! A narrow interface the coordinator and multiplexer depend on instead of
//! a concrete client crate. Grounded on the teacher's own narrow
//! infrastructure traits (`StorageService`, `LetteringRepository`): one
//! `#[async_trait]` per responsibility, `Send + Sync` so it can live behind
//! an `Arc` shared across tasks.
//!
//! Command operations (`get`/`set_px`/`set_nx_px`/`del`/`publish`/pipeline)
//! and subscription operations (`subscribe`/`unsubscribe`) are split into
//! two traits on purpose: spec §4.A calls this the "dual-client
//! discipline" — many pub/sub implementations refuse ordinary commands on a
//! connection that has entered subscribe mode, so the core never assumes
//! the two are the same connection. An implementation backed by a store
//! that *does* support mixed mode may implement both traits on one type.

pub mod redis;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::BackingStoreError;

/// One operation inside a [`BackingStore::pipeline`] batch (spec §4.A).
///
/// The facade preserves submission order but does not require transactional
/// atomicity from the underlying store — spec §4.A: "best-effort batching:
/// ordering preserved, no transactional guarantee required".
pub enum PipelineOp<'a> {
    SetPx {
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    },
    Publish {
        channel: &'a str,
        payload: &'a str,
    },
    Del {
        key: &'a str,
    },
}

/// Typed command operations the coordinator needs (spec §4.A table).
#[async_trait]
pub trait BackingStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, BackingStoreError>;

    async fn set_px(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackingStoreError>;

    /// `SET key value NX PX ttl`. Returns `true` iff this call acquired the
    /// key (i.e. the store reports "OK", meaning it was previously absent).
    async fn set_nx_px(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, BackingStoreError>;

    /// Deletes `key`, returning the number of keys actually removed.
    async fn del(&self, key: &str) -> Result<u64, BackingStoreError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BackingStoreError>;

    /// Atomically batches a sequence of ops, preserving submission order.
    async fn pipeline(&self, ops: &[PipelineOp<'_>]) -> Result<(), BackingStoreError>;

    /// Best-effort shutdown (spec §4.D `Disconnect`). Default is a no-op,
    /// appropriate for connections with no explicit close step.
    async fn disconnect(&self) -> Result<(), BackingStoreError> {
        Ok(())
    }
}

/// Subscription-mode operations (spec §4.A). Kept on a distinct trait
/// because a real Redis client cannot issue these from the same connection
/// used for [`BackingStore`] commands.
#[async_trait]
pub trait SubscriptionBackingStore: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<(), BackingStoreError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), BackingStoreError>;

    /// Best-effort shutdown (spec §4.D `Disconnect`).
    async fn disconnect(&self) -> Result<(), BackingStoreError> {
        Ok(())
    }
}

/// A single inbound pub/sub message, handed to the multiplexer's dispatch
/// loop. Reifies spec §4.A's "OnMessage(handler) — registers a
/// process-wide inbound handler `(channel, payload) -> void`" as a channel
/// read instead of a callback registration, which is the idiomatic Rust
/// shape for a single-consumer event stream.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel: String,
    pub payload: String,
}
