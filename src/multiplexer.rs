//! The one-shot subscription multiplexer (spec §4.B).
//!
//! Amortizes one upstream subscription per channel over any number of local
//! waiters and guarantees each waiter's wait resolves exactly once — on
//! message, decode error, or timeout.
//!
//! Spec §9 leaves the single-fire mechanism to "that language's idiomatic
//! single-fire primitive rather than re-emit the ad-hoc flag" used by the
//! original. In Rust that primitive is a [`tokio::sync::oneshot::Sender`]:
//! each waiter owns exactly one, consumed at most once, and the shared
//! per-channel `Mutex` makes the choice of *who* consumes it (the dispatch
//! loop delivering a message, or this waiter's own timeout) race-free. A
//! waiter whose slot has already been removed by the other path simply
//! never has its sender called — there is no separate "already fired"
//! flag to maintain.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};

use crate::backing_store::{InboundMessage, SubscriptionBackingStore};
use crate::config::ErrorHandler;
use crate::error::BackingStoreError;

/// A probe run once per inbound message to detect decode failures centrally
/// (spec §4.B: "Invoke decode(payload)... on exception, deliver onError to
/// every error listener"). Each waiter still performs its own typed decode
/// independently once it receives the raw payload — see
/// [`crate::coordinator::MemolockCore`] — so this probe only needs to
/// confirm the *shape* of decode used by the channel's first subscriber
/// succeeds; in practice every waiter on a given done-channel shares the
/// same `decode` because they share the same cache key and `Client`.
pub type DecodeProbe = Arc<dyn Fn(&str) -> anyhow::Result<()> + Send + Sync>;

enum WaiterOutcome {
    Message(String),
    Decode(String),
}

struct WaiterSlot {
    id: u64,
    sender: oneshot::Sender<WaiterOutcome>,
}

struct ChannelEntry {
    decode_probe: DecodeProbe,
    waiters: Vec<WaiterSlot>,
}

#[derive(Debug, Error)]
pub enum SubscribeOnceError {
    #[error("upstream subscribe failed: {0}")]
    UpstreamSubscribe(#[source] BackingStoreError),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("timed out waiting for done-channel message")]
    Timeout,
}

/// Fans a single upstream subscription per channel out to N local waiters.
///
/// Owned and shared (behind an `Arc`) by exactly one [`crate::coordinator::MemolockCore`].
pub struct SubscriptionMultiplexer {
    backend: Arc<dyn SubscriptionBackingStore>,
    channels: Mutex<HashMap<String, ChannelEntry>>,
    error_handler: ErrorHandler,
    next_waiter_id: AtomicU64,
}

impl SubscriptionMultiplexer {
    pub fn new(backend: Arc<dyn SubscriptionBackingStore>, error_handler: ErrorHandler) -> Self {
        Self {
            backend,
            channels: Mutex::new(HashMap::new()),
            error_handler,
            next_waiter_id: AtomicU64::new(0),
        }
    }

    /// Drains the backing store's inbound message stream, dispatching each
    /// message to every waiter currently registered on its channel. Runs
    /// for the lifetime of the multiplexer; intended to be spawned once as
    /// a background task.
    pub async fn run_dispatch_loop(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<InboundMessage>) {
        while let Some(message) = inbound.recv().await {
            self.dispatch(message).await;
        }
    }

    /// Registers a one-shot wait on `channel` (spec §4.B `SubscribeOnce`).
    ///
    /// Returns the raw payload on success; the caller (the coordinator) is
    /// responsible for decoding it into the concrete value type.
    pub async fn subscribe_once(
        &self,
        channel: &str,
        timeout: Duration,
        decode_probe: DecodeProbe,
    ) -> Result<String, SubscribeOnceError> {
        let waiter_id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let newly_created = {
            let mut channels = self.channels.lock().await;
            match channels.get_mut(channel) {
                Some(entry) => {
                    entry.waiters.push(WaiterSlot { id: waiter_id, sender: tx });
                    false
                }
                None => {
                    channels.insert(
                        channel.to_string(),
                        ChannelEntry {
                            decode_probe,
                            waiters: vec![WaiterSlot { id: waiter_id, sender: tx }],
                        },
                    );
                    true
                }
            }
        };

        if newly_created {
            if let Err(err) = self.backend.subscribe(channel).await {
                // Upstream subscribe failed: surfaced to this caller only
                // (spec §4.B failure modes). Remove just this waiter;
                // leave the entry if other callers joined concurrently
                // before the subscribe failure was observed.
                self.drop_waiter(channel, waiter_id, /* unsubscribe_if_empty */ false)
                    .await;
                return Err(SubscribeOnceError::UpstreamSubscribe(err));
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(WaiterOutcome::Message(payload))) => Ok(payload),
            Ok(Ok(WaiterOutcome::Decode(message))) => Err(SubscribeOnceError::Decode(message)),
            Ok(Err(_sender_dropped)) => Err(SubscribeOnceError::Timeout),
            Err(_elapsed) => {
                self.drop_waiter(channel, waiter_id, true).await;
                Err(SubscribeOnceError::Timeout)
            }
        }
    }

    async fn drop_waiter(&self, channel: &str, waiter_id: u64, unsubscribe_if_empty: bool) {
        let should_unsubscribe = {
            let mut channels = self.channels.lock().await;
            let Some(entry) = channels.get_mut(channel) else {
                return;
            };
            entry.waiters.retain(|w| w.id != waiter_id);
            if entry.waiters.is_empty() {
                channels.remove(channel);
                unsubscribe_if_empty
            } else {
                false
            }
        };
        if should_unsubscribe {
            self.best_effort_unsubscribe(channel).await;
        }
    }

    async fn dispatch(&self, message: InboundMessage) {
        // Snapshot and delete before invoking callbacks (spec §4.B), so a
        // reentrant `subscribe_once` called while processing this message
        // starts a fresh epoch rather than joining the one being torn down.
        let entry = {
            let mut channels = self.channels.lock().await;
            channels.remove(&message.channel)
        };
        let Some(entry) = entry else {
            debug!(channel = %message.channel, "memolock: discarding message on stale/unsolicited channel");
            return;
        };

        match (entry.decode_probe)(&message.payload) {
            Ok(()) => {
                for waiter in entry.waiters {
                    let _ = waiter.sender.send(WaiterOutcome::Message(message.payload.clone()));
                }
            }
            Err(err) => {
                let text = err.to_string();
                for waiter in entry.waiters {
                    let _ = waiter.sender.send(WaiterOutcome::Decode(text.clone()));
                }
            }
        }

        self.best_effort_unsubscribe(&message.channel).await;
    }

    /// Shuts down the upstream subscription connection (spec §4.D
    /// `Disconnect`).
    pub async fn disconnect(&self) -> Result<(), BackingStoreError> {
        self.backend.disconnect().await
    }

    async fn best_effort_unsubscribe(&self, channel: &str) {
        if let Err(err) = self.backend.unsubscribe(channel).await {
            warn!(channel = %channel, error = %err, "memolock: upstream unsubscribe failed");
            (self.error_handler)(&err);
        }
    }
}
