//! Redis-backed implementation of the backing-store facade.
//!
//! Grounded on `infrastructure/cache/redis_cache.rs::RedisCache` and
//! `infrastructure/queue/redis_queue.rs::RedisQueue`: both hold a bare
//! `redis::Client` and open a fresh `MultiplexedConnection` per call rather
//! than pooling one themselves (the multiplexed connection already
//! pipelines concurrent callers over one socket). `RedisBackingStore`
//! follows the same shape for the command side.
//!
//! The subscription side is its own type, `RedisSubscriptionClient`, per
//! spec §4.A's dual-client discipline: a dedicated background task owns a
//! `redis::aio::PubSub` connection for the lifetime of the process and
//! forwards every inbound message to the multiplexer over an unbounded
//! channel, since `PubSub::on_message()` borrows the connection mutably and
//! cannot be interleaved with issuing new `SUBSCRIBE`/`UNSUBSCRIBE` calls
//! from another task.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::PubSub;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use super::{BackingStore, InboundMessage, PipelineOp, SubscriptionBackingStore};
use crate::error::BackingStoreError;

pub struct RedisBackingStore {
    client: redis::Client,
}

impl RedisBackingStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    pub async fn connect(url: &str) -> Result<Self, BackingStoreError> {
        Ok(Self::new(redis::Client::open(url)?))
    }
}

#[async_trait]
impl BackingStore for RedisBackingStore {
    async fn get(&self, key: &str) -> Result<Option<String>, BackingStoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_px(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackingStoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_nx_px(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, BackingStoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let acquired = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<Option<String>>(&mut conn)
            .await
            .map(|v| v.is_some())?;
        Ok(acquired)
    }

    async fn del(&self, key: &str) -> Result<u64, BackingStoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let count: u64 = conn.del(key).await?;
        Ok(count)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BackingStoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn pipeline(&self, ops: &[PipelineOp<'_>]) -> Result<(), BackingStoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let mut pipe = redis::pipe();
        for op in ops {
            match op {
                PipelineOp::SetPx { key, value, ttl } => {
                    pipe.cmd("SET")
                        .arg(*key)
                        .arg(*value)
                        .arg("PX")
                        .arg(ttl.as_millis() as u64)
                        .ignore();
                }
                PipelineOp::Publish { channel, payload } => {
                    pipe.cmd("PUBLISH").arg(*channel).arg(*payload).ignore();
                }
                PipelineOp::Del { key } => {
                    pipe.cmd("DEL").arg(*key).ignore();
                }
            }
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }
}

enum SubCommand {
    Subscribe(String, oneshot::Sender<Result<(), BackingStoreError>>),
    Unsubscribe(String, oneshot::Sender<Result<(), BackingStoreError>>),
    Shutdown(oneshot::Sender<Result<(), BackingStoreError>>),
}

/// Handle for issuing subscribe/unsubscribe commands to the dedicated
/// subscription connection. Cloneable: every waiter's `SubscribeOnce` can
/// hold its own handle without touching the connection directly.
#[derive(Clone)]
pub struct RedisSubscriptionClient {
    commands: mpsc::UnboundedSender<SubCommand>,
}

impl RedisSubscriptionClient {
    /// Opens the dedicated subscription connection, spawns the background
    /// actor that owns it, and returns a handle plus the inbound message
    /// stream for the multiplexer to drain.
    pub async fn connect(
        url: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<InboundMessage>), BackingStoreError> {
        let client = redis::Client::open(url)?;
        let pubsub = client.get_async_connection().await?.into_pubsub();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_pubsub_actor(pubsub, cmd_rx, msg_tx));
        Ok((Self { commands: cmd_tx }, msg_rx))
    }
}

#[async_trait]
impl SubscriptionBackingStore for RedisSubscriptionClient {
    async fn subscribe(&self, channel: &str) -> Result<(), BackingStoreError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send_command(SubCommand::Subscribe(channel.to_string(), ack_tx))?;
        await_ack(ack_rx).await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BackingStoreError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send_command(SubCommand::Unsubscribe(channel.to_string(), ack_tx))?;
        await_ack(ack_rx).await
    }

    /// Asks the pub/sub actor to exit, swallowing a "the actor is already
    /// gone" failure the way spec §4.D asks `Disconnect` to swallow an
    /// "already closed" error from the underlying client.
    async fn disconnect(&self) -> Result<(), BackingStoreError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.send_command(SubCommand::Shutdown(ack_tx)).is_err() {
            return Ok(());
        }
        match await_ack(ack_rx).await {
            Ok(()) => Ok(()),
            Err(_already_gone) => Ok(()),
        }
    }
}

impl RedisSubscriptionClient {
    fn send_command(&self, command: SubCommand) -> Result<(), BackingStoreError> {
        self.commands
            .send(command)
            .map_err(|_| BackingStoreError::Other("subscription actor has shut down".into()))
    }
}

async fn await_ack(
    ack_rx: oneshot::Receiver<Result<(), BackingStoreError>>,
) -> Result<(), BackingStoreError> {
    ack_rx
        .await
        .map_err(|_| BackingStoreError::Other("subscription actor has shut down".into()))?
}

/// The sole owner of the subscription connection. Every iteration borrows
/// the connection just long enough to either forward one inbound message
/// or apply one subscribe/unsubscribe command, then drops the borrow
/// before looping — `PubSub::on_message()` cannot be held across a
/// `subscribe`/`unsubscribe` call on the same connection.
async fn run_pubsub_actor(
    mut pubsub: PubSub,
    mut commands: mpsc::UnboundedReceiver<SubCommand>,
    outbound: mpsc::UnboundedSender<InboundMessage>,
) {
    enum Event {
        Message(redis::Msg),
        Command(SubCommand),
        Closed,
    }

    loop {
        let event = {
            let mut stream = pubsub.on_message();
            tokio::select! {
                next = stream.next() => match next {
                    Some(msg) => Event::Message(msg),
                    None => Event::Closed,
                },
                next = commands.recv() => match next {
                    Some(cmd) => Event::Command(cmd),
                    None => Event::Closed,
                },
            }
        };

        match event {
            Event::Message(msg) => {
                let channel = msg.get_channel_name().to_string();
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if outbound.send(InboundMessage { channel, payload }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, channel = %channel, "memolock: dropping undecodable pub/sub payload");
                    }
                }
            }
            Event::Command(SubCommand::Subscribe(channel, ack)) => {
                let result = pubsub
                    .subscribe(&channel)
                    .await
                    .map_err(BackingStoreError::from);
                debug!(channel = %channel, ok = result.is_ok(), "memolock: upstream subscribe");
                let _ = ack.send(result);
            }
            Event::Command(SubCommand::Unsubscribe(channel, ack)) => {
                let result = pubsub
                    .unsubscribe(&channel)
                    .await
                    .map_err(BackingStoreError::from);
                let _ = ack.send(result);
            }
            Event::Command(SubCommand::Shutdown(ack)) => {
                debug!("memolock: pub/sub actor shutting down");
                let _ = ack.send(Ok(()));
                break;
            }
            Event::Closed => {
                error!("memolock: subscription connection closed, pub/sub actor exiting");
                break;
            }
        }
    }
}
