//! Cross-process fan-out.
//!
//! Every message for a room is published to a shared bus as an [`Envelope`].
//! Every process, including the publisher, subscribes to the bus and hands
//! each envelope to its local [`ConnectionRegistry`]. Delivering only from the
//! subscription gives each connection exactly one copy per publish no matter
//! which process its peer is attached to.
//!
//! Delivery is at-most-once. The bus is a hint to refresh, not the durable
//! record; clients reconcile against the stored turns.
//!
//! ```text
//!   process A                      bus                      process B
//!   broadcast ──publish──▶  room:{room_id}  ──subscribe──▶ deliver_local
//!   deliver_local ◀──subscribe──┘
//! ```

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::{
    StreamExt,
    future,
    stream::{self, BoxStream},
};
use pairchat_core::RoomId;
use redis::{AsyncCommands, aio::ConnectionManager};
use serde::{Deserialize, Serialize};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::registry::{ConnId, ConnectionRegistry};

/// First re-subscribe delay after the subscription drops.
pub const RESUBSCRIBE_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound on the re-subscribe delay.
pub const RESUBSCRIBE_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Redis channel pattern every process subscribes to.
const REDIS_PATTERN: &str = "room:*";

/// Redis channel for a room.
fn redis_channel(room_id: &RoomId) -> String {
    format!("room:{room_id}")
}

/// Sending process and connection of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    /// Process id of the publisher
    pub process: String,
    /// Connection that produced the payload, within `process`
    pub conn: ConnId,
}

/// A payload addressed to every connection in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Target room
    pub room_id: RoomId,
    /// Originating connection, excluded from delivery
    #[serde(default)]
    pub origin: Option<Origin>,
    /// Text frame delivered verbatim
    pub payload: String,
}

/// Errors from the fan-out bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Connecting to the bus failed.
    #[error("bus connection failed: {0}")]
    Connect(String),

    /// Publishing an envelope failed.
    #[error("publish failed: {0}")]
    Publish(String),

    /// Subscribing failed.
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    /// An envelope could not be encoded.
    #[error("envelope encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Stream of envelopes from a subscription. Ends when the subscription drops.
pub type EnvelopeStream = BoxStream<'static, Envelope>;

/// Shared publish/subscribe channel between processes.
#[async_trait]
pub trait FanoutBus: Send + Sync + 'static {
    /// Publish an envelope to every subscriber.
    async fn publish(&self, envelope: &Envelope) -> Result<(), BusError>;

    /// Open a subscription covering every room.
    async fn subscribe(&self) -> Result<EnvelopeStream, BusError>;
}

/// In-process bus over a tokio broadcast channel.
///
/// Clones share the channel, so several [`Fanout`]s holding clones of one
/// `MemoryBus` behave like processes sharing one Redis.
#[derive(Clone)]
pub struct MemoryBus {
    tx: broadcast::Sender<Envelope>,
}

impl MemoryBus {
    /// Default channel capacity.
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Create a bus buffering up to `capacity` envelopes per slow subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBus").field("subscribers", &self.tx.receiver_count()).finish()
    }
}

#[async_trait]
impl FanoutBus for MemoryBus {
    async fn publish(&self, envelope: &Envelope) -> Result<(), BusError> {
        self.tx
            .send(envelope.clone())
            .map(|_| ())
            .map_err(|_| BusError::Publish("no subscribers".to_string()))
    }

    async fn subscribe(&self) -> Result<EnvelopeStream, BusError> {
        let rx = self.tx.subscribe();
        let stream = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => return Some((envelope, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "memory bus subscriber lagged, envelopes lost");
                    },
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Redis pub/sub bus. Publishes on `room:{room_id}`, subscribes to `room:*`.
///
/// The publisher is a [`ConnectionManager`], which re-dials with exponential
/// backoff after the socket drops. Publishes issued while it is down fail and
/// fall back to local delivery; later ones go through once it reconnects.
pub struct RedisBus {
    client: redis::Client,
    publisher: ConnectionManager,
}

impl RedisBus {
    /// Connect to Redis at `url`.
    ///
    /// # Errors
    ///
    /// Returns `BusError::Connect` if the URL is invalid or the server is
    /// unreachable.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(|e| BusError::Connect(e.to_string()))?;
        let publisher =
            client.get_connection_manager().await.map_err(|e| BusError::Connect(e.to_string()))?;
        tracing::info!("connected to redis fan-out bus");
        Ok(Self { client, publisher })
    }
}

impl fmt::Debug for RedisBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBus").finish_non_exhaustive()
    }
}

#[async_trait]
impl FanoutBus for RedisBus {
    async fn publish(&self, envelope: &Envelope) -> Result<(), BusError> {
        let payload = serde_json::to_string(envelope)?;
        let mut conn = self.publisher.clone();
        let _receivers: i64 = conn
            .publish(redis_channel(&envelope.room_id), payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<EnvelopeStream, BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        pubsub.psubscribe(REDIS_PATTERN).await.map_err(|e| BusError::Subscribe(e.to_string()))?;

        let stream = pubsub.into_on_message().filter_map(|msg| {
            let channel = msg.get_channel_name().to_string();
            let envelope = match msg.get_payload::<String>() {
                Ok(raw) => decode_envelope(&channel, &raw),
                Err(e) => {
                    tracing::warn!(%channel, "dropping non-text bus message: {e}");
                    None
                },
            };
            future::ready(envelope)
        });
        Ok(stream.boxed())
    }
}

/// Parse one bus payload, dropping it with a warning if it is not an
/// [`Envelope`].
fn decode_envelope(channel: &str, raw: &str) -> Option<Envelope> {
    match serde_json::from_str(raw) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            tracing::warn!(%channel, "dropping malformed envelope: {e}");
            None
        },
    }
}

/// How a broadcast reached its room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Published to the bus; subscribers deliver it.
    Published,
    /// The bus rejected the publish; delivered to this process's connections
    /// only.
    LocalFallback(usize),
}

/// Publishes room messages to the bus and delivers bus traffic locally.
pub struct Fanout {
    bus: Arc<dyn FanoutBus>,
    registry: Arc<ConnectionRegistry>,
    process_id: String,
}

impl Fanout {
    /// Create a fan-out for one process.
    pub fn new(
        bus: Arc<dyn FanoutBus>,
        registry: Arc<ConnectionRegistry>,
        process_id: impl Into<String>,
    ) -> Self {
        Self { bus, registry, process_id: process_id.into() }
    }

    /// This process's id, stamped into every envelope origin.
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// The local connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Send `payload` to every connection in `room_id`, across processes.
    ///
    /// `from` is the local connection that produced the payload; it does not
    /// receive its own message.
    pub async fn broadcast(
        &self,
        room_id: &RoomId,
        payload: String,
        from: Option<ConnId>,
    ) -> Delivery {
        let envelope = Envelope {
            room_id: room_id.clone(),
            origin: from.map(|conn| Origin { process: self.process_id.clone(), conn }),
            payload,
        };

        match self.bus.publish(&envelope).await {
            Ok(()) => Delivery::Published,
            Err(e) => {
                tracing::warn!(room_id = %room_id, "publish failed, delivering locally: {e}");
                let delivered = self.registry.deliver_local(room_id, &envelope.payload, from);
                Delivery::LocalFallback(delivered)
            },
        }
    }

    /// Deliver an envelope received from the bus to local connections.
    pub fn deliver(&self, envelope: &Envelope) -> usize {
        let exclude = envelope
            .origin
            .as_ref()
            .filter(|origin| origin.process == self.process_id)
            .map(|origin| origin.conn);
        self.registry.deliver_local(&envelope.room_id, &envelope.payload, exclude)
    }

    /// Subscribe to the bus and spawn the delivery loop.
    ///
    /// The first subscription attempt completes before this returns, so
    /// publishes made afterwards are observed. If it fails the loop keeps
    /// retrying in the background. The loop exits when `cancel` fires.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let first = match self.bus.subscribe().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                tracing::warn!("initial bus subscription failed, retrying: {e}");
                None
            },
        };
        let fanout = Arc::clone(self);
        tokio::spawn(async move { fanout.pump(first, cancel).await })
    }

    async fn pump(&self, mut pending: Option<EnvelopeStream>, cancel: CancellationToken) {
        let mut backoff = RESUBSCRIBE_INITIAL_BACKOFF;

        loop {
            let mut subscription = match pending.take() {
                Some(stream) => stream,
                None => match self.bus.subscribe().await {
                    Ok(stream) => {
                        tracing::info!(process = %self.process_id, "bus subscription restored");
                        stream
                    },
                    Err(e) => {
                        tracing::warn!(?backoff, "bus subscription failed: {e}");
                        if !Self::wait(backoff, &cancel).await {
                            return;
                        }
                        backoff = (backoff * 2).min(RESUBSCRIBE_MAX_BACKOFF);
                        continue;
                    },
                },
            };
            backoff = RESUBSCRIBE_INITIAL_BACKOFF;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        tracing::debug!(process = %self.process_id, "fan-out subscriber stopped");
                        return;
                    }
                    next = subscription.next() => match next {
                        Some(envelope) => {
                            self.deliver(&envelope);
                        }
                        None => break,
                    }
                }
            }

            tracing::warn!(?backoff, "bus subscription ended, resubscribing");
            if !Self::wait(backoff, &cancel).await {
                return;
            }
            backoff = (backoff * 2).min(RESUBSCRIBE_MAX_BACKOFF);
        }
    }

    /// Sleep for `delay`. Returns `false` if cancelled first.
    async fn wait(delay: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }
}

impl fmt::Debug for Fanout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fanout")
            .field("process_id", &self.process_id)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
