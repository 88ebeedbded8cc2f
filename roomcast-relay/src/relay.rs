use redis::AsyncCommands;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::multiplexer::ChannelMultiplexer;
use crate::registry::{HandlerRegistry, SubscriptionToken};
use crate::shard::{shard_channel, shard_index};

/// Timeout for broker commands in seconds
const COMMAND_TIMEOUT_SECS: u64 = 5;

/// Sharded signaling relay over a shared broker.
///
/// Distributes room-scoped events (call signaling, presence, chat
/// fanout) across independent processes: a publisher on one process
/// reaches subscribers on another through deterministically routed
/// shard channels, with no coordination protocol beyond agreeing on
/// the shard count and region prefix.
///
/// The relay owns both broker connections for the process. Connections
/// come up lazily on first use and go down only through
/// [`disconnect`](Self::disconnect); handlers are registered and
/// removed independently of connection state and survive reconnection.
pub struct SignalRelay {
    config: RelayConfig,
    connections: Arc<ConnectionManager>,
    registry: Arc<HandlerRegistry>,
    multiplexer: Arc<ChannelMultiplexer>,
    counters: Arc<RelayCounters>,
}

impl SignalRelay {
    /// Create a relay. Validates configuration; performs no I/O.
    pub fn new(config: RelayConfig) -> Result<Self> {
        config.validate()?;

        let connections = Arc::new(ConnectionManager::new(config.clone())?);
        let registry = Arc::new(HandlerRegistry::new());
        let counters = Arc::new(RelayCounters::default());
        let multiplexer = Arc::new(ChannelMultiplexer::new(
            config.clone(),
            Arc::clone(&connections),
            Arc::clone(&registry),
            Arc::clone(&counters),
        ));

        Ok(Self {
            config,
            connections,
            registry,
            multiplexer,
            counters,
        })
    }

    /// Publish a payload to a room's shard channel.
    ///
    /// Suspends until the publish connection is live and the broker
    /// acknowledges the write. Failures surface to the caller and are
    /// never retried here: signaling is ephemeral and latency
    /// sensitive, so resending a stale message is usually wrong.
    /// Same-process publishes to the same shard reach the broker in
    /// call order over the single shared connection.
    pub async fn publish(&self, room_id: &str, payload: serde_json::Value) -> Result<()> {
        let envelope = Envelope::new(room_id, payload);
        let channel = shard_channel(
            &self.config.region_prefix,
            shard_index(room_id, self.config.shard_count),
        );
        let text =
            serde_json::to_string(&envelope).map_err(|e| Error::Serialization(e.to_string()))?;

        let mut conn = self.connections.ensure_publisher().await?;
        let receivers: usize = timeout(
            Duration::from_secs(COMMAND_TIMEOUT_SECS),
            conn.publish(&channel, &text),
        )
        .await
        .map_err(|_| Error::Timeout(format!("publishing to {channel}")))?
        .map_err(|e| Error::Publish(e.to_string()))?;

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        debug!(
            room_id = %room_id,
            channel = %channel,
            receivers = receivers,
            "envelope published"
        );
        Ok(())
    }

    /// Register a handler for every message on the shard channels.
    ///
    /// Suspends until the shared subscribe connection is live and bound
    /// to all shard channels (established once, reused by every later
    /// handler). This is a live feed: messages published before
    /// registration are not replayed. The handler sees traffic for all
    /// rooms and is responsible for discarding rooms it does not care
    /// about.
    pub async fn subscribe<F>(&self, handler: F) -> Result<SubscriptionToken>
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        Arc::clone(&self.multiplexer).start().await?;
        let token = self.registry.register(Arc::new(handler));
        info!(
            token = %token,
            active_handlers = self.registry.len(),
            "handler subscribed"
        );
        Ok(token)
    }

    /// Remove a handler. The broker subscriptions stay up so remaining
    /// handlers keep receiving messages. Returns whether the token was
    /// registered.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let removed = self.registry.remove(token);
        if removed {
            info!(
                token = %token,
                active_handlers = self.registry.len(),
                "handler unsubscribed"
            );
        } else {
            warn!(token = %token, "attempted to unsubscribe unknown token");
        }
        removed
    }

    /// Tear down both broker connections and clear the handler
    /// registry. The relay stays usable: the next `publish` or
    /// `subscribe` transparently re-establishes connections.
    pub async fn disconnect(&self) {
        info!("disconnecting signal relay");
        self.multiplexer.shutdown().await;
        self.connections.disconnect().await;
        self.registry.clear();
    }

    /// Shard index a room routes to. Pure; exposed for diagnostics and
    /// tests by collaborators.
    #[must_use]
    pub fn shard(&self, room_id: &str) -> u32 {
        shard_index(room_id, self.config.shard_count)
    }

    #[must_use]
    pub fn publisher_state(&self) -> ConnectionState {
        self.connections.publisher_state()
    }

    #[must_use]
    pub fn subscriber_state(&self) -> ConnectionState {
        self.connections.subscriber_state()
    }

    /// Snapshot of the relay counters.
    #[must_use]
    pub fn metrics(&self) -> RelayMetrics {
        RelayMetrics {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            handler_errors: self.counters.handler_errors.load(Ordering::Relaxed),
            decode_errors: self.counters.decode_errors.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
            active_handlers: self.registry.len(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RelayConfig {
        &self.config
    }
}

/// Shared atomic counters behind [`RelayMetrics`].
#[derive(Default)]
pub(crate) struct RelayCounters {
    pub(crate) published: AtomicU64,
    pub(crate) delivered: AtomicU64,
    pub(crate) handler_errors: AtomicU64,
    pub(crate) decode_errors: AtomicU64,
    pub(crate) reconnects: AtomicU64,
}

/// Relay metrics
#[derive(Debug, Clone)]
pub struct RelayMetrics {
    /// Envelopes accepted by the broker.
    pub published: u64,
    /// Handler invocations that completed.
    pub delivered: u64,
    /// Handler invocations that panicked.
    pub handler_errors: u64,
    /// Inbound messages that failed to decode.
    pub decode_errors: u64,
    /// Times the subscribe connection was re-established.
    pub reconnects: u64,
    /// Currently registered handlers.
    pub active_handlers: usize,
}
