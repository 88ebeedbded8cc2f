use parking_lot::Mutex;
use redis::aio::{ConnectionManager as RedisConnectionManager, ConnectionManagerConfig, PubSub};
use redis::Client as RedisClient;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{Error, Result};

/// Lifecycle of one logical broker connection role.
///
/// `Closed` is reached only through `disconnect()` and is terminal
/// until the next explicit operation lazily reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Ready,
    Error,
    Closed,
}

/// Owner of the two logical broker connections.
///
/// The publish side and the subscribe side are each established lazily
/// on first need and shared by every caller in the process afterward.
/// No other component may open competing connections against the same
/// broker from within the process; that would duplicate subscriptions
/// and double-deliver messages.
pub struct ConnectionManager {
    client: RedisClient,
    config: RelayConfig,
    publisher: tokio::sync::Mutex<Option<RedisConnectionManager>>,
    publisher_state: Mutex<ConnectionState>,
    subscriber_state: Mutex<ConnectionState>,
}

impl ConnectionManager {
    /// Create the manager. Validates the broker URL but opens nothing.
    pub fn new(config: RelayConfig) -> Result<Self> {
        let client = RedisClient::open(config.broker_url.as_str())
            .map_err(|e| Error::Configuration(format!("invalid broker url: {e}")))?;

        Ok(Self {
            client,
            config,
            publisher: tokio::sync::Mutex::new(None),
            publisher_state: Mutex::new(ConnectionState::Uninitialized),
            subscriber_state: Mutex::new(ConnectionState::Uninitialized),
        })
    }

    /// Get the live publish connection, establishing it on first use.
    ///
    /// The returned handle is a cheap clone of the process-wide
    /// multiplexed connection. Its own retry loop (configured from the
    /// relay config) recovers transient broker failures transparently;
    /// errors that outlive it surface to whoever is awaiting `publish`.
    pub async fn ensure_publisher(&self) -> Result<RedisConnectionManager> {
        let mut slot = self.publisher.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        self.set_publisher_state(ConnectionState::Connecting);
        debug!(broker_url = %self.config.broker_url, "establishing publish connection");

        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(self.config.connect_timeout())
            .set_number_of_retries(self.config.max_retries_per_request)
            .set_factor(self.config.retry_delay_step_ms)
            .set_max_delay(self.config.retry_delay_cap_ms);

        let conn = match timeout(
            self.config.connect_timeout(),
            self.client
                .get_connection_manager_with_config(manager_config),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                self.set_publisher_state(ConnectionState::Error);
                warn!(error = %e, "failed to establish publish connection");
                return Err(Error::Connection(e.to_string()));
            }
            Err(_) => {
                self.set_publisher_state(ConnectionState::Error);
                return Err(Error::Timeout(
                    "establishing publish connection".to_string(),
                ));
            }
        };

        info!("publish connection established");
        self.set_publisher_state(ConnectionState::Ready);
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Open the subscribe-side pub/sub connection.
    ///
    /// Called only by the multiplexer; the rest of the process shares
    /// that single subscription.
    pub async fn new_pubsub(&self) -> Result<PubSub> {
        self.set_subscriber_state(ConnectionState::Connecting);
        debug!(broker_url = %self.config.broker_url, "establishing subscribe connection");

        match timeout(self.config.connect_timeout(), self.client.get_async_pubsub()).await {
            Ok(Ok(pubsub)) => Ok(pubsub),
            Ok(Err(e)) => {
                self.set_subscriber_state(ConnectionState::Error);
                Err(Error::Connection(e.to_string()))
            }
            Err(_) => {
                self.set_subscriber_state(ConnectionState::Error);
                Err(Error::Timeout(
                    "establishing subscribe connection".to_string(),
                ))
            }
        }
    }

    /// Tear down both connections. The next `ensure_publisher` or
    /// `new_pubsub` call starts from scratch.
    pub async fn disconnect(&self) {
        self.publisher.lock().await.take();
        self.set_publisher_state(ConnectionState::Closed);
        self.set_subscriber_state(ConnectionState::Closed);
        info!("broker connections closed");
    }

    #[must_use]
    pub fn publisher_state(&self) -> ConnectionState {
        *self.publisher_state.lock()
    }

    #[must_use]
    pub fn subscriber_state(&self) -> ConnectionState {
        *self.subscriber_state.lock()
    }

    pub(crate) fn set_publisher_state(&self, state: ConnectionState) {
        *self.publisher_state.lock() = state;
    }

    pub(crate) fn set_subscriber_state(&self, state: ConnectionState) {
        *self.subscriber_state.lock() = state;
    }
}
