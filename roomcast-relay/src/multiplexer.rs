use futures::stream::StreamExt;
use redis::aio::PubSub;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::registry::HandlerRegistry;
use crate::relay::RelayCounters;
use crate::shard::shard_channels;

/// Single shared subscription over the full fixed set of shard channels.
///
/// The broker subscription is established exactly once no matter how
/// many local handlers register; every inbound message is decoded and
/// fanned out synchronously to all of them. Handlers receive traffic
/// for every room on every shard and discard what they do not care
/// about.
pub struct ChannelMultiplexer {
    channels: Vec<String>,
    config: RelayConfig,
    connections: Arc<ConnectionManager>,
    registry: Arc<HandlerRegistry>,
    counters: Arc<RelayCounters>,
    started: AtomicBool,
    start_lock: tokio::sync::Mutex<()>,
    cancel: parking_lot::Mutex<CancellationToken>,
}

impl ChannelMultiplexer {
    pub(crate) fn new(
        config: RelayConfig,
        connections: Arc<ConnectionManager>,
        registry: Arc<HandlerRegistry>,
        counters: Arc<RelayCounters>,
    ) -> Self {
        Self {
            channels: shard_channels(&config.region_prefix, config.shard_count),
            config,
            connections,
            registry,
            counters,
            started: AtomicBool::new(false),
            start_lock: tokio::sync::Mutex::new(()),
            cancel: parking_lot::Mutex::new(CancellationToken::new()),
        }
    }

    /// Start the subscriber, idempotently.
    ///
    /// The first caller connects and issues one batched subscribe over
    /// all shard channels, so connection errors surface to the awaiting
    /// `subscribe()` call; later callers return immediately. On failure
    /// the guard stays unset and the next caller retries from scratch.
    pub(crate) async fn start(self: Arc<Self>) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.start_lock.lock().await;
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }

        let pubsub = self.connect_and_subscribe().await?;

        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();
        self.started.store(true, Ordering::Release);

        let mux = Arc::clone(&self);
        tokio::spawn(async move {
            mux.run(pubsub, cancel).await;
        });

        Ok(())
    }

    /// Stop the read loop. The broker subscription dies with it; the
    /// next `start()` rebuilds everything.
    ///
    /// Serialized with `start()` through the same guard lock, so a
    /// shutdown racing a concurrent subscribe cannot leave the started
    /// flag set while the read task is already cancelled.
    pub(crate) async fn shutdown(&self) {
        let _guard = self.start_lock.lock().await;
        self.cancel.lock().cancel();
        self.started.store(false, Ordering::Release);
    }

    async fn connect_and_subscribe(&self) -> Result<PubSub> {
        let mut pubsub = self.connections.new_pubsub().await?;

        match timeout(
            self.config.connect_timeout(),
            pubsub.subscribe(&self.channels),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.connections.set_subscriber_state(ConnectionState::Error);
                return Err(Error::Connection(format!(
                    "subscribing to {} shard channels: {e}",
                    self.channels.len()
                )));
            }
            Err(_) => {
                self.connections.set_subscriber_state(ConnectionState::Error);
                return Err(Error::Timeout(format!(
                    "subscribing to {} shard channels",
                    self.channels.len()
                )));
            }
        }

        self.connections.set_subscriber_state(ConnectionState::Ready);
        info!(
            channels = self.channels.len(),
            prefix = %self.config.region_prefix,
            "subscribed to shard channels"
        );
        Ok(pubsub)
    }

    /// Read loop with reconnection.
    ///
    /// Reconnect delays follow the configured linear capped policy; a
    /// connection that was healthy before dropping restarts the attempt
    /// counter. Once attempts are exhausted the loop exits, the role is
    /// left in `Error`, and the started guard is cleared so the next
    /// explicit `subscribe()` wakes the whole thing up again.
    async fn run(self: Arc<Self>, initial: PubSub, cancel: CancellationToken) {
        let mut next = Some(initial);
        let mut attempt: u32 = 0;

        loop {
            let pubsub = match next.take() {
                Some(pubsub) => pubsub,
                None => match self.connect_and_subscribe().await {
                    Ok(pubsub) => {
                        attempt = 0;
                        pubsub
                    }
                    Err(e) => {
                        attempt += 1;
                        let Some(delay) = self.config.retry_delay(attempt) else {
                            error!(
                                attempts = attempt,
                                "reconnect attempts exhausted, suspending shard subscriber"
                            );
                            self.connections.set_subscriber_state(ConnectionState::Error);
                            let _guard = self.start_lock.lock().await;
                            self.started.store(false, Ordering::Release);
                            return;
                        };
                        warn!(
                            error = %e,
                            attempt = attempt,
                            delay = ?delay,
                            "shard subscriber reconnect failed, backing off"
                        );
                        tokio::select! {
                            () = cancel.cancelled() => {
                                info!("shard subscriber cancelled during backoff");
                                return;
                            }
                            () = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }
                },
            };

            match self.read_messages(pubsub, &cancel).await {
                SubscriberExit::Cancelled => {
                    info!("shard subscriber cancelled");
                    return;
                }
                SubscriberExit::Disconnected => {
                    self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                    warn!("shard subscriber stream ended, reconnecting");
                    // Healthy before the drop, so the attempt counter restarts
                    attempt = 0;
                }
            }
        }
    }

    async fn read_messages(&self, mut pubsub: PubSub, cancel: &CancellationToken) -> SubscriberExit {
        let mut stream = pubsub.on_message();

        loop {
            let msg = tokio::select! {
                () = cancel.cancelled() => return SubscriberExit::Cancelled,
                msg = stream.next() => msg,
            };
            let Some(msg) = msg else {
                return SubscriberExit::Disconnected;
            };

            let channel = msg.get_channel_name().to_string();
            let raw: String = match msg.get_payload() {
                Ok(raw) => raw,
                Err(e) => {
                    self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, channel = %channel, "invalid payload");
                    continue;
                }
            };

            self.dispatch(&channel, &raw);
        }
    }

    /// Decode one raw message and fan it out to a snapshot of the
    /// current handlers. A panicking handler is logged and skipped;
    /// delivery to the remaining handlers continues.
    pub(crate) fn dispatch(&self, channel: &str, raw: &str) {
        let envelope: Envelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, channel = %channel, "failed to decode envelope, skipping");
                return;
            }
        };

        let handlers = self.registry.snapshot();
        debug!(
            channel = %channel,
            room_id = %envelope.room_id,
            handlers = handlers.len(),
            "fanning out envelope"
        );

        for (token, handler) in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&envelope))).is_err() {
                self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                error!(
                    token = %token,
                    channel = %channel,
                    "handler panicked during dispatch, continuing with remaining handlers"
                );
            } else {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Describes how the read loop exited, enabling proper backoff behavior.
enum SubscriberExit {
    /// `shutdown()` was called; do not reconnect.
    Cancelled,
    /// The message stream ended (broker disconnected) after a healthy
    /// connection. The backoff restarts from the first step.
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    fn test_multiplexer() -> (ChannelMultiplexer, Arc<HandlerRegistry>, Arc<RelayCounters>) {
        let config = RelayConfig {
            region_prefix: "test".to_string(),
            ..Default::default()
        };
        let connections =
            Arc::new(ConnectionManager::new(config.clone()).expect("valid config"));
        let registry = Arc::new(HandlerRegistry::new());
        let counters = Arc::new(RelayCounters::default());
        let mux = ChannelMultiplexer::new(
            config,
            connections,
            Arc::clone(&registry),
            Arc::clone(&counters),
        );
        (mux, registry, counters)
    }

    fn raw_envelope(room_id: &str) -> String {
        serde_json::to_string(&Envelope::new(room_id, json!({"kind": "ping"})))
            .expect("envelope serializes")
    }

    #[test]
    fn test_channel_set_is_fixed_and_complete() {
        let (mux, _, _) = test_multiplexer();
        assert_eq!(mux.channels.len(), 8);
        assert_eq!(mux.channels[0], "test:signal:shard:0");
        assert_eq!(mux.channels[7], "test:signal:shard:7");
    }

    #[test]
    fn test_dispatch_fans_out_to_all_handlers() {
        let (mux, registry, _) = test_multiplexer();
        let seen = Arc::new(StdMutex::new(Vec::new()));

        for id in 0..3 {
            let seen = Arc::clone(&seen);
            registry.register(Arc::new(move |envelope: &Envelope| {
                seen.lock().expect("lock").push((id, envelope.room_id.clone()));
            }));
        }

        mux.dispatch("test:signal:shard:2", &raw_envelope("room-42"));

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|(_, room)| room == "room-42"));
    }

    #[test]
    fn test_panicking_handler_does_not_stop_dispatch() {
        let (mux, registry, counters) = test_multiplexer();
        let delivered = Arc::new(AtomicUsize::new(0));

        registry.register(Arc::new(|_: &Envelope| {
            panic!("handler failure");
        }));
        let delivered_in_handler = Arc::clone(&delivered);
        registry.register(Arc::new(move |_: &Envelope| {
            delivered_in_handler.fetch_add(1, Ordering::SeqCst);
        }));

        mux.dispatch("test:signal:shard:0", &raw_envelope("room-1"));

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(counters.handler_errors.load(Ordering::Relaxed), 1);
        assert_eq!(counters.delivered.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_malformed_message_is_skipped() {
        let (mux, registry, counters) = test_multiplexer();
        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered_in_handler = Arc::clone(&delivered);
        registry.register(Arc::new(move |_: &Envelope| {
            delivered_in_handler.fetch_add(1, Ordering::SeqCst);
        }));

        mux.dispatch("test:signal:shard:0", "not json at all");
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        assert_eq!(counters.decode_errors.load(Ordering::Relaxed), 1);

        // The loop keeps serving well-formed messages afterward
        mux.dispatch("test:signal:shard:0", &raw_envelope("room-1"));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_clears_started_guard() {
        let (mux, _, _) = test_multiplexer();
        mux.started.store(true, Ordering::Release);
        mux.shutdown().await;
        assert!(!mux.started.load(Ordering::Acquire));
        assert!(mux.cancel.lock().is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_start() {
        let (mux, _, _) = test_multiplexer();
        let mux = Arc::new(mux);

        // Simulate a subscribe mid-setup: the start guard is held and
        // the started flag already set
        let guard = mux.start_lock.lock().await;
        mux.started.store(true, Ordering::Release);

        let mux_in_task = Arc::clone(&mux);
        let shutdown = tokio::spawn(async move {
            mux_in_task.shutdown().await;
        });

        // Shutdown must not interleave with the in-flight start
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!shutdown.is_finished());
        assert!(mux.started.load(Ordering::Acquire));
        assert!(!mux.cancel.lock().is_cancelled());

        drop(guard);
        shutdown.await.expect("shutdown task");
        assert!(!mux.started.load(Ordering::Acquire));
        assert!(mux.cancel.lock().is_cancelled());
    }
}
