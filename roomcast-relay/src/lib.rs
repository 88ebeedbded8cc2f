//! Sharded real-time signaling relay.
//!
//! Rooms are deterministically hashed onto a fixed set of shard
//! channels on a shared Redis broker; every process subscribes to the
//! full set once and fans inbound envelopes out to its local handlers.

pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod multiplexer;
pub mod registry;
pub mod relay;
pub mod shard;

pub use config::RelayConfig;
pub use connection::{ConnectionManager, ConnectionState};
pub use envelope::Envelope;
pub use error::{Error, Result};
pub use multiplexer::ChannelMultiplexer;
pub use registry::{Handler, HandlerRegistry, SubscriptionToken};
pub use relay::{RelayMetrics, SignalRelay};
pub use shard::{shard_channel, shard_channels, shard_index};
