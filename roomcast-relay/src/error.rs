//! Error types for the relay

use thiserror::Error;

/// Relay error types
///
/// Nothing here is fatal to the host process: connection failures leave
/// the lazy connections ready to retry on the next operation, publish
/// failures are surfaced to the caller without internal retries, and
/// handler failures are logged at the dispatch site rather than typed.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, Error>;
