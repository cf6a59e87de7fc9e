//! DHT error types

use thiserror::Error;

/// DHT errors
#[derive(Debug, Error)]
pub enum DhtError {
    /// A value failed to parse from its wire form
    #[error("Malformed value: {0}")]
    MalformedValue(String),

    /// Invalid protocol message
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Bucket cannot be split any further
    #[error("Routing table exhausted: bucket depth {0} out of range")]
    TableExhausted(usize),

    /// Neither the IPv4 nor the IPv6 socket could be bound
    #[error("Bind failed: {0}")]
    BindFailed(String),

    /// Operation requires a running node
    #[error("DHT is not running")]
    NotRunning,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Crypto error
    #[error("Crypto error: {0}")]
    CryptoError(#[from] ringdht_crypto::CryptoError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for DHT operations
pub type DhtResult<T> = Result<T, DhtError>;
