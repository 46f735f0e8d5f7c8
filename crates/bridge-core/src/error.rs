//! Error taxonomy (§7). Kinds, not type hierarchies: the Dispatcher never looks past this enum.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Malformed or unknown configuration; fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Store I/O failure. Caller retries with backoff, then exits with code 2.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    /// Schema or row-level corruption; offending row is quarantined, processing continues.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// MQTT or OPC-UA I/O failure. Always retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// Payload does not match its declared data_type. Always permanent.
    #[error("type coercion error: {0}")]
    TypeCoercion(String),

    /// Soft-cap breach on a non-critical enqueue.
    #[error("buffer full")]
    BufferFull,

    /// Shutdown in progress.
    #[error("cancelled")]
    Cancelled,
}

impl BridgeError {
    /// Only `Configuration` and exhausted `StoreUnavailable` are fatal (§7 Propagation).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

/// Outcome of invoking an egress adapter (§4.6).
#[derive(Debug)]
pub enum DeliveryOutcome {
    Ok,
    Retryable(String),
    Permanent(String),
}
