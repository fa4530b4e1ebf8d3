//! Error types shared by the bus, transports, queues, and the RPC layer.

use thiserror::Error;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// Value could not be serialized for the wire.
    #[error("failed to encode value: {0}")]
    Encode(String),

    /// Payload could not be reconstructed as the declared type.
    #[error("failed to decode payload as {target}: {detail}")]
    Decode {
        /// The declared target type.
        target: &'static str,
        /// Where and why decoding failed.
        detail: String,
    },

    /// Operation unavailable on the active transport.
    #[error("{operation} is not supported by the {transport} transport")]
    Unsupported {
        operation: &'static str,
        transport: &'static str,
    },

    /// Non-blocking or timed get found no item before the deadline.
    #[error("queue is empty")]
    QueueEmpty,

    /// Non-blocking or timed put found no capacity before the deadline.
    #[error("queue is full")]
    QueueFull,

    /// No response arrived within the deadline.
    #[error("remote call timed out")]
    RpcTimeout,

    /// The responder invoked the target and it failed.
    #[error("remote invocation failed: {0}")]
    Remote(String),

    /// No responder exists for the address.
    #[error("no responder for address {0}")]
    NoSuchRemote(String),

    /// A pending wait was released by bus teardown.
    #[error("bus is shutting down")]
    Shutdown,

    /// `init` was called while a process-default bus is active.
    #[error("a bus is already initialized")]
    AlreadyInitialized,

    /// A process-default facade call was made before `init`.
    #[error("bus is not initialized")]
    NotInitialized,

    /// The transport could not be reached or set up.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Transport-level failure during publish/subscribe/queue traffic.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for BusError {
    fn from(err: redis::RedisError) -> Self {
        BusError::Transport(err.to_string())
    }
}
