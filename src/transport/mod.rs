//! Transport drivers and the capability surface the bus consumes.
//!
//! A transport knows how to move opaque payloads: publish/subscribe on
//! channels, named FIFO queues, and an asynchronous delivery feed into the
//! dispatcher. Everything typed (codec, handler registry, RPC correlation)
//! lives above this trait, so providers stay interchangeable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{ProviderConfig, TransportKind};
use crate::error::Result;

pub mod memory;

#[cfg(target_os = "linux")]
pub mod ipc;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryTransport;

#[cfg(target_os = "linux")]
pub use ipc::IpcTransport;
#[cfg(feature = "redis")]
pub use self::redis::RedisTransport;

/// A message handed from a transport to the dispatcher.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel the message was published on.
    pub channel: String,
    /// Pattern that matched, when delivered through a pattern subscription.
    /// Exact and pattern subscriptions produce independent deliveries.
    pub pattern: Option<String>,
    /// Encoded payload.
    pub payload: Vec<u8>,
}

/// Sending half of the dispatcher's delivery loop.
pub type DeliverySink = mpsc::UnboundedSender<Delivery>;

/// What the active transport can and cannot do.
///
/// Self-reported so the bus can refuse unsupported operations up front
/// instead of degrading silently.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    /// Glob pattern subscriptions.
    pub patterns: bool,
    /// Visibility beyond the current process.
    pub cross_process: bool,
    /// Exact queue length reporting.
    pub queue_len: bool,
}

/// The capability set the bus requires of a provider.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short provider name for logs and error messages.
    fn name(&self) -> &'static str;

    /// Self-reported capability set.
    fn capabilities(&self) -> Capabilities;

    /// Begin asynchronous delivery into the given sink.
    async fn start(&self, sink: DeliverySink) -> Result<()>;

    /// End the delivery loop and release transport-side subscription state.
    /// In-flight deliveries may still reach the sink.
    async fn stop(&self) -> Result<()>;

    /// Fire-and-forget delivery to current subscribers of `channel`.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()>;

    /// Begin delivery for this channel (or pattern). Idempotent per channel.
    async fn subscribe(&self, channel: &str, pattern: bool) -> Result<()>;

    /// Stop future deliveries for this channel (or pattern).
    async fn unsubscribe(&self, channel: &str, pattern: bool) -> Result<()>;

    /// Handle on the named FIFO queue, created lazily by the provider.
    fn queue(&self, name: &str) -> Result<Arc<dyn TransportQueue>>;
}

/// FIFO queue primitives of one named queue.
#[async_trait]
pub trait TransportQueue: Send + Sync {
    /// The queue's name as the caller gave it.
    fn name(&self) -> &str;

    /// Append an item, waiting for capacity on bounded queues.
    /// `Some(timeout)` bounds the wait and fails with `QueueFull`.
    async fn put(&self, payload: Vec<u8>, timeout: Option<Duration>) -> Result<()>;

    /// Append an item without waiting; fails with `QueueFull`.
    async fn try_put(&self, payload: Vec<u8>) -> Result<()>;

    /// Pop the oldest item, waiting for one to arrive.
    /// `Some(timeout)` bounds the wait and fails with `QueueEmpty`.
    async fn get(&self, timeout: Option<Duration>) -> Result<Vec<u8>>;

    /// Pop the oldest item without waiting; fails with `QueueEmpty`.
    async fn try_get(&self) -> Result<Vec<u8>>;

    /// Current queue length; `Unsupported` where the provider cannot answer.
    async fn len(&self) -> Result<usize>;
}

/// Build the transport selected by the provider configuration.
pub async fn connect(config: &ProviderConfig) -> Result<Arc<dyn Transport>> {
    match config.transport {
        TransportKind::Memory => Ok(Arc::new(MemoryTransport::new())),
        TransportKind::Redis => {
            #[cfg(feature = "redis")]
            {
                let transport = RedisTransport::connect(&config.redis).await?;
                Ok(Arc::new(transport))
            }
            #[cfg(not(feature = "redis"))]
            {
                Err(crate::error::BusError::Connection(
                    "redis support requires the 'redis' feature".to_string(),
                ))
            }
        }
        TransportKind::Ipc => {
            #[cfg(target_os = "linux")]
            {
                let transport = IpcTransport::new(&config.ipc);
                Ok(Arc::new(transport))
            }
            #[cfg(not(target_os = "linux"))]
            {
                Err(crate::error::BusError::Connection(
                    "the ipc transport is only available on Linux".to_string(),
                ))
            }
        }
    }
}
