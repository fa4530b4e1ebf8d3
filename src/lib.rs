//! Message-oriented middleware unifying publish/subscribe, work queues, and
//! request/response RPC behind a single API over pluggable transports.
//!
//! Three providers ship with the crate: an in-memory transport for tests
//! and single-process embedding, a Redis transport for cross-host
//! deployments (with glob pattern subscriptions), and a POSIX
//! message-queue transport for single-host process groups (Linux only).
//! The semantics are identical across providers except where a capability
//! is genuinely absent — those operations fail with
//! [`BusError::Unsupported`] instead of degrading silently.
//!
//! # Example
//!
//! ```ignore
//! use omnibus::{Bus, Event, ProviderConfig};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Ping { seq: u64 }
//!
//! impl Event for Ping {
//!     fn channel() -> &'static str { "example.Ping" }
//! }
//!
//! #[tokio::main]
//! async fn main() -> omnibus::Result<()> {
//!     let bus = Bus::connect(&ProviderConfig::memory()).await?;
//!
//!     bus.on(|ping: Ping| async move {
//!         println!("got ping #{}", ping.seq);
//!         Ok(())
//!     })
//!     .await?;
//!
//!     bus.publish(&Ping { seq: 7 }).await?;
//!
//!     // RPC: expose a callable, invoke it through a stub.
//!     bus.expose("math.product", |(a, b): (i64, i64)| async move {
//!         Ok::<_, std::convert::Infallible>(a * b)
//!     })
//!     .await?;
//!     let product: i64 = bus.rpc("math.product", (2, 4)).await?;
//!     assert_eq!(product, 8);
//!
//!     bus.close().await
//! }
//! ```

pub mod bus;
pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod global;
pub mod queue;
pub mod rpc;
pub mod transport;

pub use bus::{Bus, Subscription};
pub use config::{IpcConfig, ProviderConfig, RedisConfig, TransportKind};
pub use error::{BusError, Result};
pub use event::{handler_fn, Event, EventHandler, Topic};
pub use global::{init, shutdown};
pub use queue::Queue;
pub use rpc::{RpcRequest, RpcResponse, Stub};
pub use transport::{Capabilities, Transport};
