//! The bus facade: the single entry point applications talk to.
//!
//! A `Bus` is a cheap clone handle over the active transport, the
//! dispatcher, and the RPC book-keeping. All operations ultimately take a
//! `Bus`; the [`crate::global`] module layers a process-default instance on
//! top for callers that do not want to thread the handle.

mod dispatcher;

pub use dispatcher::Subscription;
pub(crate) use dispatcher::Dispatcher;

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::codec;
use crate::config::ProviderConfig;
use crate::error::{BusError, Result};
use crate::event::{handler_fn, Event, EventHandler, Topic};
use crate::queue::Queue;
use crate::rpc::{self, RpcState, Stub};
use crate::transport::{self, Capabilities, Transport};

/// Handle onto a running bus.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

struct BusInner {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    rpc: RpcState,
    identity: String,
    closing_tx: watch::Sender<bool>,
    closing_rx: watch::Receiver<bool>,
    delivery_task: Mutex<Option<JoinHandle<()>>>,
}

impl Bus {
    /// Build the configured transport and start a bus on it.
    pub async fn connect(config: &ProviderConfig) -> Result<Bus> {
        let transport = transport::connect(config).await?;
        Self::with_transport(transport).await
    }

    /// Start a bus on an already-constructed transport.
    pub async fn with_transport(transport: Arc<dyn Transport>) -> Result<Bus> {
        let (sink, deliveries) = mpsc::unbounded_channel();
        let (closing_tx, closing_rx) = watch::channel(false);
        let dispatcher = Arc::new(Dispatcher::new());

        transport.start(sink).await?;
        let delivery_task = dispatcher.clone().spawn(deliveries, closing_rx.clone());

        let identity = responder_identity();
        info!(
            transport = transport.name(),
            identity = %identity,
            "bus started"
        );

        Ok(Bus {
            inner: Arc::new(BusInner {
                transport,
                dispatcher,
                rpc: RpcState::new(),
                identity,
                closing_tx,
                closing_rx,
                delivery_task: Mutex::new(Some(delivery_task)),
            }),
        })
    }

    /// What the active transport can do.
    pub fn capabilities(&self) -> Capabilities {
        self.inner.transport.capabilities()
    }

    /// Opaque identity this bus answers RPC invocations with.
    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        *self.inner.closing_rx.borrow()
    }

    pub(crate) fn closing(&self) -> watch::Receiver<bool> {
        self.inner.closing_rx.clone()
    }

    pub(crate) fn rpc_state(&self) -> &RpcState {
        &self.inner.rpc
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(BusError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Publish an event on the channel derived from its type.
    pub async fn publish<E: Event>(&self, event: &E) -> Result<()> {
        self.publish_to(E::channel(), event).await
    }

    /// Publish a value on an explicit channel.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(channel = %channel))]
    pub async fn publish_to<T: Serialize + ?Sized>(&self, channel: &str, value: &T) -> Result<()> {
        self.ensure_open()?;
        let payload = codec::encode(value)?;
        debug!(bytes = payload.len(), "publishing");
        self.inner.transport.publish(channel, payload).await
    }

    /// Subscribe a handler on the channel derived from its event type.
    pub async fn subscribe<E: Event>(
        &self,
        handler: Arc<dyn EventHandler<E>>,
    ) -> Result<Subscription> {
        self.subscribe_inner(E::channel(), false, handler).await
    }

    /// Subscribe a handler on an explicit channel.
    pub async fn subscribe_to<E>(
        &self,
        channel: &str,
        handler: Arc<dyn EventHandler<E>>,
    ) -> Result<Subscription>
    where
        E: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.subscribe_inner(channel, false, handler).await
    }

    /// Subscribe a handler on a glob pattern.
    ///
    /// Fails with `Unsupported` at subscribe time when the transport has no
    /// pattern primitive. A handler subscribed both exactly and by pattern
    /// is invoked once per matching subscription.
    pub async fn subscribe_pattern<E>(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler<E>>,
    ) -> Result<Subscription>
    where
        E: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        if !self.capabilities().patterns {
            return Err(BusError::Unsupported {
                operation: "pattern subscription",
                transport: self.inner.transport.name(),
            });
        }
        self.subscribe_inner(pattern, true, handler).await
    }

    async fn subscribe_inner<E>(
        &self,
        channel: &str,
        pattern: bool,
        handler: Arc<dyn EventHandler<E>>,
    ) -> Result<Subscription>
    where
        E: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.ensure_open()?;
        let registered = self
            .inner
            .dispatcher
            .register(channel, pattern, handler)
            .await;

        if registered.first_for_channel {
            if let Err(e) = self.inner.transport.subscribe(channel, pattern).await {
                self.inner.dispatcher.remove(&registered.subscription).await;
                return Err(e);
            }
        }
        if registered.added {
            debug!(channel, pattern, id = registered.subscription.id, "handler subscribed");
        }
        Ok(registered.subscription)
    }

    /// Subscribe an async closure on the channel derived from its event type.
    pub async fn on<E, F, Fut>(&self, f: F) -> Result<Subscription>
    where
        E: Event,
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe(handler_fn(f)).await
    }

    /// Subscribe an async closure on an explicit channel.
    pub async fn on_to<E, F, Fut>(&self, channel: &str, f: F) -> Result<Subscription>
    where
        E: DeserializeOwned + Clone + Send + Sync + 'static,
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe_to(channel, handler_fn(f)).await
    }

    /// Subscribe an async closure on a glob pattern.
    pub async fn on_pattern<E, F, Fut>(&self, pattern: &str, f: F) -> Result<Subscription>
    where
        E: DeserializeOwned + Clone + Send + Sync + 'static,
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe_pattern(pattern, handler_fn(f)).await
    }

    /// Remove a subscription. In-flight deliveries may still arrive; nothing
    /// published after this returns will be dispatched to the handler.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        match self.inner.dispatcher.remove(subscription).await {
            Some(last) => {
                if last {
                    self.inner
                        .transport
                        .unsubscribe(&subscription.channel, subscription.pattern)
                        .await?;
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Handle on the named FIFO queue, created lazily by the transport.
    pub fn queue(&self, name: &str) -> Result<Queue> {
        self.ensure_open()?;
        Ok(Queue::new(name, self.inner.transport.queue(name)?))
    }

    /// Typed handle onto an explicit channel.
    pub fn topic<E>(&self, name: &str) -> Topic<E>
    where
        E: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        Topic::new(self.clone(), name, false)
    }

    /// Typed handle onto a glob pattern (subscribe only).
    pub fn topic_pattern<E>(&self, pattern: &str) -> Topic<E>
    where
        E: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        Topic::new(self.clone(), pattern, true)
    }

    /// Register a callable under an address. Re-exposing an address replaces
    /// the previous callable.
    pub async fn expose<A, R, E, F, Fut>(&self, address: &str, f: F) -> Result<()>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: std::fmt::Display,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        self.ensure_open()?;
        rpc::expose(self, address, f).await
    }

    /// Remove the callable registered under an address, if any.
    pub async fn unexpose(&self, address: &str) -> Result<()> {
        rpc::unexpose(self, address).await
    }

    /// Stub for invoking the callable registered under an address.
    pub fn stub(&self, address: &str) -> Stub {
        Stub::new(self.clone(), address)
    }

    /// Single-mode invocation with no deadline: waits until one response
    /// arrives or the bus shuts down.
    pub async fn rpc<A, R>(&self, address: &str, args: A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.stub(address).call(args).await
    }

    /// Shut the bus down: release pending RPC waiters, drop every
    /// subscription and exposure, stop the transport. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closing_tx.send_replace(true) {
            return Ok(());
        }
        info!("closing bus");

        rpc::shutdown(self).await;
        self.inner.dispatcher.clear().await;
        self.inner.transport.stop().await?;

        if let Some(task) = self.inner.delivery_task.lock().await.take() {
            task.abort();
        }

        info!("bus closed");
        Ok(())
    }
}

/// Identity a bus answers invocations with: host, process, and an instance
/// tag so several buses in one process stay distinguishable.
fn responder_identity() -> String {
    let instance = Uuid::new_v4().simple().to_string();
    format!(
        "{}:{}:{}",
        hostname(),
        std::process::id(),
        &instance[..8]
    )
}

#[cfg(target_os = "linux")]
fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(not(target_os = "linux"))]
fn hostname() -> String {
    "localhost".to_string()
}
