//! Events, handlers, and typed topic handles.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::bus::{Bus, Subscription};
use crate::error::{BusError, Result};

/// A record that can travel over the bus under its own channel.
///
/// The canonical name doubles as the pub/sub channel, so it must be stable
/// across every process that exchanges this event. The convention is the
/// type's qualified path, e.g. `"billing.InvoicePaid"`.
pub trait Event: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Canonical name of this event type.
    fn channel() -> &'static str;
}

/// Handler for events delivered by the bus.
///
/// Implemented for any async closure `Fn(E) -> Future<Output = Result<()>>`;
/// a returned error is logged and never aborts delivery to other handlers.
pub trait EventHandler<E>: Send + Sync {
    /// Process one event.
    fn handle(&self, event: E) -> BoxFuture<'static, Result<()>>;
}

impl<E, F, Fut> EventHandler<E> for F
where
    F: Fn(E) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, event: E) -> BoxFuture<'static, Result<()>> {
        Box::pin((self)(event))
    }
}

/// Wrap an async closure as a shareable handler.
///
/// Subscribing the *same* returned handle twice to one channel is a no-op;
/// wrapping the closure again yields a distinct identity.
pub fn handler_fn<E, F, Fut>(f: F) -> Arc<dyn EventHandler<E>>
where
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(f)
}

/// A typed handle onto an explicit channel.
///
/// Topics decouple the channel name from the event type: several topics can
/// carry the same record type, and pattern topics subscribe to a whole
/// family of channels at once (on transports that support patterns).
pub struct Topic<E> {
    bus: Bus,
    name: String,
    pattern: bool,
    _marker: PhantomData<fn() -> E>,
}

impl<E> Topic<E>
where
    E: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(bus: Bus, name: impl Into<String>, pattern: bool) -> Self {
        Self {
            bus,
            name: name.into(),
            pattern,
            _marker: PhantomData,
        }
    }

    /// The channel (or pattern) this topic is bound to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle names a pattern rather than a single channel.
    pub fn is_pattern(&self) -> bool {
        self.pattern
    }

    /// Publish an event on this topic's channel.
    pub async fn publish(&self, event: &E) -> Result<()> {
        if self.pattern {
            return Err(BusError::Transport(
                "cannot publish to a pattern topic".to_string(),
            ));
        }
        self.bus.publish_to(&self.name, event).await
    }

    /// Subscribe a handler to this topic.
    pub async fn subscribe(&self, handler: Arc<dyn EventHandler<E>>) -> Result<Subscription> {
        if self.pattern {
            self.bus.subscribe_pattern(&self.name, handler).await
        } else {
            self.bus.subscribe_to(&self.name, handler).await
        }
    }

    /// Subscribe an async closure to this topic.
    pub async fn on<F, Fut>(&self, f: F) -> Result<Subscription>
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe(handler_fn(f)).await
    }
}
