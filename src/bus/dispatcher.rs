//! Subscription registry and delivery dispatch.
//!
//! The registry maps channels to ordered handler lists; pattern
//! subscriptions live in a separate map because exact and pattern matches
//! produce independent deliveries. The lock is never held across handler
//! invocation: each delivery snapshots the registration list first.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::codec;
use crate::error::{BusError, Result};
use crate::event::EventHandler;
use crate::transport::Delivery;

/// Token returned by subscribe, accepted by unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub(crate) id: u64,
    pub(crate) channel: String,
    pub(crate) pattern: bool,
}

impl Subscription {
    /// The channel (or pattern) this subscription is bound to.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Whether this subscription was made with a pattern.
    pub fn is_pattern(&self) -> bool {
        self.pattern
    }
}

/// A decoded event, shared across every handler declaring the same type so
/// each declared type is decoded at most once per delivery.
type DecodedEvent = Arc<dyn Any + Send + Sync>;

/// Type-erased registration: decodes its declared type, invokes its handler.
trait RawHandler: Send + Sync {
    fn event_type(&self) -> TypeId;
    fn decode(&self, payload: &[u8]) -> Result<DecodedEvent>;
    fn invoke(&self, event: DecodedEvent) -> BoxFuture<'static, Result<()>>;
}

struct TypedHandler<E> {
    handler: Arc<dyn EventHandler<E>>,
}

impl<E> RawHandler for TypedHandler<E>
where
    E: DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn event_type(&self) -> TypeId {
        TypeId::of::<E>()
    }

    fn decode(&self, payload: &[u8]) -> Result<DecodedEvent> {
        let event: E = codec::decode(payload)?;
        Ok(Arc::new(event))
    }

    fn invoke(&self, event: DecodedEvent) -> BoxFuture<'static, Result<()>> {
        match event.downcast::<E>() {
            Ok(event) => self.handler.handle((*event).clone()),
            Err(_) => Box::pin(async {
                Err(BusError::Decode {
                    target: std::any::type_name::<E>(),
                    detail: "delivery cache held a different type".to_string(),
                })
            }),
        }
    }
}

#[derive(Clone)]
struct Registration {
    id: u64,
    /// Handler allocation address; makes re-subscribing the same handler to
    /// the same channel a no-op.
    ident: usize,
    raw: Arc<dyn RawHandler>,
}

#[derive(Default)]
struct Registry {
    exact: HashMap<String, Vec<Registration>>,
    patterns: HashMap<String, Vec<Registration>>,
    next_id: u64,
}

impl Registry {
    fn bucket(&mut self, channel: &str, pattern: bool) -> &mut Vec<Registration> {
        let map = if pattern {
            &mut self.patterns
        } else {
            &mut self.exact
        };
        map.entry(channel.to_string()).or_default()
    }
}

/// Outcome of a registration attempt.
pub(crate) struct Registered {
    pub(crate) subscription: Subscription,
    /// True when this is the channel's first registration, i.e. the
    /// transport has not been subscribed yet.
    pub(crate) first_for_channel: bool,
    /// False when an identical (channel, handler) pair already existed.
    pub(crate) added: bool,
}

/// Subscription registry plus the delivery loop draining the transport sink.
#[derive(Default)]
pub(crate) struct Dispatcher {
    registry: Mutex<Registry>,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn register<E>(
        &self,
        channel: &str,
        pattern: bool,
        handler: Arc<dyn EventHandler<E>>,
    ) -> Registered
    where
        E: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let ident = Arc::as_ptr(&handler) as *const () as usize;
        let mut registry = self.registry.lock().await;

        let bucket = registry.bucket(channel, pattern);
        if let Some(existing) = bucket.iter().find(|r| r.ident == ident) {
            return Registered {
                subscription: Subscription {
                    id: existing.id,
                    channel: channel.to_string(),
                    pattern,
                },
                first_for_channel: false,
                added: false,
            };
        }

        let first_for_channel = bucket.is_empty();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.bucket(channel, pattern).push(Registration {
            id,
            ident,
            raw: Arc::new(TypedHandler { handler }),
        });

        Registered {
            subscription: Subscription {
                id,
                channel: channel.to_string(),
                pattern,
            },
            first_for_channel,
            added: true,
        }
    }

    /// Remove a subscription. Returns whether it was the channel's last
    /// registration, or `None` when the token was already gone.
    pub(crate) async fn remove(&self, subscription: &Subscription) -> Option<bool> {
        let mut registry = self.registry.lock().await;
        let map = if subscription.pattern {
            &mut registry.patterns
        } else {
            &mut registry.exact
        };
        let bucket = map.get_mut(&subscription.channel)?;
        let before = bucket.len();
        bucket.retain(|r| r.id != subscription.id);
        if bucket.len() == before {
            return None;
        }
        let last = bucket.is_empty();
        if last {
            map.remove(&subscription.channel);
        }
        Some(last)
    }

    /// Drop every registration. Transport-side subscription state is torn
    /// down wholesale by `Transport::stop`, not channel by channel.
    pub(crate) async fn clear(&self) {
        let mut registry = self.registry.lock().await;
        registry.exact.clear();
        registry.patterns.clear();
    }

    /// Deliver one message: decode each declared type once, invoke handlers
    /// in registration order, isolate failures.
    pub(crate) async fn dispatch(&self, delivery: Delivery) {
        let registrations: Vec<Registration> = {
            let registry = self.registry.lock().await;
            let map = match &delivery.pattern {
                Some(_) => &registry.patterns,
                None => &registry.exact,
            };
            let key = delivery
                .pattern
                .as_deref()
                .unwrap_or(delivery.channel.as_str());
            map.get(key).cloned().unwrap_or_default()
        };

        if registrations.is_empty() {
            debug!(channel = %delivery.channel, "no handlers registered for delivery");
            return;
        }

        let mut decoded: HashMap<TypeId, DecodedEvent> = HashMap::new();
        for registration in registrations {
            let type_id = registration.raw.event_type();
            let event = match decoded.get(&type_id) {
                Some(event) => event.clone(),
                None => match registration.raw.decode(&delivery.payload) {
                    Ok(event) => {
                        decoded.insert(type_id, event.clone());
                        event
                    }
                    Err(e) => {
                        error!(
                            channel = %delivery.channel,
                            error = %e,
                            "failed to decode delivery"
                        );
                        continue;
                    }
                },
            };

            if let Err(e) = registration.raw.invoke(event).await {
                error!(channel = %delivery.channel, error = %e, "handler failed");
            }
        }
    }

    /// Drain the transport sink until the bus closes or the sender goes
    /// away.
    ///
    /// Each channel (or pattern) gets its own ordered worker: deliveries on
    /// one channel run strictly in arrival order, while channels proceed
    /// independently. That keeps per-channel FIFO without letting a handler
    /// that calls back into the bus (publish, rpc, subscribe) deadlock the
    /// whole delivery path — an in-handler rpc waits on a reply channel
    /// served by a different worker.
    pub(crate) fn spawn(
        self: Arc<Self>,
        mut deliveries: mpsc::UnboundedReceiver<Delivery>,
        closing: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut workers: HashMap<String, mpsc::UnboundedSender<Delivery>> = HashMap::new();
            let mut router_closing = closing.clone();
            loop {
                tokio::select! {
                    delivery = deliveries.recv() => match delivery {
                        Some(delivery) => {
                            let key = delivery
                                .pattern
                                .clone()
                                .unwrap_or_else(|| delivery.channel.clone());
                            let worker = workers.entry(key).or_insert_with(|| {
                                let (tx, rx) = mpsc::unbounded_channel();
                                tokio::spawn(self.clone().run_worker(rx, closing.clone()));
                                tx
                            });
                            let _ = worker.send(delivery);
                        }
                        None => break,
                    },
                    changed = router_closing.changed() => {
                        if changed.is_err() || *router_closing.borrow() {
                            break;
                        }
                    }
                }
            }
            // Dropping the senders ends the per-channel workers.
            debug!("delivery router stopped");
        })
    }

    async fn run_worker(
        self: Arc<Self>,
        mut deliveries: mpsc::UnboundedReceiver<Delivery>,
        mut closing: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => self.dispatch(delivery).await,
                    None => break,
                },
                changed = closing.changed() => {
                    if changed.is_err() || *closing.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
