//! Process-default bus.
//!
//! Every operation ultimately takes a [`Bus`]; this module keeps one per
//! process for callers that do not want to thread the handle. `init`
//! installs it, `shutdown` tears it down, and the free functions forward.
//! Calls before `init` fail with `NotInitialized` — registration is not
//! deferred.

use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::bus::{Bus, Subscription};
use crate::config::ProviderConfig;
use crate::error::{BusError, Result};
use crate::event::{Event, EventHandler, Topic};
use crate::queue::Queue;
use crate::rpc::Stub;

static DEFAULT_BUS: RwLock<Option<Bus>> = RwLock::new(None);

fn read() -> Option<Bus> {
    DEFAULT_BUS
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

/// The installed process-default bus.
pub fn bus() -> Result<Bus> {
    read().ok_or(BusError::NotInitialized)
}

/// Construct the configured transport, start a bus on it, and install it as
/// the process-default. Fails with `AlreadyInitialized` while a bus is
/// active.
pub async fn init(config: &ProviderConfig) -> Result<Bus> {
    if read().is_some() {
        return Err(BusError::AlreadyInitialized);
    }

    let bus = Bus::connect(config).await?;

    let installed = {
        let mut guard = DEFAULT_BUS
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.is_some() {
            false
        } else {
            *guard = Some(bus.clone());
            true
        }
    };

    if !installed {
        bus.close().await?;
        return Err(BusError::AlreadyInitialized);
    }
    Ok(bus)
}

/// Close and clear the process-default bus. Idempotent; a no-op when no bus
/// is installed.
pub async fn shutdown() -> Result<()> {
    let bus = {
        let mut guard = DEFAULT_BUS
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.take()
    };
    match bus {
        Some(bus) => bus.close().await,
        None => Ok(()),
    }
}

/// Publish an event on the channel derived from its type.
pub async fn publish<E: Event>(event: &E) -> Result<()> {
    bus()?.publish(event).await
}

/// Subscribe a handler on the channel derived from its event type.
pub async fn subscribe<E: Event>(handler: Arc<dyn EventHandler<E>>) -> Result<Subscription> {
    bus()?.subscribe(handler).await
}

/// Subscribe an async closure on the channel derived from its event type.
pub async fn on<E, F, Fut>(f: F) -> Result<Subscription>
where
    E: Event,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    bus()?.on(f).await
}

/// Remove a subscription.
pub async fn unsubscribe(subscription: &Subscription) -> Result<()> {
    bus()?.unsubscribe(subscription).await
}

/// Handle on the named FIFO queue.
pub fn queue(name: &str) -> Result<Queue> {
    bus()?.queue(name)
}

/// Typed handle onto an explicit channel.
pub fn topic<E>(name: &str) -> Result<Topic<E>>
where
    E: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    Ok(bus()?.topic(name))
}

/// Register a callable under an address.
pub async fn expose<A, R, E, F, Fut>(address: &str, f: F) -> Result<()>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: std::fmt::Display,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
{
    bus()?.expose(address, f).await
}

/// Remove the callable registered under an address.
pub async fn unexpose(address: &str) -> Result<()> {
    bus()?.unexpose(address).await
}

/// Stub for invoking the callable registered under an address.
pub fn stub(address: &str) -> Result<Stub> {
    Ok(bus()?.stub(address))
}

/// Stub with a deadline already applied.
pub fn stub_with_timeout(address: &str, timeout: Duration) -> Result<Stub> {
    Ok(bus()?.stub(address).timeout(timeout))
}

/// Single-mode invocation with no deadline.
pub async fn rpc<A, R>(address: &str, args: A) -> Result<R>
where
    A: Serialize,
    R: DeserializeOwned,
{
    bus()?.rpc(address, args).await
}
