//! Request/response RPC built on top of pub/sub.
//!
//! An exposed callable listens on its address's invocation channel; every
//! call publishes an invocation envelope there and collects correlated
//! response envelopes on a private, per-call reply channel. Single mode
//! resolves on the first response; multi mode aggregates every response
//! that arrives within a collection window.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{Bus, Subscription};
use crate::codec;
use crate::error::{BusError, Result};
use crate::event::handler_fn;

/// Channel prefix for invocation channels.
const INVOKE_PREFIX: &str = "__rpc__.";
/// Channel prefix for per-call reply channels.
const REPLY_PREFIX: &str = "__rpc_reply__.";

/// Collection window multi-mode falls back to when the stub sets none.
const DEFAULT_MULTI_WINDOW: Duration = Duration::from_secs(1);

/// The invocation channel for an address.
pub(crate) fn invoke_channel(address: &str) -> String {
    format!("{INVOKE_PREFIX}{address}")
}

fn reply_channel(id: &Uuid) -> String {
    format!("{REPLY_PREFIX}{id}")
}

/// Invocation envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Correlation token, unique per call.
    pub id: Uuid,
    /// Channel responses must be published on.
    pub reply_channel: String,
    /// Address of the target callable.
    pub function: String,
    /// Positional argument tuple, codec-encoded.
    pub args: Value,
}

/// Response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Correlation token, echoing the invocation.
    pub id: Uuid,
    /// Opaque identity of the responder.
    pub responder: String,
    /// Encoded return value; absent on failure.
    pub result: Option<Value>,
    /// Error text; absent on success.
    pub error: Option<String>,
}

impl RpcResponse {
    /// Whether the responder reported a failure.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Decode the result as the caller's expected type; a remote failure
    /// surfaces as `BusError::Remote`.
    pub fn decode<R: DeserializeOwned>(&self) -> Result<R> {
        if let Some(error) = &self.error {
            return Err(BusError::Remote(error.clone()));
        }
        codec::decode_value(self.result.clone().unwrap_or(Value::Null))
    }
}

/// RPC book-keeping owned by the bus: the in-flight invocation table and
/// the exposed-callables table. Locks guard only table mutation; neither is
/// held while user code runs.
///
/// The in-flight table is the correlation path: reply-channel collectors
/// route every response through it by id, so a response whose record is
/// gone (completed, timed out, or shut down) is discarded.
pub(crate) struct RpcState {
    inflight: Mutex<HashMap<Uuid, mpsc::UnboundedSender<RpcResponse>>>,
    exposed: Mutex<HashMap<String, Subscription>>,
}

impl RpcState {
    pub(crate) fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
            exposed: Mutex::new(HashMap::new()),
        }
    }
}

/// Register a callable under an address; see [`Bus::expose`].
pub(crate) async fn expose<A, R, E, F, Fut>(bus: &Bus, address: &str, f: F) -> Result<()>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: Display,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
{
    let channel = invoke_channel(address);
    let skeleton = skeleton(bus.clone(), f);
    let subscription = bus.subscribe_to::<RpcRequest>(&channel, skeleton).await?;

    let previous = bus
        .rpc_state()
        .exposed
        .lock()
        .await
        .insert(address.to_string(), subscription);

    if let Some(previous) = previous {
        debug!(address, "replacing exposed callable");
        bus.unsubscribe(&previous).await?;
    }
    Ok(())
}

/// Remove the callable registered under an address, if any.
pub(crate) async fn unexpose(bus: &Bus, address: &str) -> Result<()> {
    let subscription = bus.rpc_state().exposed.lock().await.remove(address);
    match subscription {
        Some(subscription) => bus.unsubscribe(&subscription).await,
        None => Ok(()),
    }
}

/// Release every pending waiter and drop every exposure. Called by
/// `Bus::close` after the closing signal has flipped.
pub(crate) async fn shutdown(bus: &Bus) {
    // Dropping the in-flight senders closes each waiter's receiver, so
    // pending calls resolve with `Shutdown` even before they next observe
    // the closing signal.
    bus.rpc_state().inflight.lock().await.clear();

    let exposed: Vec<(String, Subscription)> = {
        let mut table = bus.rpc_state().exposed.lock().await;
        table.drain().collect()
    };
    for (address, subscription) in exposed {
        debug!(address = %address, "removing exposed callable");
        if let Err(e) = bus.unsubscribe(&subscription).await {
            warn!(address = %address, error = %e, "failed to remove exposed callable");
        }
    }
}

/// Wrap a callable as a handler for invocation envelopes. Argument-decode
/// failures and callable errors both travel back in the response envelope;
/// the invocation channel never sees them.
fn skeleton<A, R, E, F, Fut>(
    bus: Bus,
    f: F,
) -> Arc<dyn crate::event::EventHandler<RpcRequest>>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: Display,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
{
    let f = Arc::new(f);
    handler_fn(move |request: RpcRequest| {
        let bus = bus.clone();
        let f = f.clone();
        async move {
            let responder = bus.identity().to_string();
            let (result, error) = match codec::decode_value::<A>(request.args.clone()) {
                Err(e) => (None, Some(e.to_string())),
                Ok(args) => match f(args).await {
                    Ok(value) => match codec::encode_value(&value) {
                        Ok(value) => (Some(value), None),
                        Err(e) => (None, Some(e.to_string())),
                    },
                    Err(e) => (None, Some(e.to_string())),
                },
            };

            let response = RpcResponse {
                id: request.id,
                responder,
                result,
                error,
            };
            bus.publish_to(&request.reply_channel, &response).await
        }
    })
}

/// Callable handle for an RPC address.
///
/// `call` resolves on the first correlated response (or `RpcTimeout` once
/// the deadline passes); `call_multi` collects every response within the
/// collection window and may return an empty list — which is how an address
/// with no responder manifests in multi mode.
pub struct Stub {
    bus: Bus,
    address: String,
    timeout: Option<Duration>,
}

impl Stub {
    pub(crate) fn new(bus: Bus, address: &str) -> Self {
        Self {
            bus,
            address: address.to_string(),
            timeout: None,
        }
    }

    /// The address this stub invokes.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Deadline for `call`; collection window for `call_multi`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Invoke and decode the single response's result.
    pub async fn call<A, R>(&self, args: A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let responses = self.invoke(&args, false).await?;
        match responses.into_iter().next() {
            Some(response) => response.decode(),
            None => Err(BusError::RpcTimeout),
        }
    }

    /// Invoke and collect every response arriving within the collection
    /// window (the stub timeout, or one second when unset).
    pub async fn call_multi<A: Serialize>(&self, args: A) -> Result<Vec<RpcResponse>> {
        self.invoke(&args, true).await
    }

    async fn invoke<A: Serialize>(&self, args: &A, multi: bool) -> Result<Vec<RpcResponse>> {
        if self.bus.is_closed() {
            return Err(BusError::Shutdown);
        }

        let id = Uuid::new_v4();
        let reply = reply_channel(&id);
        let request = RpcRequest {
            id,
            reply_channel: reply.clone(),
            function: self.address.clone(),
            args: codec::encode_value(args)?,
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.bus.rpc_state().inflight.lock().await.insert(id, tx);

        let collector_bus = self.bus.clone();
        let collector = handler_fn(move |response: RpcResponse| {
            let bus = collector_bus.clone();
            async move {
                route_response(&bus, response).await;
                Ok(())
            }
        });
        let subscription = match self.bus.subscribe_to::<RpcResponse>(&reply, collector).await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.bus.rpc_state().inflight.lock().await.remove(&id);
                return Err(e);
            }
        };

        let outcome = self.wait(&request, &mut rx, multi).await;

        // The in-flight record and the collector go away regardless of the
        // outcome; a late response is simply discarded.
        self.bus.rpc_state().inflight.lock().await.remove(&id);
        if let Err(e) = self.bus.unsubscribe(&subscription).await {
            warn!(address = %self.address, error = %e, "failed to drop reply subscription");
        }
        outcome
    }

    /// Await correlated responses. Everything arriving on the receiver has
    /// already been matched against the in-flight table by id.
    async fn wait(
        &self,
        request: &RpcRequest,
        rx: &mut mpsc::UnboundedReceiver<RpcResponse>,
        multi: bool,
    ) -> Result<Vec<RpcResponse>> {
        self.bus
            .publish_to(&invoke_channel(&self.address), request)
            .await?;

        let mut closing = self.bus.closing();
        if multi {
            let window = self.timeout.unwrap_or(DEFAULT_MULTI_WINDOW);
            let deadline = Instant::now() + window;
            let mut responses = Vec::new();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => return Ok(responses),
                    changed = closing.changed() => {
                        if changed.is_err() || *closing.borrow() {
                            return Err(BusError::Shutdown);
                        }
                    }
                    response = rx.recv() => match response {
                        Some(response) => responses.push(response),
                        None => return Err(BusError::Shutdown),
                    },
                }
            }
        } else {
            let deadline = self.timeout.map(|t| Instant::now() + t);
            loop {
                tokio::select! {
                    _ = sleep_until_or_forever(deadline) => return Err(BusError::RpcTimeout),
                    changed = closing.changed() => {
                        if changed.is_err() || *closing.borrow() {
                            return Err(BusError::Shutdown);
                        }
                    }
                    response = rx.recv() => match response {
                        Some(response) => return Ok(vec![response]),
                        None => return Err(BusError::Shutdown),
                    },
                }
            }
        }
    }
}

/// Hand a reply-channel delivery to the waiter that owns its correlation
/// id. A response with no in-flight record (expired, already answered in
/// single mode, or foreign) is discarded.
async fn route_response(bus: &Bus, response: RpcResponse) {
    let inflight = bus.rpc_state().inflight.lock().await;
    match inflight.get(&response.id) {
        Some(waiter) => {
            let _ = waiter.send(response);
        }
        None => {
            debug!(id = %response.id, "discarding response with no in-flight record");
        }
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
