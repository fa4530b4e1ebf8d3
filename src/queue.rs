//! Uniform FIFO facade over the transport queue primitives.
//!
//! Items are codec-encoded with whatever type the caller names at each call
//! site; the queue itself is untyped, so a consumer applies its own decoder
//! on `get`. In practice queues carry scalars, strings, or small records.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec;
use crate::error::Result;
use crate::transport::TransportQueue;

/// Handle onto a named FIFO queue.
///
/// FIFO holds across producers and consumers. The backing object is created
/// lazily on first reference and outlives this handle.
pub struct Queue {
    name: String,
    inner: Arc<dyn TransportQueue>,
}

impl Queue {
    pub(crate) fn new(name: &str, inner: Arc<dyn TransportQueue>) -> Self {
        Self {
            name: name.to_string(),
            inner,
        }
    }

    /// The queue's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append an item, waiting for capacity if the transport bounds queues.
    pub async fn put<T: Serialize + ?Sized>(&self, item: &T) -> Result<()> {
        self.inner.put(codec::encode(item)?, None).await
    }

    /// Append an item, waiting at most `timeout` for capacity; fails with
    /// `QueueFull` when the deadline elapses.
    pub async fn put_timeout<T: Serialize + ?Sized>(
        &self,
        item: &T,
        timeout: Duration,
    ) -> Result<()> {
        self.inner.put(codec::encode(item)?, Some(timeout)).await
    }

    /// Append an item without waiting; fails with `QueueFull`.
    pub async fn put_nowait<T: Serialize + ?Sized>(&self, item: &T) -> Result<()> {
        self.inner.try_put(codec::encode(item)?).await
    }

    /// Pop the oldest item, waiting until one arrives.
    pub async fn get<T: DeserializeOwned>(&self) -> Result<T> {
        codec::decode(&self.inner.get(None).await?)
    }

    /// Pop the oldest item, waiting at least `timeout` before failing with
    /// `QueueEmpty`.
    pub async fn get_timeout<T: DeserializeOwned>(&self, timeout: Duration) -> Result<T> {
        codec::decode(&self.inner.get(Some(timeout)).await?)
    }

    /// Pop the oldest item without waiting; fails with `QueueEmpty`.
    pub async fn get_nowait<T: DeserializeOwned>(&self) -> Result<T> {
        codec::decode(&self.inner.try_get().await?)
    }

    /// Current number of items; `Unsupported` where the transport cannot
    /// answer exactly.
    pub async fn len(&self) -> Result<usize> {
        self.inner.len().await
    }

    /// Whether the queue currently holds no items; same support caveat as
    /// [`Queue::len`].
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}
