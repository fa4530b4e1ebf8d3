//! In-memory transport for tests and single-process embedding.
//!
//! Publishing loops straight back into the delivery sink; there is no
//! cross-process visibility and no pattern matching. Queues are unbounded
//! process-local FIFOs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use super::{Capabilities, Delivery, DeliverySink, Transport, TransportQueue};
use crate::error::{BusError, Result};

/// Single-process transport.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<State>,
    queues: std::sync::Mutex<HashMap<String, Arc<MemoryQueue>>>,
}

#[derive(Default)]
struct State {
    sink: Option<DeliverySink>,
    subscribed: HashSet<String>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn unsupported(&self, operation: &'static str) -> BusError {
        BusError::Unsupported {
            operation,
            transport: self.name(),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            patterns: false,
            cross_process: false,
            queue_len: true,
        }
    }

    async fn start(&self, sink: DeliverySink) -> Result<()> {
        self.state.lock().await.sink = Some(sink);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.sink = None;
        state.subscribed.clear();
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        let state = self.state.lock().await;
        if !state.subscribed.contains(channel) {
            debug!(channel, "no subscribers, dropping message");
            return Ok(());
        }
        match &state.sink {
            Some(sink) => sink
                .send(Delivery {
                    channel: channel.to_string(),
                    pattern: None,
                    payload,
                })
                .map_err(|_| BusError::Transport("delivery loop has stopped".to_string())),
            None => Err(BusError::Transport("transport not started".to_string())),
        }
    }

    async fn subscribe(&self, channel: &str, pattern: bool) -> Result<()> {
        if pattern {
            return Err(self.unsupported("pattern subscription"));
        }
        self.state.lock().await.subscribed.insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str, pattern: bool) -> Result<()> {
        if pattern {
            return Err(self.unsupported("pattern subscription"));
        }
        self.state.lock().await.subscribed.remove(channel);
        Ok(())
    }

    fn queue(&self, name: &str) -> Result<Arc<dyn TransportQueue>> {
        let mut queues = self
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let queue = queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::new(name)))
            .clone();
        Ok(queue)
    }
}

/// Unbounded process-local FIFO.
struct MemoryQueue {
    name: String,
    items: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
}

impl MemoryQueue {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    async fn pop(&self) -> Option<Vec<u8>> {
        let mut items = self.items.lock().await;
        let item = items.pop_front();
        // A stored permit wakes only one waiter; chain to the next one when
        // items remain.
        if item.is_some() && !items.is_empty() {
            self.notify.notify_one();
        }
        item
    }
}

#[async_trait]
impl TransportQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, payload: Vec<u8>, _timeout: Option<Duration>) -> Result<()> {
        self.items.lock().await.push_back(payload);
        self.notify.notify_one();
        Ok(())
    }

    async fn try_put(&self, payload: Vec<u8>) -> Result<()> {
        self.put(payload, None).await
    }

    async fn get(&self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(item) = self.pop().await {
                return Ok(item);
            }
            match deadline {
                None => self.notify.notified().await,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(BusError::QueueEmpty);
                    }
                    if tokio::time::timeout(deadline - now, self.notify.notified())
                        .await
                        .is_err()
                    {
                        return match self.pop().await {
                            Some(item) => Ok(item),
                            None => Err(BusError::QueueEmpty),
                        };
                    }
                }
            }
        }
    }

    async fn try_get(&self) -> Result<Vec<u8>> {
        self.pop().await.ok_or(BusError::QueueEmpty)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.items.lock().await.len())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let transport = MemoryTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.start(tx).await.unwrap();

        transport.publish("nobody.Home", b"{}".to_vec()).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_reaches_sink_after_subscribe() {
        let transport = MemoryTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.start(tx).await.unwrap();

        transport.subscribe("a.B", false).await.unwrap();
        transport.publish("a.B", b"1".to_vec()).await.unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.channel, "a.B");
        assert_eq!(delivery.payload, b"1");
        assert!(delivery.pattern.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let transport = MemoryTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.start(tx).await.unwrap();

        transport.subscribe("a.B", false).await.unwrap();
        transport.unsubscribe("a.B", false).await.unwrap();
        transport.publish("a.B", b"1".to_vec()).await.unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pattern_subscribe_is_unsupported() {
        let transport = MemoryTransport::new();
        assert!(matches!(
            transport.subscribe("a.*", true).await,
            Err(BusError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_queue_fifo_and_len() {
        let transport = MemoryTransport::new();
        let queue = transport.queue("jobs").unwrap();

        queue.put(b"a".to_vec(), None).await.unwrap();
        queue.put(b"b".to_vec(), None).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 2);

        assert_eq!(queue.get(None).await.unwrap(), b"a");
        assert_eq!(queue.try_get().await.unwrap(), b"b");
        assert!(matches!(queue.try_get().await, Err(BusError::QueueEmpty)));
    }

    #[tokio::test]
    async fn test_queue_handle_is_shared_by_name() {
        let transport = MemoryTransport::new();
        let producer = transport.queue("shared").unwrap();
        let consumer = transport.queue("shared").unwrap();

        producer.put(b"x".to_vec(), None).await.unwrap();
        assert_eq!(consumer.try_get().await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_timed_get_waits_out_the_deadline() {
        let transport = MemoryTransport::new();
        let queue = transport.queue("empty").unwrap();

        let started = std::time::Instant::now();
        let result = queue.get(Some(Duration::from_millis(50))).await;
        assert!(matches!(result, Err(BusError::QueueEmpty)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_blocking_get_wakes_on_put() {
        let transport = MemoryTransport::new();
        let queue = transport.queue("handoff").unwrap();
        let consumer = transport.queue("handoff").unwrap();

        let waiter = tokio::spawn(async move { consumer.get(None).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.put(b"item".to_vec(), None).await.unwrap();

        let item = waiter.await.unwrap().unwrap();
        assert_eq!(item, b"item");
    }
}
