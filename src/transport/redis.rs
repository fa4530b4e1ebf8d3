//! Shared-broker transport over Redis pub/sub and lists.
//!
//! Channels map to Redis pub/sub channels and queues to Redis lists, both
//! under a namespace prefix so unrelated deployments can share one broker.
//! Pattern subscriptions use the broker's native glob matching
//! (`PSUBSCRIBE`); exact and pattern subscriptions arrive as distinct
//! message kinds and therefore produce independent deliveries.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink};
use redis::{AsyncCommands, Client};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{Capabilities, Delivery, DeliverySink, Transport, TransportQueue};
use crate::config::RedisConfig;
use crate::error::{BusError, Result};

/// Transport backed by a shared Redis broker.
pub struct RedisTransport {
    client: Client,
    conn: ConnectionManager,
    prefix: String,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    sink: Option<PubSubSink>,
    reader: Option<JoinHandle<()>>,
}

impl RedisTransport {
    /// Connect to the broker named by the config.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client =
            Client::open(config.url.as_str()).map_err(|e| BusError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        info!(url = %config.url, namespace = %config.namespace, "connected to redis");

        Ok(Self {
            client,
            conn,
            prefix: config.prefix(),
            state: Mutex::new(State::default()),
        })
    }

    fn channel_key(&self, channel: &str) -> String {
        format!("{}{}", self.prefix, channel)
    }

    fn queue_key(&self, name: &str) -> String {
        format!("{}queue:{}", self.prefix, name)
    }
}

fn strip_prefix(prefix: &str, raw: &str) -> String {
    raw.strip_prefix(prefix).unwrap_or(raw).to_string()
}

#[async_trait]
impl Transport for RedisTransport {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            patterns: true,
            cross_process: true,
            queue_len: true,
        }
    }

    async fn start(&self, sink: DeliverySink) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.reader.is_some() {
            return Ok(());
        }

        let pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        let (pubsub_sink, mut stream) = pubsub.split();

        let prefix = self.prefix.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let channel = strip_prefix(&prefix, msg.get_channel_name());
                let pattern = msg
                    .get_pattern::<Option<String>>()
                    .ok()
                    .flatten()
                    .map(|p| strip_prefix(&prefix, &p));
                let delivery = Delivery {
                    channel,
                    pattern,
                    payload: msg.get_payload_bytes().to_vec(),
                };
                if sink.send(delivery).is_err() {
                    break;
                }
            }
            debug!("redis pub/sub stream ended");
        });

        state.sink = Some(pubsub_sink);
        state.reader = Some(reader);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        // Dropping the pub/sub halves tears down the broker-side
        // subscriptions.
        state.sink = None;
        if let Some(reader) = state.reader.take() {
            reader.abort();
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        let key = self.channel_key(channel);
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(&key, payload).await?;
        debug!(channel = %key, receivers, "published");
        Ok(())
    }

    async fn subscribe(&self, channel: &str, pattern: bool) -> Result<()> {
        let key = self.channel_key(channel);
        let mut state = self.state.lock().await;
        let sink = state
            .sink
            .as_mut()
            .ok_or_else(|| BusError::Transport("transport not started".to_string()))?;
        if pattern {
            sink.psubscribe(&key).await?;
        } else {
            sink.subscribe(&key).await?;
        }
        debug!(channel = %key, pattern, "subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str, pattern: bool) -> Result<()> {
        let key = self.channel_key(channel);
        let mut state = self.state.lock().await;
        let sink = match state.sink.as_mut() {
            Some(sink) => sink,
            // Already stopped; the broker side is gone with the connection.
            None => return Ok(()),
        };
        if pattern {
            sink.punsubscribe(&key).await?;
        } else {
            sink.unsubscribe(&key).await?;
        }
        Ok(())
    }

    fn queue(&self, name: &str) -> Result<Arc<dyn TransportQueue>> {
        Ok(Arc::new(RedisQueue {
            name: name.to_string(),
            key: self.queue_key(name),
            conn: self.conn.clone(),
            client: self.client.clone(),
        }))
    }
}

/// Redis-list-backed FIFO: `LPUSH` head, pop tail.
struct RedisQueue {
    name: String,
    key: String,
    conn: ConnectionManager,
    /// Blocking pops would stall every command sharing the multiplexed
    /// connection, so each one runs on a connection of its own.
    client: Client,
}

#[async_trait]
impl TransportQueue for RedisQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, payload: Vec<u8>, _timeout: Option<Duration>) -> Result<()> {
        // Lists are unbounded; put never has to wait.
        let mut conn = self.conn.clone();
        let _: i64 = conn.lpush(&self.key, payload).await?;
        Ok(())
    }

    async fn try_put(&self, payload: Vec<u8>) -> Result<()> {
        self.put(payload, None).await
    }

    async fn get(&self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        match timeout {
            None => {
                let (_key, item): (String, Vec<u8>) = conn.brpop(&self.key, 0.0).await?;
                Ok(item)
            }
            Some(timeout) => {
                // BRPOP treats 0 as "forever"; clamp to the broker's
                // resolution floor instead.
                let seconds = timeout.as_secs_f64().max(0.001);
                let popped: Option<(String, Vec<u8>)> = conn.brpop(&self.key, seconds).await?;
                popped.map(|(_, item)| item).ok_or(BusError::QueueEmpty)
            }
        }
    }

    async fn try_get(&self) -> Result<Vec<u8>> {
        let mut conn = self.conn.clone();
        let popped: Option<Vec<u8>> = conn.rpop(&self.key, None::<NonZeroUsize>).await?;
        popped.ok_or(BusError::QueueEmpty)
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(&self.key).await?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let config = RedisConfig {
            url: "redis://localhost".to_string(),
            namespace: "staging".to_string(),
        };
        assert_eq!(config.prefix(), "omnibus:staging:");
    }

    #[test]
    fn test_strip_prefix_leaves_foreign_channels_alone() {
        assert_eq!(strip_prefix("omnibus:global:", "omnibus:global:a.B"), "a.B");
        assert_eq!(strip_prefix("omnibus:global:", "other:a.B"), "other:a.B");
    }
}
