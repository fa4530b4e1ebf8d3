//! Queue facade behavior over the in-memory transport.

use std::time::{Duration, Instant};

use omnibus::{Bus, BusError, ProviderConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Job {
    id: u32,
    payload: String,
}

async fn memory_bus() -> Bus {
    Bus::connect(&ProviderConfig::memory()).await.unwrap()
}

#[tokio::test]
async fn test_fifo_across_put_and_get() {
    let bus = memory_bus().await;
    let queue = bus.queue("letters").unwrap();

    queue.put("a").await.unwrap();
    queue.put("b").await.unwrap();
    queue.put("c").await.unwrap();

    assert_eq!(queue.get::<String>().await.unwrap(), "a");
    assert_eq!(queue.get::<String>().await.unwrap(), "b");
    assert_eq!(queue.get::<String>().await.unwrap(), "c");

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_queues_are_shared_by_name() {
    let bus = memory_bus().await;
    let producer = bus.queue("shared").unwrap();
    let consumer = bus.queue("shared").unwrap();

    producer.put(&1u32).await.unwrap();
    assert_eq!(consumer.get_nowait::<u32>().await.unwrap(), 1);

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_get_nowait_on_empty_queue() {
    let bus = memory_bus().await;
    let queue = bus.queue("empty").unwrap();

    assert!(matches!(
        queue.get_nowait::<String>().await,
        Err(BusError::QueueEmpty)
    ));

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_timed_get_blocks_at_least_the_deadline() {
    let bus = memory_bus().await;
    let queue = bus.queue("slow").unwrap();

    let started = Instant::now();
    let result = queue.get_timeout::<String>(Duration::from_millis(80)).await;

    assert!(matches!(result, Err(BusError::QueueEmpty)));
    assert!(started.elapsed() >= Duration::from_millis(80));

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_timed_get_returns_early_when_item_arrives() {
    let bus = memory_bus().await;
    let queue = bus.queue("handoff").unwrap();
    let producer = bus.queue("handoff").unwrap();

    let waiter = tokio::spawn(async move {
        queue.get_timeout::<String>(Duration::from_secs(5)).await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    producer.put("x").await.unwrap();

    assert_eq!(waiter.await.unwrap().unwrap(), "x");

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_structured_items_round_trip() {
    let bus = memory_bus().await;
    let queue = bus.queue("jobs").unwrap();

    let job = Job {
        id: 42,
        payload: "resize".to_string(),
    };
    queue.put(&job).await.unwrap();
    assert_eq!(queue.get::<Job>().await.unwrap(), job);

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_len_and_is_empty() {
    let bus = memory_bus().await;
    let queue = bus.queue("counted").unwrap();

    assert!(queue.is_empty().await.unwrap());
    queue.put(&1).await.unwrap();
    queue.put(&2).await.unwrap();
    assert_eq!(queue.len().await.unwrap(), 2);
    assert!(!queue.is_empty().await.unwrap());

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_put_nowait_succeeds_on_unbounded_queue() {
    let bus = memory_bus().await;
    let queue = bus.queue("roomy").unwrap();

    for i in 0..100 {
        queue.put_nowait(&i).await.unwrap();
    }
    assert_eq!(queue.len().await.unwrap(), 100);

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_queue_keeps_its_name() {
    let bus = memory_bus().await;
    assert_eq!(bus.queue("named").unwrap().name(), "named");
    bus.close().await.unwrap();
}
