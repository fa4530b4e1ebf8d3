//! Pub/sub behavior over the in-memory transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use omnibus::{handler_fn, Bus, BusError, Event, ProviderConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Ping {
    seq: u64,
}

impl Event for Ping {
    fn channel() -> &'static str {
        "tests.Ping"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Pong {
    seq: u64,
}

impl Event for Pong {
    fn channel() -> &'static str {
        "tests.Pong"
    }
}

async fn memory_bus() -> Bus {
    Bus::connect(&ProviderConfig::memory()).await.unwrap()
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("channel closed")
}

#[tokio::test]
async fn test_round_trip_preserves_event() {
    let bus = memory_bus().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    bus.on(move |ping: Ping| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(ping);
            Ok(())
        }
    })
    .await
    .unwrap();

    bus.publish(&Ping { seq: 7 }).await.unwrap();
    assert_eq!(recv(&mut rx).await, Ping { seq: 7 });

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_events_stay_on_their_own_channel() {
    let bus = memory_bus().await;
    let pings = Arc::new(AtomicUsize::new(0));
    let pongs = Arc::new(AtomicUsize::new(0));

    let ping_count = pings.clone();
    bus.on(move |_: Ping| {
        let count = ping_count.clone();
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .await
    .unwrap();

    let pong_count = pongs.clone();
    bus.on(move |_: Pong| {
        let count = pong_count.clone();
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .await
    .unwrap();

    bus.publish(&Ping { seq: 1 }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(pings.load(Ordering::SeqCst), 1);
    assert_eq!(pongs.load(Ordering::SeqCst), 0);

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_fan_out_to_every_subscriber() {
    let bus = memory_bus().await;
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();

    bus.on(move |ping: Ping| {
        let tx = tx_a.clone();
        async move {
            let _ = tx.send(ping.seq);
            Ok(())
        }
    })
    .await
    .unwrap();
    bus.on(move |ping: Ping| {
        let tx = tx_b.clone();
        async move {
            let _ = tx.send(ping.seq);
            Ok(())
        }
    })
    .await
    .unwrap();

    bus.publish(&Ping { seq: 3 }).await.unwrap();
    assert_eq!(recv(&mut rx_a).await, 3);
    assert_eq!(recv(&mut rx_b).await, 3);

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_resubscribing_same_handler_delivers_once() {
    let bus = memory_bus().await;
    let count = Arc::new(AtomicUsize::new(0));

    let counter = count.clone();
    let handler = handler_fn(move |_: Ping| {
        let count = counter.clone();
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let first = bus.subscribe(handler.clone()).await.unwrap();
    let second = bus.subscribe(handler).await.unwrap();
    assert_eq!(first, second);

    bus.publish(&Ping { seq: 1 }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_unsubscribe_cuts_off_later_publishes() {
    let bus = memory_bus().await;
    let count = Arc::new(AtomicUsize::new(0));

    let counter = count.clone();
    let subscription = bus
        .on(move |_: Ping| {
            let count = counter.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

    bus.publish(&Ping { seq: 1 }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    bus.unsubscribe(&subscription).await.unwrap();
    bus.publish(&Ping { seq: 2 }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(count.load(Ordering::SeqCst), 1);

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_handler_failure_does_not_starve_siblings() {
    let bus = memory_bus().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    bus.on(|_: Ping| async move { Err(BusError::Transport("handler exploded".to_string())) })
        .await
        .unwrap();
    bus.on(move |ping: Ping| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(ping.seq);
            Ok(())
        }
    })
    .await
    .unwrap();

    bus.publish(&Ping { seq: 9 }).await.unwrap();
    assert_eq!(recv(&mut rx).await, 9);

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_pattern_subscription_fails_up_front_on_memory() {
    let bus = memory_bus().await;

    let result = bus
        .on_pattern("tests.*", |_: Ping| async move { Ok(()) })
        .await;
    assert!(matches!(result, Err(BusError::Unsupported { .. })));

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_per_channel_publication_order_is_preserved() {
    let bus = memory_bus().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    bus.on(move |ping: Ping| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(ping.seq);
            Ok(())
        }
    })
    .await
    .unwrap();

    for seq in 0..20 {
        bus.publish(&Ping { seq }).await.unwrap();
    }
    for expected in 0..20 {
        assert_eq!(recv(&mut rx).await, expected);
    }

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_handler_may_publish_during_dispatch() {
    let bus = memory_bus().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let relay = bus.clone();
    bus.on(move |ping: Ping| {
        let relay = relay.clone();
        async move { relay.publish(&Pong { seq: ping.seq }).await }
    })
    .await
    .unwrap();

    bus.on(move |pong: Pong| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(pong.seq);
            Ok(())
        }
    })
    .await
    .unwrap();

    bus.publish(&Ping { seq: 11 }).await.unwrap();
    assert_eq!(recv(&mut rx).await, 11);

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_topic_binds_type_to_explicit_channel() {
    let bus = memory_bus().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let topic = bus.topic::<Ping>("wire.alpha");
    topic
        .on(move |ping: Ping| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(ping);
                Ok(())
            }
        })
        .await
        .unwrap();

    topic.publish(&Ping { seq: 4 }).await.unwrap();
    assert_eq!(recv(&mut rx).await, Ping { seq: 4 });

    // The derived channel is untouched by topic traffic.
    let derived = Arc::new(AtomicUsize::new(0));
    let counter = derived.clone();
    bus.on(move |_: Ping| {
        let count = counter.clone();
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .await
    .unwrap();
    topic.publish(&Ping { seq: 5 }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(derived.load(Ordering::SeqCst), 0);

    bus.close().await.unwrap();
}
