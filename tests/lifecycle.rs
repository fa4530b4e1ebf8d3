//! Lifecycle behavior: the process-default bus and shutdown semantics.

use std::convert::Infallible;
use std::time::Duration;

use omnibus::{global, Bus, BusError, Event, ProviderConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Beat {
    n: u32,
}

impl Event for Beat {
    fn channel() -> &'static str {
        "tests.Beat"
    }
}

/// The process-default bus is per-process state, so its whole lifecycle is
/// exercised in one test to keep parallel test threads out of each other's
/// way.
#[tokio::test]
async fn test_process_default_bus_lifecycle() {
    // Before init, every forwarder refuses.
    assert!(matches!(global::bus(), Err(BusError::NotInitialized)));
    assert!(matches!(
        global::publish(&Beat { n: 0 }).await,
        Err(BusError::NotInitialized)
    ));
    assert!(matches!(global::queue("q"), Err(BusError::NotInitialized)));

    // Shutdown before init is a quiet no-op.
    global::shutdown().await.unwrap();

    let bus = global::init(&ProviderConfig::memory()).await.unwrap();

    // Re-initialization without shutdown is refused.
    assert!(matches!(
        global::init(&ProviderConfig::memory()).await,
        Err(BusError::AlreadyInitialized)
    ));

    // The forwarders reach the installed bus.
    let (tx, mut rx) = mpsc::unbounded_channel();
    global::on(move |beat: Beat| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(beat.n);
            Ok(())
        }
    })
    .await
    .unwrap();
    global::publish(&Beat { n: 3 }).await.unwrap();
    assert_eq!(
        timeout(Duration::from_secs(1), rx.recv()).await.unwrap(),
        Some(3)
    );

    global::expose("lifecycle.echo", |(n,): (u32,)| async move {
        Ok::<_, Infallible>(n)
    })
    .await
    .unwrap();
    let echoed: u32 = global::rpc("lifecycle.echo", (9,)).await.unwrap();
    assert_eq!(echoed, 9);

    // Shutdown clears the installed bus and is idempotent.
    global::shutdown().await.unwrap();
    global::shutdown().await.unwrap();
    assert!(bus.is_closed());
    assert!(matches!(global::bus(), Err(BusError::NotInitialized)));

    // A fresh init works after shutdown.
    global::init(&ProviderConfig::memory()).await.unwrap();
    global::shutdown().await.unwrap();
}

#[tokio::test]
async fn test_close_releases_pending_rpc_waiter() {
    let bus = Bus::connect(&ProviderConfig::memory()).await.unwrap();

    let caller = bus.clone();
    let waiter = tokio::spawn(async move {
        // No responder and no deadline: only shutdown can release this.
        caller.rpc::<_, i64>("nobody.home", ()).await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    bus.close().await.unwrap();

    let released = timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter was not released")
        .unwrap();
    assert!(matches!(released, Err(BusError::Shutdown)));
}

#[tokio::test]
async fn test_close_is_idempotent_and_observable() {
    let bus = Bus::connect(&ProviderConfig::memory()).await.unwrap();
    assert!(!bus.is_closed());

    bus.close().await.unwrap();
    bus.close().await.unwrap();
    assert!(bus.is_closed());

    assert!(matches!(
        bus.publish(&Beat { n: 1 }).await,
        Err(BusError::Shutdown)
    ));
    assert!(matches!(
        bus.on(|_: Beat| async move { Ok(()) }).await,
        Err(BusError::Shutdown)
    ));
    assert!(matches!(
        bus.rpc::<_, i64>("x", ()).await,
        Err(BusError::Shutdown)
    ));
}

#[tokio::test]
async fn test_two_buses_are_independent() {
    let a = Bus::connect(&ProviderConfig::memory()).await.unwrap();
    let b = Bus::connect(&ProviderConfig::memory()).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    a.on(move |beat: Beat| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(beat.n);
            Ok(())
        }
    })
    .await
    .unwrap();

    // The memory transport has no cross-process (or cross-bus) visibility.
    b.publish(&Beat { n: 5 }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());

    b.close().await.unwrap();

    // Closing one bus leaves the other usable.
    a.publish(&Beat { n: 6 }).await.unwrap();
    assert_eq!(
        timeout(Duration::from_secs(1), rx.recv()).await.unwrap(),
        Some(6)
    );
    a.close().await.unwrap();
}
