//! Cross-process fan-out over a shared in-memory bus.
//!
//! Each `Fanout` stands for one server process with its own connection
//! registry; clones of one `MemoryBus` stand in for the shared Redis.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use pairchat_core::RoomId;
use pairchat_server::{
    BusError, ConnId, ConnectionRegistry, Delivery, Envelope, Fanout, FanoutBus, MemoryBus,
    fanout::EnvelopeStream,
};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

struct Process {
    fanout: Arc<Fanout>,
    registry: Arc<ConnectionRegistry>,
}

impl Process {
    async fn start(bus: Arc<dyn FanoutBus>, name: &str, cancel: &CancellationToken) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let fanout = Arc::new(Fanout::new(bus, Arc::clone(&registry), name));
        fanout.start(cancel.clone()).await;
        Self { fanout, registry }
    }

    fn connect(&self, room: &RoomId) -> (ConnId, UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = self.registry.next_conn_id();
        self.registry.join(conn, room, tx);
        (conn, rx)
    }
}

/// Drain everything that arrives within a short quiet period.
async fn drain(rx: &mut UnboundedReceiver<String>) -> Vec<String> {
    let mut got = Vec::new();
    while let Ok(Some(frame)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
        got.push(frame);
    }
    got
}

#[tokio::test]
async fn each_connection_receives_exactly_once_across_processes() {
    let bus = MemoryBus::default();
    let cancel = CancellationToken::new();
    let a = Process::start(Arc::new(bus.clone()), "process-a", &cancel).await;
    let b = Process::start(Arc::new(bus.clone()), "process-b", &cancel).await;

    let room = RoomId::from("room_shared");
    let (sender, mut sender_rx) = a.connect(&room);
    let (_, mut peer_a_rx) = a.connect(&room);
    let (_, mut peer_b_rx) = b.connect(&room);
    let (_, mut elsewhere_rx) = b.connect(&RoomId::from("room_other"));

    let delivery = a.fanout.broadcast(&room, "hello".to_string(), Some(sender)).await;
    assert_eq!(delivery, Delivery::Published);

    assert_eq!(drain(&mut peer_a_rx).await, ["hello"]);
    assert_eq!(drain(&mut peer_b_rx).await, ["hello"]);
    assert!(drain(&mut sender_rx).await.is_empty());
    assert!(drain(&mut elsewhere_rx).await.is_empty());

    cancel.cancel();
}

#[tokio::test]
async fn same_conn_id_in_another_process_is_not_excluded() {
    let bus = MemoryBus::default();
    let cancel = CancellationToken::new();
    let a = Process::start(Arc::new(bus.clone()), "process-a", &cancel).await;
    let b = Process::start(Arc::new(bus.clone()), "process-b", &cancel).await;

    // Both registries hand out conn-0 first.
    let room = RoomId::from("room_shared");
    let (sender, mut sender_rx) = a.connect(&room);
    let (twin, mut twin_rx) = b.connect(&room);
    assert_eq!(sender, twin);

    a.fanout.broadcast(&room, "ping".to_string(), Some(sender)).await;

    assert_eq!(drain(&mut twin_rx).await, ["ping"]);
    assert!(drain(&mut sender_rx).await.is_empty());

    cancel.cancel();
}

#[tokio::test]
async fn server_originated_broadcast_reaches_everyone() {
    let bus = MemoryBus::default();
    let cancel = CancellationToken::new();
    let a = Process::start(Arc::new(bus.clone()), "process-a", &cancel).await;
    let b = Process::start(Arc::new(bus.clone()), "process-b", &cancel).await;

    let room = RoomId::from("room_shared");
    let (_, mut a_rx) = a.connect(&room);
    let (_, mut b_rx) = b.connect(&room);

    b.fanout.broadcast(&room, r#"{"type":"new_message"}"#.to_string(), None).await;

    assert_eq!(drain(&mut a_rx).await.len(), 1);
    assert_eq!(drain(&mut b_rx).await.len(), 1);

    cancel.cancel();
}

#[tokio::test]
async fn closed_connections_are_pruned_on_delivery() {
    let cancel = CancellationToken::new();
    let a = Process::start(Arc::new(MemoryBus::default()), "process-a", &cancel).await;

    let room = RoomId::from("room_1");
    let (_, live_rx) = a.connect(&room);
    let (_, dead_rx) = a.connect(&room);
    drop(dead_rx);
    assert_eq!(a.registry.connection_count(&room), 2);

    let envelope = Envelope { room_id: room.clone(), origin: None, payload: "x".to_string() };
    assert_eq!(a.fanout.deliver(&envelope), 1);
    assert_eq!(a.registry.connection_count(&room), 1);

    drop(live_rx);
    assert_eq!(a.fanout.deliver(&envelope), 0);
    assert_eq!(a.registry.room_count(), 0);

    cancel.cancel();
}

#[tokio::test]
async fn leaving_stops_delivery() {
    let cancel = CancellationToken::new();
    let a = Process::start(Arc::new(MemoryBus::default()), "process-a", &cancel).await;

    let room = RoomId::from("room_1");
    let (conn, mut rx) = a.connect(&room);
    assert!(a.registry.leave(conn, &room));
    assert!(!a.registry.leave(conn, &room));

    a.fanout.broadcast(&room, "late".to_string(), None).await;
    assert!(drain(&mut rx).await.is_empty());

    cancel.cancel();
}

/// Bus whose first subscription ends immediately.
struct FlakyBus {
    inner: MemoryBus,
    subscriptions: AtomicUsize,
}

#[async_trait]
impl FanoutBus for FlakyBus {
    async fn publish(&self, envelope: &Envelope) -> Result<(), BusError> {
        self.inner.publish(envelope).await
    }

    async fn subscribe(&self) -> Result<EnvelopeStream, BusError> {
        if self.subscriptions.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(stream::empty().boxed());
        }
        self.inner.subscribe().await
    }
}

#[tokio::test(start_paused = true)]
async fn subscriber_recovers_after_the_stream_ends() {
    let bus =
        Arc::new(FlakyBus { inner: MemoryBus::default(), subscriptions: AtomicUsize::new(0) });
    let cancel = CancellationToken::new();
    let a = Process::start(bus.clone(), "process-a", &cancel).await;

    let room = RoomId::from("room_1");
    let (_, mut rx) = a.connect(&room);

    // Nobody is subscribed yet, so the publish fails and delivery stays local.
    let outage = a.fanout.broadcast(&room, "during".to_string(), None).await;
    assert_eq!(outage, Delivery::LocalFallback(1));
    assert_eq!(rx.recv().await.as_deref(), Some("during"));

    while bus.subscriptions.load(Ordering::SeqCst) < 2 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let restored = a.fanout.broadcast(&room, "after".to_string(), None).await;
    assert_eq!(restored, Delivery::Published);
    assert_eq!(rx.recv().await.as_deref(), Some("after"));

    cancel.cancel();
}
