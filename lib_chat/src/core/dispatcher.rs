//! # Broadcast Engine
//!
//! The single consumer of the upstream chat topic. For every payload that
//! arrives it:
//!
//! 1.  **Validates the envelope**: non UTF-8 or non-JSON payloads are logged and
//!     skipped. Nothing else about the payload is inspected.
//! 2.  **Snapshots the registry**: one `Arc` clone, no lock held while
//!     iterating.
//! 3.  **Hands off without waiting**: each client mailbox gets an `Arc` of the
//!     same frame via `try_send`. A full mailbox marks a client that cannot keep
//!     up; it is evicted instead of being allowed to stall everyone else.
//!
//! Losing the upstream stream is terminal. The engine returns
//! `EngineError::UpstreamLost` and leaves recovery to whoever supervises the
//! process.

use futures_util::{Stream, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::error::EngineError;
use super::frame::ChatFrame;
use super::registry::ClientRegistry;
use crate::connections::{BusError, MessageBus};

/// Running counters of the engine. Shared, lock-free, readable any time.
#[derive(Debug, Default)]
pub struct EngineStats {
    received: AtomicU64,
    skipped: AtomicU64,
    handed_off: AtomicU64,
    evicted: AtomicU64,
}

/// Plain copy of `EngineStats` at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Payloads pulled from upstream, malformed ones included.
    pub received: u64,
    /// Malformed payloads dropped.
    pub skipped: u64,
    /// Successful mailbox hand-offs, summed over clients.
    pub handed_off: u64,
    /// Clients evicted because their mailbox was full.
    pub evicted: u64,
}

impl EngineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            handed_off: self.handed_off.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

/// Fans one upstream topic out to every registered client.
pub struct BroadcastEngine {
    registry: Arc<ClientRegistry>,
    topic: String,
    started: AtomicBool,
    stats: Arc<EngineStats>,
}

impl BroadcastEngine {
    pub fn new(registry: Arc<ClientRegistry>, topic: impl Into<String>) -> Self {
        Self {
            registry,
            topic: topic.into(),
            started: AtomicBool::new(false),
            stats: Arc::new(EngineStats::default()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    /// Subscribes to the configured topic and runs until `shutdown` fires or
    /// the subscription is lost.
    ///
    /// The subscription is opened once per engine. A second call fails with
    /// `EngineError::AlreadyStarted`, even after the first one returned.
    pub async fn start(&self, bus: &dyn MessageBus, shutdown: CancellationToken) -> Result<(), EngineError> {
        self.claim_start()?;
        log::info!("Subscribing to upstream topic '{}'", self.topic);
        let upstream = bus.subscribe(&self.topic).await.map_err(|source| EngineError::Subscribe {
            topic: self.topic.clone(),
            source,
        })?;
        self.consume(upstream, shutdown).await
    }

    /// Drives an already opened upstream stream. Counts as this engine's one start.
    pub async fn run<S>(&self, upstream: S, shutdown: CancellationToken) -> Result<(), EngineError>
    where
        S: Stream<Item = Result<Vec<u8>, BusError>> + Unpin,
    {
        self.claim_start()?;
        self.consume(upstream, shutdown).await
    }

    fn claim_start(&self) -> Result<(), EngineError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarted);
        }
        Ok(())
    }

    async fn consume<S>(&self, mut upstream: S, shutdown: CancellationToken) -> Result<(), EngineError>
    where
        S: Stream<Item = Result<Vec<u8>, BusError>> + Unpin,
    {
        log::info!("Broadcast engine running on topic '{}'", self.topic);
        let mut seq: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    log::info!("Broadcast engine stopping on shutdown request.");
                    return Ok(());
                }
                next = upstream.next() => next,
            };

            match next {
                Some(Ok(raw)) => {
                    seq += 1;
                    self.on_payload(seq, &raw);
                }
                Some(Err(e)) => {
                    log::error!("Upstream error on topic '{}': {}", self.topic, e);
                    return Err(EngineError::UpstreamLost(e.to_string()));
                }
                None => {
                    log::error!("Upstream stream for topic '{}' ended.", self.topic);
                    return Err(EngineError::UpstreamLost("stream ended".to_string()));
                }
            }
        }
    }

    fn on_payload(&self, seq: u64, raw: &[u8]) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        match ChatFrame::decode(seq, raw) {
            Ok(frame) => {
                log::trace!("Frame #{} received ({} bytes)", seq, frame.payload.len());
                self.broadcast(Arc::new(frame));
            }
            Err(e) => {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Skipping malformed upstream payload #{}: {}", seq, e);
            }
        }
    }

    /// Offers `frame` to every client in a fresh snapshot and returns how many
    /// accepted it. Never waits on a client.
    pub fn broadcast(&self, frame: Arc<ChatFrame>) -> usize {
        let snapshot = self.registry.snapshot();
        let mut accepted = 0;

        for client in snapshot.iter() {
            match client.offer(Arc::clone(&frame)) {
                Ok(()) => accepted += 1,
                Err(TrySendError::Full(_)) => {
                    if self.registry.deregister_entry(client.key()) {
                        self.stats.evicted.fetch_add(1, Ordering::Relaxed);
                        log::warn!("Evicting client {}: mailbox full at frame #{}", client.id(), frame.seq);
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    // Worker already gone; make sure the entry is too.
                    self.registry.deregister_entry(client.key());
                }
            }
        }

        self.stats.handed_off.fetch_add(accepted as u64, Ordering::Relaxed);
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::MemoryBus;
    use crate::core::delivery::{attach, ClientSink, DeliveryOptions};
    use crate::core::error::DeliveryError;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

    const TOPIC: &str = "chat";

    struct RecordingSink(UnboundedSender<String>);

    impl ClientSink for RecordingSink {
        async fn send(&mut self, payload: Arc<str>) -> Result<(), DeliveryError> {
            self.0.send(payload.to_string()).map_err(|e| DeliveryError::Send(e.to_string()))
        }
    }

    struct FailingSink(Arc<AtomicUsize>);

    impl ClientSink for FailingSink {
        async fn send(&mut self, _payload: Arc<str>) -> Result<(), DeliveryError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(DeliveryError::Closed)
        }
    }

    struct HangingSink;

    impl ClientSink for HangingSink {
        async fn send(&mut self, _payload: Arc<str>) -> Result<(), DeliveryError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn recorder(registry: &Arc<ClientRegistry>) -> (u64, UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = attach(Arc::clone(registry), RecordingSink(tx), DeliveryOptions::default());
        (client.id, rx)
    }

    async fn next(rx: &mut UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a delivery")
            .expect("sink channel closed")
    }

    async fn assert_silent(rx: &mut UnboundedReceiver<String>) {
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    /// Subscribes before spawning so nothing published afterwards is missed.
    async fn spawn_engine(
        bus: &MemoryBus,
        registry: &Arc<ClientRegistry>,
    ) -> (Arc<BroadcastEngine>, CancellationToken, tokio::task::JoinHandle<Result<(), EngineError>>) {
        let upstream = bus.subscribe(TOPIC).await.unwrap();
        let engine = Arc::new(BroadcastEngine::new(Arc::clone(registry), TOPIC));
        let shutdown = CancellationToken::new();
        let handle = {
            let engine = Arc::clone(&engine);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { engine.run(upstream, shutdown).await })
        };
        (engine, shutdown, handle)
    }

    #[tokio::test]
    async fn test_end_to_end_register_publish_deregister() {
        let bus = MemoryBus::new();
        let registry = Arc::new(ClientRegistry::new());
        let (_a, mut rx_a) = recorder(&registry);
        let (b, mut rx_b) = recorder(&registry);
        let (_c, mut rx_c) = recorder(&registry);
        let (_engine, shutdown, handle) = spawn_engine(&bus, &registry).await;

        let first = r#"{"handle":"alice","text":"hi"}"#;
        bus.publish(TOPIC, first.as_bytes().to_vec()).await.unwrap();
        for rx in [&mut rx_a, &mut rx_b, &mut rx_c] {
            assert_eq!(next(rx).await, first);
        }

        assert!(registry.deregister(b));
        let second = r#"{"handle":"carol","text":"bye"}"#;
        bus.publish(TOPIC, second.as_bytes().to_vec()).await.unwrap();
        assert_eq!(next(&mut rx_a).await, second);
        assert_eq!(next(&mut rx_c).await, second);

        // Exactly once each, and B saw nothing after removal.
        assert_silent(&mut rx_a).await;
        assert_silent(&mut rx_c).await;
        assert!(rx_b.try_recv().is_err());

        shutdown.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_per_client_order_follows_upstream() {
        let bus = MemoryBus::new();
        let registry = Arc::new(ClientRegistry::new());
        let (_id, mut rx) = recorder(&registry);
        let (_engine, shutdown, _handle) = spawn_engine(&bus, &registry).await;

        for n in 1..=30 {
            bus.publish(TOPIC, format!("{{\"n\":{}}}", n).into_bytes()).await.unwrap();
        }
        for n in 1..=30 {
            assert_eq!(next(&mut rx).await, format!("{{\"n\":{}}}", n));
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_failing_client_does_not_affect_others() {
        let bus = MemoryBus::new();
        let registry = Arc::new(ClientRegistry::new());
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = attach(Arc::clone(&registry), FailingSink(attempts.clone()), DeliveryOptions::default());
        let (_b, mut rx_b) = recorder(&registry);
        let (_engine, shutdown, _handle) = spawn_engine(&bus, &registry).await;

        const N: usize = 25;
        for n in 0..N {
            bus.publish(TOPIC, format!("[{}]", n).into_bytes()).await.unwrap();
        }
        for n in 0..N {
            assert_eq!(next(&mut rx_b).await, format!("[{}]", n));
        }

        a.task.await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(!registry.contains(a.id));
        assert_eq!(registry.len(), 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_malformed_payload_is_skipped() {
        let bus = MemoryBus::new();
        let registry = Arc::new(ClientRegistry::new());
        let (_a, mut rx_a) = recorder(&registry);
        let (_b, mut rx_b) = recorder(&registry);
        let (engine, shutdown, handle) = spawn_engine(&bus, &registry).await;

        bus.publish(TOPIC, br#"{"handle":"alice","text":"one"}"#.to_vec()).await.unwrap();
        bus.publish(TOPIC, b"{not json".to_vec()).await.unwrap();
        bus.publish(TOPIC, vec![0xc3, 0x28]).await.unwrap();
        bus.publish(TOPIC, br#"{"handle":"alice","text":"two"}"#.to_vec()).await.unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            assert_eq!(next(rx).await, r#"{"handle":"alice","text":"one"}"#);
            assert_eq!(next(rx).await, r#"{"handle":"alice","text":"two"}"#);
        }

        let stats = engine.stats().snapshot();
        assert_eq!(stats.received, 4);
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.handed_off, 4);
        assert!(!handle.is_finished());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_upstream_loss_is_fatal() {
        let bus = MemoryBus::new();
        let registry = Arc::new(ClientRegistry::new());
        let (_engine, _shutdown, handle) = spawn_engine(&bus, &registry).await;

        assert!(bus.close_topic(TOPIC));
        let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(matches!(result, Err(EngineError::UpstreamLost(_))));
    }

    #[tokio::test]
    async fn test_upstream_error_item_is_fatal() {
        let registry = Arc::new(ClientRegistry::new());
        let engine = BroadcastEngine::new(registry, TOPIC);
        let upstream = futures_util::stream::iter(vec![
            Ok(b"{}".to_vec()),
            Err(BusError::SubscriptionLost("connection reset".to_string())),
            Ok(b"{}".to_vec()),
        ]);

        let result = engine.run(upstream, CancellationToken::new()).await;
        assert!(matches!(result, Err(EngineError::UpstreamLost(msg)) if msg.contains("connection reset")));
        assert_eq!(engine.stats().snapshot().received, 1);
    }

    #[tokio::test]
    async fn test_engine_starts_once() {
        let bus = Arc::new(MemoryBus::new());
        let registry = Arc::new(ClientRegistry::new());
        let engine = Arc::new(BroadcastEngine::new(registry, TOPIC));
        let shutdown = CancellationToken::new();

        let first = {
            let (engine, bus, shutdown) = (Arc::clone(&engine), Arc::clone(&bus), shutdown.clone());
            tokio::spawn(async move { engine.start(bus.as_ref(), shutdown).await })
        };
        while bus.subscriber_count(TOPIC) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let second = engine.start(bus.as_ref(), shutdown.clone()).await;
        assert!(matches!(second, Err(EngineError::AlreadyStarted)));
        assert_eq!(bus.subscriber_count(TOPIC), 1);

        shutdown.cancel();
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_slow_client_is_evicted_without_stalling_others() {
        let bus = MemoryBus::new();
        let registry = Arc::new(ClientRegistry::new());
        let options = DeliveryOptions { send_timeout: Duration::from_secs(60), mailbox_capacity: 2 };
        let slow = attach(Arc::clone(&registry), HangingSink, options);
        let (_fast, mut rx_fast) = recorder(&registry);
        let (engine, shutdown, _handle) = spawn_engine(&bus, &registry).await;

        for n in 0..10 {
            bus.publish(TOPIC, format!("{}", n).into_bytes()).await.unwrap();
        }
        for n in 0..10 {
            assert_eq!(next(&mut rx_fast).await, format!("{}", n));
        }

        tokio::time::timeout(Duration::from_secs(5), slow.task).await.unwrap().unwrap();
        assert!(!registry.contains(slow.id));
        assert_eq!(engine.stats().snapshot().evicted, 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_hanging_client_times_out_while_others_receive() {
        let bus = MemoryBus::new();
        let registry = Arc::new(ClientRegistry::new());
        let options = DeliveryOptions { send_timeout: Duration::from_millis(50), mailbox_capacity: 64 };
        let hung = attach(Arc::clone(&registry), HangingSink, options);
        let (_ok, mut rx_ok) = recorder(&registry);
        let (_engine, shutdown, _handle) = spawn_engine(&bus, &registry).await;

        bus.publish(TOPIC, b"\"ping\"".to_vec()).await.unwrap();
        assert_eq!(next(&mut rx_ok).await, "\"ping\"");

        tokio::time::timeout(Duration::from_secs(5), hung.task).await.unwrap().unwrap();
        assert!(!registry.contains(hung.id));

        bus.publish(TOPIC, b"\"pong\"".to_vec()).await.unwrap();
        assert_eq!(next(&mut rx_ok).await, "\"pong\"");
        shutdown.cancel();
    }
}
