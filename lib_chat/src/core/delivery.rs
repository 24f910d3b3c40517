//! # Delivery Workers
//!
//! Every registered client gets one worker task and one bounded mailbox. The
//! engine only ever `try_send`s into the mailbox; the worker drains it in FIFO
//! order, so a client sees frames in upstream order no matter how slow it is.
//!
//! A failed send (closed, error, timeout) deregisters the client exactly once
//! and ends the worker. Nothing is retried and nothing is reported back to the
//! engine.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::DeliveryError;
use super::frame::ChatFrame;
use super::registry::{ClientEntry, ClientId, ClientKey, ClientRegistry};

/// The outbound half of one client connection.
pub trait ClientSink: Send + 'static {
    /// Writes one payload to the client.
    fn send(&mut self, payload: Arc<str>) -> impl Future<Output = Result<(), DeliveryError>> + Send;

    /// Whether the transport already knows the peer is gone.
    fn is_closed(&self) -> bool {
        false
    }

    /// Called once when the worker stops, whatever the reason.
    fn close(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Tuning for delivery workers.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryOptions {
    /// Upper bound on a single send. A half-open connection cannot hold a
    /// worker longer than this.
    pub send_timeout: Duration,
    /// Frames that may wait in a client's mailbox before the client is
    /// considered too slow and evicted.
    pub mailbox_capacity: usize,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            mailbox_capacity: 64,
        }
    }
}

/// A client that has been registered and has a running worker.
#[derive(Debug)]
pub struct AttachedClient {
    pub id: ClientId,
    /// This registration; removing by key never touches a later re-registration.
    pub key: ClientKey,
    pub task: JoinHandle<()>,
}

/// Registers `sink` as a new client and spawns its delivery worker.
///
/// The client is part of the very next broadcast once this returns.
pub fn attach<S: ClientSink>(registry: Arc<ClientRegistry>, sink: S, options: DeliveryOptions) -> AttachedClient {
    let id = registry.next_id();
    let (tx, rx) = mpsc::channel(options.mailbox_capacity.max(1));
    let cancel = CancellationToken::new();

    let entry = ClientEntry::new(id, tx, cancel.clone());
    let key = entry.key();
    registry.register(entry);
    log::info!("Client {} attached (mailbox {}, send timeout {:?})", id, options.mailbox_capacity, options.send_timeout);

    let task = tokio::spawn(run_worker(registry, key, sink, rx, cancel, options.send_timeout));
    AttachedClient { id, key, task }
}

/// One send of one frame to one client.
///
/// On failure the registration `key` is removed from `registry`; only the
/// call that wins the removal logs it.
pub async fn deliver<S: ClientSink>(
    registry: &ClientRegistry,
    key: ClientKey,
    sink: &mut S,
    frame: &ChatFrame,
    send_timeout: Duration,
) -> Result<(), DeliveryError> {
    let outcome = if sink.is_closed() {
        Err(DeliveryError::Closed)
    } else {
        match tokio::time::timeout(send_timeout, sink.send(Arc::clone(&frame.payload))).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(send_timeout)),
        }
    };

    match &outcome {
        Ok(()) => log::trace!("Frame #{} delivered to client {}", frame.seq, key.id),
        Err(e) => {
            if registry.deregister_entry(key) {
                log::warn!("Dropping client {} at frame #{}: {}", key.id, frame.seq, e);
            }
        }
    }
    outcome
}

async fn run_worker<S: ClientSink>(
    registry: Arc<ClientRegistry>,
    key: ClientKey,
    mut sink: S,
    mut mailbox: mpsc::Receiver<Arc<ChatFrame>>,
    cancel: CancellationToken,
    send_timeout: Duration,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = mailbox.recv() => match next {
                Some(frame) => frame,
                None => break,
            },
        };

        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            outcome = deliver(&registry, key, &mut sink, &frame, send_timeout) => outcome,
        };
        if attempt.is_err() {
            break;
        }
    }

    // Covers the exits that did not go through a failed send. If the id was
    // re-registered meanwhile, the newer entry stays.
    registry.deregister_entry(key);
    mailbox.close();
    if tokio::time::timeout(send_timeout, sink.close()).await.is_err() {
        log::debug!("Client {} did not close within {:?}", key.id, send_timeout);
    }
    log::info!("Delivery worker for client {} stopped", key.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc::UnboundedSender;

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
            Err(DeliveryError::Send("broken pipe".to_string()))
        }
    }

    struct HangingSink;

    impl ClientSink for HangingSink {
        async fn send(&mut self, _payload: Arc<str>) -> Result<(), DeliveryError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct ClosedSink {
        sends: Arc<AtomicUsize>,
        closed_called: Arc<AtomicBool>,
    }

    impl ClientSink for ClosedSink {
        async fn send(&mut self, _payload: Arc<str>) -> Result<(), DeliveryError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_closed(&self) -> bool {
            true
        }

        async fn close(&mut self) {
            self.closed_called.store(true, Ordering::SeqCst);
        }
    }

    fn register_plain(registry: &ClientRegistry) -> (ClientKey, mpsc::Receiver<Arc<ChatFrame>>) {
        let (tx, rx) = mpsc::channel(1);
        let entry = ClientEntry::new(registry.next_id(), tx, CancellationToken::new());
        let key = entry.key();
        registry.register(entry);
        (key, rx)
    }

    #[tokio::test]
    async fn test_deliver_success_leaves_client_registered() {
        let registry = ClientRegistry::new();
        let (key, _mailbox) = register_plain(&registry);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = RecordingSink(tx);

        let frame = ChatFrame::new(1, r#"{"handle":"bob","text":"yo"}"#);
        deliver(&registry, key, &mut sink, &frame, Duration::from_secs(1)).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), r#"{"handle":"bob","text":"yo"}"#);
        assert!(registry.contains(key.id));
    }

    #[tokio::test]
    async fn test_deliver_failure_deregisters() {
        let registry = ClientRegistry::new();
        let (key, _mailbox) = register_plain(&registry);
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut sink = FailingSink(attempts.clone());

        let err = deliver(&registry, key, &mut sink, &ChatFrame::new(1, "{}"), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert_eq!(err, DeliveryError::Send("broken pipe".to_string()));
        assert!(!registry.contains(key.id));
        // A second failure is harmless.
        assert!(deliver(&registry, key, &mut sink, &ChatFrame::new(2, "{}"), Duration::from_secs(1)).await.is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_deliver_times_out_hanging_send() {
        let registry = ClientRegistry::new();
        let (key, _mailbox) = register_plain(&registry);
        let timeout = Duration::from_millis(50);

        let err = deliver(&registry, key, &mut HangingSink, &ChatFrame::new(1, "{}"), timeout)
            .await
            .unwrap_err();

        assert_eq!(err, DeliveryError::Timeout(timeout));
        assert!(!registry.contains(key.id));
    }

    #[tokio::test]
    async fn test_closed_client_is_never_sent_to() {
        let registry = Arc::new(ClientRegistry::new());
        let sends = Arc::new(AtomicUsize::new(0));
        let closed_called = Arc::new(AtomicBool::new(false));
        let sink = ClosedSink { sends: sends.clone(), closed_called: closed_called.clone() };

        let client = attach(registry.clone(), sink, DeliveryOptions::default());
        let entry = registry.snapshot().iter().next().cloned().unwrap();
        entry.offer(Arc::new(ChatFrame::new(1, "{}"))).unwrap();

        client.task.await.unwrap();
        assert_eq!(sends.load(Ordering::SeqCst), 0);
        assert!(closed_called.load(Ordering::SeqCst));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_worker_preserves_order() {
        let registry = Arc::new(ClientRegistry::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = attach(registry.clone(), RecordingSink(tx), DeliveryOptions::default());

        let entry = registry.snapshot().iter().next().cloned().unwrap();
        for seq in 1..=20 {
            entry.offer(Arc::new(ChatFrame::new(seq, format!("{{\"n\":{}}}", seq)))).unwrap();
        }
        for seq in 1..=20 {
            assert_eq!(rx.recv().await.unwrap(), format!("{{\"n\":{}}}", seq));
        }

        assert!(registry.deregister(client.id));
        client.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_stops_after_first_failure() {
        let registry = Arc::new(ClientRegistry::new());
        let attempts = Arc::new(AtomicUsize::new(0));
        let client = attach(registry.clone(), FailingSink(attempts.clone()), DeliveryOptions::default());

        let entry = registry.snapshot().iter().next().cloned().unwrap();
        for seq in 1..=5 {
            let _ = entry.offer(Arc::new(ChatFrame::new(seq, "{}")));
        }

        client.task.await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(!registry.contains(client.id));
    }

    #[tokio::test]
    async fn test_deregistration_cancels_in_flight_send() {
        let registry = Arc::new(ClientRegistry::new());
        let options = DeliveryOptions { send_timeout: Duration::from_secs(60), mailbox_capacity: 4 };
        let client = attach(registry.clone(), HangingSink, options);

        let entry = registry.snapshot().iter().next().cloned().unwrap();
        entry.offer(Arc::new(ChatFrame::new(1, "{}"))).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(registry.deregister(client.id));
        tokio::time::timeout(Duration::from_secs(5), client.task)
            .await
            .expect("worker should stop promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn test_retired_worker_leaves_replacement_registered() {
        let registry = Arc::new(ClientRegistry::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = attach(registry.clone(), RecordingSink(tx), DeliveryOptions::default());

        let (mailbox, _replacement_rx) = mpsc::channel(1);
        let replacement_token = CancellationToken::new();
        let replacement = ClientEntry::new(client.id, mailbox, replacement_token.clone());
        registry.register(replacement);

        // The old worker was retired by the re-registration and exits.
        client.task.await.unwrap();

        assert!(registry.contains(client.id));
        assert_ne!(registry.snapshot().iter().next().unwrap().key(), client.key);
        assert!(!replacement_token.is_cancelled());
    }
}
