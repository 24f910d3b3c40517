//! # Memory Bus
//!
//! A `MessageBus` backed by one `tokio::sync::broadcast` channel per topic.
//! It keeps the same contract as Redis Pub/Sub: publishing with nobody
//! listening succeeds, and subscribers only see what is published after they
//! subscribed. A subscriber that falls more than `capacity` payloads behind
//! skips the overflow with a warning.

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};

use super::bus::{BusError, BusStream, MessageBus};

const DEFAULT_CAPACITY: usize = 1024;

type Payload = Arc<[u8]>;

pub struct MemoryBus {
    topics: Mutex<HashMap<String, broadcast::Sender<Payload>>>,
    capacity: usize,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Payload> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Drops the topic. Every open subscription on it ends, which is how tests
    /// simulate a lost upstream connection. Returns whether the topic existed.
    pub fn close_topic(&self, topic: &str) -> bool {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics.remove(topic).is_some()
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics.get(topic).map_or(0, |tx| tx.receiver_count())
    }
}

impl MessageBus for MemoryBus {
    fn subscribe<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<BusStream, BusError>> {
        let rx = self.sender(topic).subscribe();
        let topic = topic.to_string();

        let stream = futures_util::stream::unfold((rx, topic), |(mut rx, topic)| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((Ok(payload.to_vec()), (rx, topic))),
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Memory bus subscriber on '{}' lagged, {} payloads skipped", topic, skipped);
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });

        futures_util::future::ready(Ok(stream.boxed())).boxed()
    }

    fn publish<'a>(&'a self, topic: &'a str, payload: Vec<u8>) -> BoxFuture<'a, Result<(), BusError>> {
        // No receivers is not an error, same as PUBLISH returning 0.
        let _ = self.sender(topic).send(Payload::from(payload));
        futures_util::future::ready(Ok(())).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers_in_order() {
        let bus = MemoryBus::new();
        let mut first = bus.subscribe("chat").await.unwrap();
        let mut second = bus.subscribe("chat").await.unwrap();
        assert_eq!(bus.subscriber_count("chat"), 2);

        bus.publish("chat", b"one".to_vec()).await.unwrap();
        bus.publish("chat", b"two".to_vec()).await.unwrap();

        for stream in [&mut first, &mut second] {
            assert_eq!(stream.next().await.unwrap().unwrap(), b"one".to_vec());
            assert_eq!(stream.next().await.unwrap().unwrap(), b"two".to_vec());
        }
    }

    #[tokio::test]
    async fn test_topics_are_independent() {
        let bus = MemoryBus::new();
        let mut chat = bus.subscribe("chat").await.unwrap();
        bus.publish("other", b"x".to_vec()).await.unwrap();
        bus.publish("chat", b"y".to_vec()).await.unwrap();
        assert_eq!(chat.next().await.unwrap().unwrap(), b"y".to_vec());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = MemoryBus::new();
        assert!(bus.publish("chat", b"nobody".to_vec()).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_topic_ends_subscriptions() {
        let bus = MemoryBus::new();
        let mut chat = bus.subscribe("chat").await.unwrap();
        assert!(bus.close_topic("chat"));
        assert!(!bus.close_topic("chat"));
        assert!(chat.next().await.is_none());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_overflow() {
        let bus = MemoryBus::with_capacity(2);
        let mut chat = bus.subscribe("chat").await.unwrap();
        for n in 0..5u8 {
            bus.publish("chat", vec![n]).await.unwrap();
        }
        // Capacity 2 keeps only the two newest payloads.
        assert_eq!(chat.next().await.unwrap().unwrap(), vec![3]);
        assert_eq!(chat.next().await.unwrap().unwrap(), vec![4]);
    }
}
