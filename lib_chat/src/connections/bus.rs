use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use thiserror::Error;

/// Custom error types for bus operations.
#[derive(Debug, Error, Clone)]
pub enum BusError {
    #[error("Failed to connect to bus: {0}")]
    ConnectionError(String),

    #[error("Publish failed: {0}")]
    PublishError(String),

    #[error("Subscribe failed: {0}")]
    SubscribeError(String),

    #[error("Subscription lost: {0}")]
    SubscriptionLost(String),
}

/// Live sequence of raw payloads for one topic. Ends when the subscription is gone.
pub type BusStream = BoxStream<'static, Result<Vec<u8>, BusError>>;

/// An ordered publish/subscribe channel keyed by topic name.
pub trait MessageBus: Send + Sync {
    /// Opens a subscription. Payloads published after this resolves are delivered
    /// in publish order.
    fn subscribe<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<BusStream, BusError>>;

    /// Publishes one payload to every current subscriber of `topic`.
    fn publish<'a>(&'a self, topic: &'a str, payload: Vec<u8>) -> BoxFuture<'a, Result<(), BusError>>;
}
