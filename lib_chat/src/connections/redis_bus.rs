//! # Redis Pub/Sub Bus
//!
//! Publishing goes through a `ConnectionManager`, which reconnects on its own
//! between publishes. Each subscription gets its own dedicated async pub/sub
//! connection; when that connection drops the stream ends and the consumer
//! decides what happens next (the broadcast engine treats it as fatal).

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use super::bus::{BusError, BusStream, MessageBus};

/// A handler for Redis Pub/Sub interactions.
pub struct RedisBus {
    /// The internal Redis client instance, used to open subscriber connections.
    client: Client,
    /// Shared connection for PUBLISH.
    publisher: ConnectionManager,
}

impl RedisBus {
    /// Connects to Redis.
    ///
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://127.0.0.1/").
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = Client::open(url).map_err(|e| BusError::ConnectionError(e.to_string()))?;
        let publisher = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;
        log::info!("Connected to Redis at {}", mask_url_password(url));
        Ok(Self { client, publisher })
    }
}

impl MessageBus for RedisBus {
    fn subscribe<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<BusStream, BusError>> {
        async move {
            let mut pubsub = self
                .client
                .get_async_pubsub()
                .await
                .map_err(|e| BusError::SubscribeError(e.to_string()))?;
            pubsub
                .subscribe(topic)
                .await
                .map_err(|e| BusError::SubscribeError(e.to_string()))?;
            log::info!("Subscribed to Redis channel '{}'", topic);

            let stream = pubsub
                .into_on_message()
                .map(|msg| Ok(msg.get_payload_bytes().to_vec()));
            Ok(stream.boxed())
        }
        .boxed()
    }

    fn publish<'a>(&'a self, topic: &'a str, payload: Vec<u8>) -> BoxFuture<'a, Result<(), BusError>> {
        async move {
            let mut conn = self.publisher.clone();
            let receivers: i64 = conn
                .publish(topic, payload)
                .await
                .map_err(|e| BusError::PublishError(e.to_string()))?;
            log::trace!("Published to '{}', {} receiver(s)", topic, receivers);
            Ok(())
        }
        .boxed()
    }
}

/// Hides the password part of a connection URL for logging.
pub fn mask_url_password(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            let userinfo = &url[scheme_end + 3..at];
            match userinfo.find(':') {
                Some(colon) => format!("{}{}:*****{}", &url[..scheme_end + 3], &userinfo[..colon], &url[at..]),
                None => url.to_string(),
            }
        }
        _ => url.to_string(),
    }
}
