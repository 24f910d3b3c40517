use std::time::Duration;
use thiserror::Error;

use crate::connections::BusError;

/// Why a single send to a single client did not go through.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("client connection is closed")]
    Closed,

    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    #[error("send failed: {0}")]
    Send(String),
}

/// An upstream payload the engine refuses to forward.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("payload is not valid UTF-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),

    #[error("payload is not a JSON document: {0}")]
    NotJson(#[from] serde_json::Error),
}

/// Terminal conditions of the broadcast engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("broadcast engine already started")]
    AlreadyStarted,

    #[error("failed to subscribe to upstream topic '{topic}': {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: BusError,
    },

    #[error("upstream subscription lost: {0}")]
    UpstreamLost(String),
}
