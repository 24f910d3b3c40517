//! # Chat Frame
//!
//! The unit that flows from the upstream bus to every client. The engine never
//! interprets the payload beyond checking that it is a well-formed JSON
//! document; the bytes that went into the bus are the bytes each client gets.

use serde::de::IgnoredAny;
use std::sync::Arc;
use std::time::Instant;

use super::error::FrameError;

/// An immutable chat payload, shared by `Arc` between all delivery workers.
#[derive(Debug, Clone)]
pub struct ChatFrame {
    /// Position of this payload in the upstream sequence, starting at 1.
    pub seq: u64,
    /// When the engine pulled the payload off the bus.
    pub ts_library_in: Instant,
    /// The serialized message, forwarded verbatim.
    pub payload: Arc<str>,
}

impl ChatFrame {
    /// Builds a frame from a payload that is already known to be valid.
    pub fn new(seq: u64, payload: impl Into<Arc<str>>) -> Self {
        Self {
            seq,
            ts_library_in: Instant::now(),
            payload: payload.into(),
        }
    }

    /// Validates a raw upstream payload and wraps it.
    ///
    /// Rejects non UTF-8 input and anything that does not parse as a single
    /// JSON value. The original text is kept as is.
    pub fn decode(seq: u64, raw: &[u8]) -> Result<Self, FrameError> {
        let text = std::str::from_utf8(raw)?;
        serde_json::from_str::<IgnoredAny>(text)?;
        Ok(Self::new(seq, text))
    }

    /// Returns the payload as a string slice.
    pub fn as_str(&self) -> &str {
        &self.payload
    }
}
