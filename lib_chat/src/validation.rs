//! # Inbound Validation
//!
//! Every message a client submits must be a JSON object with exactly two
//! string fields:
//!
//! | field    | length (characters) |
//! |----------|---------------------|
//! | `handle` | 3 ..= 25            |
//! | `text`   | 1 ..= 140           |
//!
//! Nothing else is allowed, and a field may appear only once: a document that
//! repeats `handle` or `text` is rejected rather than resolved to the last
//! value. Lengths count Unicode scalar values, not bytes.
//! A message that passes is published to the bus exactly as the client sent
//! it; the broadcast engine downstream does not re-check.

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::sync::Arc;
use thiserror::Error;

use crate::connections::{BusError, MessageBus};

/// Allowed length of `handle`.
pub const HANDLE_LEN: RangeInclusive<usize> = 3..=25;
/// Allowed length of `text`.
pub const TEXT_LEN: RangeInclusive<usize> = 1..=140;

/// A chat message as submitted by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatMessage {
    pub handle: String,
    pub text: String,
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("message is not a valid chat document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("field `{field}` must be {min} to {max} characters long, got {len}")]
    Length {
        field: &'static str,
        len: usize,
        min: usize,
        max: usize,
    },
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("failed to publish message: {0}")]
    Publish(#[from] BusError),
}

fn check_len(field: &'static str, value: &str, bounds: &RangeInclusive<usize>) -> Result<(), ValidationError> {
    let len = value.chars().count();
    if bounds.contains(&len) {
        Ok(())
    } else {
        Err(ValidationError::Length {
            field,
            len,
            min: *bounds.start(),
            max: *bounds.end(),
        })
    }
}

/// Checks `raw` against the message schema.
pub fn validate(raw: &str) -> Result<ChatMessage, ValidationError> {
    let message: ChatMessage = serde_json::from_str(raw)?;
    check_len("handle", &message.handle, &HANDLE_LEN)?;
    check_len("text", &message.text, &TEXT_LEN)?;
    Ok(message)
}

/// Validates client submissions and publishes the accepted ones.
pub struct InboundValidator {
    bus: Arc<dyn MessageBus>,
    topic: String,
}

impl InboundValidator {
    pub fn new(bus: Arc<dyn MessageBus>, topic: impl Into<String>) -> Self {
        Self { bus, topic: topic.into() }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Validates `raw` and, if it passes, publishes it verbatim.
    pub async fn submit(&self, raw: &str) -> Result<ChatMessage, SubmitError> {
        let message = validate(raw)?;
        self.bus.publish(&self.topic, raw.as_bytes().to_vec()).await?;
        log::info!("Inserting message from '{}': {}", message.handle, raw);
        Ok(message)
    }
}
