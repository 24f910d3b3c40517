//! # lib_chat
//!
//! Shared library for the chat relay. The `core` module holds the fan-out
//! broadcast engine and is always compiled; the other modules are gated by
//! cargo features the same way the binaries opt into them.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Client registry, delivery workers and the broadcast engine.
pub mod core;
/// Upstream bus adapters (memory always, Redis behind `connections`).
pub mod connections;
/// Inbound message schema validation.
#[cfg(feature = "validation")]
pub mod validation;

// Re-export the types every binary touches.
pub use crate::core::{
    attach, BroadcastEngine, ChatFrame, ClientId, ClientKey, ClientRegistry, ClientSink, DeliveryError,
    DeliveryOptions, EngineError, EngineStats,
};
pub use crate::connections::{BusError, BusStream, MemoryBus, MessageBus};
#[cfg(feature = "connections")]
pub use crate::connections::RedisBus;
