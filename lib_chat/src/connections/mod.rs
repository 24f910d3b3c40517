//! # Connections Module
//!
//! Adapters for the upstream publish/subscribe bus the relay fans out from.

/// The `MessageBus` trait and its error type.
pub mod bus;
/// In-process bus for tests and single-node runs.
pub mod memory_bus;
/// Redis Pub/Sub bus.
#[cfg(feature = "connections")]
pub mod redis_bus;

pub use bus::{BusError, BusStream, MessageBus};
pub use memory_bus::MemoryBus;
#[cfg(feature = "connections")]
pub use redis_bus::RedisBus;
