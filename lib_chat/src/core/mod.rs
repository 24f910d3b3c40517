//! # Core Engine Module
//!
//! The heart of the chat relay. It aggregates everything needed to take one
//! ordered upstream sequence of chat payloads and fan it out to a changing set
//! of connected clients.
//!
//! ## Core Components:
//!
//! - **`registry`**: The live client set. Writers swap a copy-on-write map
//!   under a short lock; the broadcaster iterates an `Arc` snapshot without
//!   holding any lock.
//!
//! - **`delivery`**: One worker per client. It drains that client's bounded
//!   mailbox in order, sends with a timeout, and deregisters the client on the
//!   first failure.
//!
//! - **`dispatcher`**: The `BroadcastEngine`. Owns the single upstream
//!   subscription, skips malformed payloads, and hands every frame to each
//!   client mailbox without ever awaiting a client.
//!
//! - **`frame`**: The immutable, `Arc`-shared payload that flows through the
//!   engine.

/// Immutable chat payload shared across all deliveries.
pub mod frame;
/// Error types for delivery and the engine.
pub mod error;
/// The synchronized, copy-on-write client registry.
pub mod registry;
/// Per-client delivery workers and the `ClientSink` transport boundary.
pub mod delivery;
/// The broadcast engine driving the upstream subscription.
pub mod dispatcher;

// --- Public API Re-exports ---
pub use frame::ChatFrame;
pub use error::{DeliveryError, EngineError, FrameError};
pub use registry::{ClientEntry, ClientId, ClientKey, ClientRegistry, Snapshot};
pub use delivery::{attach, deliver, AttachedClient, ClientSink, DeliveryOptions};
pub use dispatcher::{BroadcastEngine, EngineStats, StatsSnapshot};
