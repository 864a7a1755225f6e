//! Parley Client - Composition Root
//!
//! Wires the workspace together for a running client:
//!
//! - [`ClientContext`] acquires the exclusivity lease and owns all state
//! - [`MessageStore`] keeps recently viewed conversations in memory
//! - [`UsernameStore`] caches resolved usernames behind the profile lookup
//! - [`telemetry`] installs the `tracing` subscriber for the binary

pub mod context;
pub mod stores;
pub mod telemetry;

pub use context::ClientContext;
pub use stores::{short_address, ChatMessage, MessageStore, UsernameStore};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
