//! Parley Core - Shared Types
//!
//! Identity types, the wall clock abstraction, lookup status, the persisted
//! lease record, the error hierarchy and configuration. Every other crate in
//! the workspace depends on this one; it contains no I/O beyond reading a
//! configuration file.

pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod lease;
pub mod status;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CacheLimits, EndpointConfig, LeaseConfig, ParleyConfig, PollingConfig,
    DEFAULT_CONFIRMATION_THRESHOLD_MS, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_LEASE_SLOT,
    DEFAULT_LEASE_TIMEOUT_MS, DEFAULT_POLL_INTERVAL_MS,
};
pub use error::{
    ConfigError, LeaseError, LookupError, ParleyError, ParleyResult, StorageError,
    ValidationError,
};
pub use identity::{Address, ChainId, ConversationId, HolderId, MessageId, Timestamp, TxHash};
pub use lease::LeaseRecord;
pub use status::{LookupStatus, LookupStatusParseError};
