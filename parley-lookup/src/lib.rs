//! Parley Lookup - Request Coalescing and Polling
//!
//! A [`RequestCoalescer`] fronts a pluggable [`LookupBackend`]:
//!
//! - concurrent fetches for one key share a single in-flight lookup
//! - terminal results (confirmed or failed) are served from cache until
//!   invalidated
//! - requests older than the confirmation threshold resolve as confirmed
//!   without a lookup
//! - failed lookups resolve to a pending placeholder built from the request
//! - [`RequestCoalescer::watch`] re-fetches pending results on an interval
//!   until they turn terminal, publishing each result to a
//!   [`PollSubscription`]
//!
//! Two HTTP backends ship with the crate: transaction receipts over JSON-RPC
//! and username profiles.

pub mod backend;
pub mod coalescer;
pub mod providers;
pub mod subscription;

pub use backend::{LookupBackend, Resolvable};
pub use coalescer::{CoalescerPolicy, CoalescerStats, RequestCoalescer};
pub use providers::{
    Profile, ProfileBody, ProfileLookup, ProfileRequest, TransactionReceipt, TransactionRequest,
    TransactionStatus, TransactionStatusLookup,
};
pub use subscription::PollSubscription;
