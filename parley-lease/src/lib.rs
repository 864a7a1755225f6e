//! Parley Lease - Cross-Process Exclusivity
//!
//! At most one of several cooperating processes may open the storage-backed
//! protocol client. The [`LeaseManager`] arbitrates through a single record
//! in a shared [`LeaseStore`](parley_storage::LeaseStore): the holder
//! refreshes the record's timestamp on a heartbeat, and a record whose age
//! exceeds the timeout is treated as abandoned and may be replaced.
//!
//! Storage errors never surface from the public operations. They are logged
//! and reported as "not held" or "not acquired".

mod heartbeat;
mod manager;
mod metrics;

pub use manager::{LeaseManager, LeaseObservation};
pub use metrics::{LeaseMetrics, LeaseMetricsSnapshot};
