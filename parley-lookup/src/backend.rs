//! Lookup backend trait.

use async_trait::async_trait;
use parley_core::{LookupStatus, ParleyResult, Timestamp};
use std::fmt::Debug;
use std::hash::Hash;

/// A lookup result that carries a status.
pub trait Resolvable: Clone + Send + Sync + 'static {
    fn status(&self) -> LookupStatus;
}

/// A remote source of lookup results.
///
/// The coalescer owns caching, deduplication and failure handling; a backend
/// only performs one lookup per call and never retries.
#[async_trait]
pub trait LookupBackend: Send + Sync + 'static {
    /// Caller-supplied data: identity plus whatever is known locally.
    type Request: Clone + Send + Sync + 'static;
    /// Deduplication key derived from a request.
    type Key: Clone + Eq + Hash + Debug + Send + Sync + 'static;
    /// What the remote side returns.
    type Fetched: Send + 'static;
    /// What callers receive.
    type Output: Resolvable;

    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    fn key(&self, request: &Self::Request) -> Self::Key;

    /// When the looked-up item was created, if the request knows.
    fn created_at(&self, _request: &Self::Request) -> Option<Timestamp> {
        None
    }

    async fn lookup(&self, request: &Self::Request) -> ParleyResult<Self::Fetched>;

    /// Combine fetched fields with the request. Identity and metadata from
    /// the request always win.
    fn merge(&self, request: &Self::Request, fetched: Self::Fetched) -> Self::Output;

    /// Build a result from the request alone.
    fn synthesize(&self, request: &Self::Request, status: LookupStatus) -> Self::Output;
}
