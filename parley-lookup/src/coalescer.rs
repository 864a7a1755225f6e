//! [`RequestCoalescer`] implementation.
//!
//! Per key, the coalescer holds at most one cached result and at most one
//! in-flight lookup. The in-flight lookup runs on its own task and does its
//! own bookkeeping when it finishes, so it completes even if every caller
//! waiting on it goes away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parley_core::{
    Clock, LookupError, LookupStatus, ParleyResult, PollingConfig, SystemClock,
};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::backend::{LookupBackend, Resolvable};
use crate::subscription::PollSubscription;

type Flight<T> = Shared<BoxFuture<'static, T>>;

/// Timing policy of a coalescer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoalescerPolicy {
    /// Delay between re-fetches of a pending result.
    pub poll_interval: Duration,
    /// Requests created longer ago than this resolve as confirmed without a
    /// lookup. `None` disables the shortcut.
    pub confirmation_threshold: Option<Duration>,
}

impl Default for CoalescerPolicy {
    fn default() -> Self {
        Self::from(&PollingConfig::default())
    }
}

impl From<&PollingConfig> for CoalescerPolicy {
    fn from(config: &PollingConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            confirmation_threshold: config.confirmation_threshold(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    lookups: AtomicU64,
    coalesced: AtomicU64,
    cache_hits: AtomicU64,
    synthesized_confirmations: AtomicU64,
    failures: AtomicU64,
    polls: AtomicU64,
}

fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Snapshot of coalescer activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoalescerStats {
    /// Lookups actually issued to the backend
    pub lookups: u64,
    /// Fetches that joined an in-flight lookup
    pub coalesced: u64,
    /// Fetches served from a cached terminal result
    pub cache_hits: u64,
    /// Fetches resolved by the confirmation threshold
    pub synthesized_confirmations: u64,
    /// Lookups that failed and fell back to a pending placeholder
    pub failures: u64,
    /// Polling re-fetches
    pub polls: u64,
    pub cached_results: usize,
    pub in_flight: usize,
}

struct State<B: LookupBackend> {
    results: HashMap<B::Key, B::Output>,
    in_flight: HashMap<B::Key, Flight<B::Output>>,
}

struct Inner<B: LookupBackend> {
    backend: B,
    clock: Arc<dyn Clock>,
    policy: CoalescerPolicy,
    state: Mutex<State<B>>,
    counters: Counters,
}

enum Begin<T> {
    Ready(T),
    Wait(Flight<T>),
}

/// Single-flight cache of lookups against one backend.
///
/// Clones share the same cache.
pub struct RequestCoalescer<B: LookupBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: LookupBackend> Clone for RequestCoalescer<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: LookupBackend> RequestCoalescer<B> {
    pub fn new(backend: B, policy: CoalescerPolicy) -> Self {
        Self::with_clock(backend, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(backend: B, policy: CoalescerPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                clock,
                policy,
                state: Mutex::new(State {
                    results: HashMap::new(),
                    in_flight: HashMap::new(),
                }),
                counters: Counters::default(),
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub fn policy(&self) -> CoalescerPolicy {
        self.inner.policy
    }

    /// Resolve `request`.
    ///
    /// In order: a cached terminal result is returned as is; a request older
    /// than the confirmation threshold resolves as confirmed; an in-flight
    /// lookup for the key is joined; otherwise a new lookup is issued. A
    /// failed lookup yields a pending result built from the request.
    ///
    /// Must be called within a tokio runtime.
    pub async fn fetch(&self, request: B::Request) -> B::Output {
        match self.begin(request) {
            Begin::Ready(output) => output,
            Begin::Wait(flight) => flight.await,
        }
    }

    /// Drop the cached result for `key`, so the next fetch looks it up again.
    /// An in-flight lookup is unaffected. Returns whether a result was cached.
    pub fn invalidate(&self, key: &B::Key) -> bool {
        self.inner.lock_state().results.remove(key).is_some()
    }

    /// Drop every cached result.
    pub fn clear(&self) {
        self.inner.lock_state().results.clear();
    }

    /// Cached result for `key`, terminal or not.
    pub fn cached(&self, key: &B::Key) -> Option<B::Output> {
        self.inner.lock_state().results.get(key).cloned()
    }

    pub fn is_in_flight(&self, key: &B::Key) -> bool {
        self.inner.lock_state().in_flight.contains_key(key)
    }

    /// Fetch `request`, then keep re-fetching on the poll interval while the
    /// result is pending. Every result is published to the returned
    /// subscription; polling stops at the first terminal result or when the
    /// subscription is dropped.
    pub fn watch(&self, request: B::Request) -> PollSubscription<B::Output> {
        let (tx, rx) = watch::channel(None);
        let task = tokio::spawn(self.clone().poll_until_terminal(request, tx));
        PollSubscription::new(rx, task)
    }

    pub fn stats(&self) -> CoalescerStats {
        let c = &self.inner.counters;
        let (cached_results, in_flight) = {
            let state = self.inner.lock_state();
            (state.results.len(), state.in_flight.len())
        };
        CoalescerStats {
            lookups: c.lookups.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            synthesized_confirmations: c.synthesized_confirmations.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            polls: c.polls.load(Ordering::Relaxed),
            cached_results,
            in_flight,
        }
    }

    fn begin(&self, request: B::Request) -> Begin<B::Output> {
        let inner = &self.inner;
        let key = inner.backend.key(&request);
        let mut state = inner.lock_state();

        if let Some(cached) = state.results.get(&key) {
            if cached.status().is_terminal() {
                incr(&inner.counters.cache_hits);
                tracing::trace!(backend = inner.backend.name(), key = ?key, "Cached terminal result");
                return Begin::Ready(cached.clone());
            }
        }

        if inner.past_confirmation_threshold(&request) {
            let output = inner.backend.synthesize(&request, LookupStatus::Confirmed);
            state.results.insert(key.clone(), output.clone());
            incr(&inner.counters.synthesized_confirmations);
            tracing::debug!(
                backend = inner.backend.name(),
                key = ?key,
                "Request older than confirmation threshold, assuming confirmed"
            );
            return Begin::Ready(output);
        }

        if let Some(flight) = state.in_flight.get(&key) {
            incr(&inner.counters.coalesced);
            tracing::trace!(backend = inner.backend.name(), key = ?key, "Joining in-flight lookup");
            return Begin::Wait(flight.clone());
        }

        let flight = Inner::launch(Arc::clone(inner), key.clone(), request);
        state.in_flight.insert(key, flight.clone());
        incr(&inner.counters.lookups);
        Begin::Wait(flight)
    }

    async fn poll_until_terminal(
        self,
        request: B::Request,
        tx: watch::Sender<Option<B::Output>>,
    ) {
        let name = self.inner.backend.name();
        let key = self.inner.backend.key(&request);
        let period = self.inner.policy.poll_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut output = self.fetch(request.clone()).await;
        loop {
            let status = output.status();
            if tx.send(Some(output)).is_err() {
                tracing::debug!(backend = name, key = ?key, "Poll subscriber gone, stopping");
                return;
            }
            if status.is_terminal() {
                tracing::debug!(backend = name, key = ?key, status = %status, "Polling finished");
                return;
            }

            ticker.tick().await;
            incr(&self.inner.counters.polls);
            self.invalidate(&key);
            output = self.fetch(request.clone()).await;
        }
    }
}

impl<B: LookupBackend> Inner<B> {
    fn lock_state(&self) -> MutexGuard<'_, State<B>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn past_confirmation_threshold(&self, request: &B::Request) -> bool {
        let (Some(threshold), Some(created_at)) =
            (self.policy.confirmation_threshold, self.backend.created_at(request))
        else {
            return false;
        };
        let age = (self.clock.now() - created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        age > threshold
    }

    /// Spawn the lookup and return the shared handle callers wait on.
    fn launch(inner: Arc<Self>, key: B::Key, request: B::Request) -> Flight<B::Output> {
        let task = {
            let inner = Arc::clone(&inner);
            let key = key.clone();
            let request = request.clone();
            tokio::spawn(async move {
                let outcome = inner.backend.lookup(&request).await;
                inner.complete(key, &request, outcome)
            })
        };

        async move {
            match task.await {
                Ok(output) => output,
                Err(e) => {
                    tracing::error!(
                        backend = inner.backend.name(),
                        key = ?key,
                        error = %e,
                        "Lookup task did not finish"
                    );
                    let cancelled = LookupError::Cancelled {
                        backend: inner.backend.name().to_string(),
                    };
                    inner.complete(key, &request, Err(cancelled.into()))
                }
            }
        }
        .boxed()
        .shared()
    }

    fn complete(
        &self,
        key: B::Key,
        request: &B::Request,
        outcome: ParleyResult<B::Fetched>,
    ) -> B::Output {
        let output = match outcome {
            Ok(fetched) => self.backend.merge(request, fetched),
            Err(e) => {
                incr(&self.counters.failures);
                tracing::warn!(
                    backend = self.backend.name(),
                    key = ?key,
                    error = %e,
                    "Lookup failed, returning pending placeholder"
                );
                self.backend.synthesize(request, LookupStatus::Pending)
            }
        };

        let mut state = self.lock_state();
        state.in_flight.remove(&key);
        state.results.insert(key, output.clone());
        output
    }
}
