//! Property-based and scenario tests for RequestCoalescer, driven by the
//! scripted mock backend.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parley_core::{Clock, LookupStatus, ManualClock};
use parley_lookup::{CoalescerPolicy, RequestCoalescer};
use parley_test_utils::fixtures;
use parley_test_utils::generators::arb_lookup_status;
use parley_test_utils::{MockLookup, MockOutcome, MockRequest};
use proptest::prelude::*;

fn policy() -> CoalescerPolicy {
    CoalescerPolicy {
        poll_interval: Duration::from_millis(5_000),
        confirmation_threshold: Some(Duration::from_millis(5_000)),
    }
}

fn coalescer(mock: &MockLookup, clock: &ManualClock) -> RequestCoalescer<MockLookup> {
    RequestCoalescer::with_clock(mock.clone(), policy(), Arc::new(clock.clone()))
}

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .expect("runtime builds")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// However many concurrent fetches hit a key, the backend sees one lookup
    /// per distinct key and never two at once for the same key.
    #[test]
    fn prop_one_lookup_per_key(keys in prop::collection::vec(0u8..6, 1..40)) {
        paused_runtime().block_on(async {
            let mock = MockLookup::new();
            let clock = fixtures::manual_clock();
            let coalescer = coalescer(&mock, &clock);

            let fetches = keys.iter().map(|k| {
                let coalescer = coalescer.clone();
                let request = MockRequest::new(format!("key-{}", k));
                async move { coalescer.fetch(request).await }
            });
            let results = join_all(fetches).await;

            let distinct: HashSet<u8> = keys.iter().copied().collect();
            prop_assert_eq!(mock.calls(), distinct.len());
            for k in &distinct {
                prop_assert_eq!(mock.calls_for(&format!("key-{}", k)), 1);
            }
            prop_assert!(mock.max_in_flight_per_key() <= 1);
            prop_assert!(results.iter().all(|r| r.status == LookupStatus::Confirmed));

            let stats = coalescer.stats();
            prop_assert_eq!(stats.lookups as usize, distinct.len());
            prop_assert_eq!(stats.coalesced as usize, keys.len() - distinct.len());
            prop_assert_eq!(stats.in_flight, 0);
            Ok(())
        })?;
    }

    /// Whatever the backend reports, the merged result keeps the caller's
    /// key and metadata, and only terminal results are served from cache.
    #[test]
    fn prop_merge_preserves_identity(status in arb_lookup_status()) {
        paused_runtime().block_on(async {
            let mock = MockLookup::scripted(vec![MockOutcome::Status(status)]);
            let clock = fixtures::manual_clock();
            let coalescer = coalescer(&mock, &clock);

            let request = MockRequest::new("tx");
            let first = coalescer.fetch(request.clone()).await;
            prop_assert_eq!(&first.key, "tx");
            prop_assert_eq!(&first.note, &request.note);
            prop_assert_eq!(first.status, status);

            let second = coalescer.fetch(request).await;
            let expected_calls = if status.is_terminal() { 1 } else { 2 };
            prop_assert_eq!(mock.calls(), expected_calls);
            prop_assert_eq!(&second.note, &first.note);
            Ok(())
        })?;
    }

    /// Requests older than the threshold never reach the backend; younger
    /// ones always do.
    #[test]
    fn prop_confirmation_threshold(age_ms in 0u64..12_000) {
        paused_runtime().block_on(async {
            let mock = MockLookup::scripted(vec![MockOutcome::Status(LookupStatus::Pending)]);
            let clock = fixtures::manual_clock();
            let created = clock.now();
            clock.advance(Duration::from_millis(age_ms));
            let coalescer = coalescer(&mock, &clock);

            let result = coalescer.fetch(MockRequest::new("tx").created_at(created)).await;
            if age_ms > 5_000 {
                prop_assert_eq!(result.status, LookupStatus::Confirmed);
                prop_assert_eq!(result.call, None);
                prop_assert_eq!(mock.calls(), 0);
            } else {
                prop_assert_eq!(result.status, LookupStatus::Pending);
                prop_assert_eq!(mock.calls(), 1);
            }
            Ok(())
        })?;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_fetches_across_threads_share_lookup() {
    let mock = MockLookup::new().with_delay(Duration::from_millis(100));
    let clock = ManualClock::starting_now();
    let coalescer = coalescer(&mock, &clock);

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let coalescer = coalescer.clone();
            tokio::spawn(async move { coalescer.fetch(MockRequest::new("shared")).await })
        })
        .collect();

    let calls: Vec<Option<usize>> = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.expect("fetch task").call)
        .collect();

    assert_eq!(mock.calls(), 1);
    assert_eq!(mock.max_in_flight_per_key(), 1);
    assert!(calls.iter().all(|c| *c == Some(1)));
}

#[tokio::test(start_paused = true)]
async fn test_six_second_old_message_confirmed_without_lookup() {
    let mock = MockLookup::new();
    let clock = fixtures::manual_clock();
    let sent_at = clock.now();
    clock.advance(Duration::from_millis(6_000));
    let coalescer = coalescer(&mock, &clock);

    let request = MockRequest::new("0xabc").created_at(sent_at);
    let result = coalescer.fetch(request.clone()).await;
    assert_eq!(result.status, LookupStatus::Confirmed);
    assert_eq!(result.note, request.note);
    assert_eq!(mock.calls(), 0);
    assert_eq!(coalescer.stats().synthesized_confirmations, 1);

    // Served from cache afterwards.
    coalescer.fetch(request).await;
    assert_eq!(coalescer.stats().cache_hits, 1);
    assert_eq!(mock.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_outage_then_recovery_while_polling() {
    let mock = MockLookup::scripted(vec![
        MockOutcome::Fail("node down".to_string()),
        MockOutcome::Fail("node down".to_string()),
        MockOutcome::Status(LookupStatus::Pending),
        MockOutcome::Status(LookupStatus::Failed),
    ]);
    let clock = fixtures::manual_clock();
    let coalescer = coalescer(&mock, &clock);

    let mut subscription = coalescer.watch(MockRequest::new("tx"));
    let terminal = subscription.wait_terminal().await.expect("terminal result");

    assert_eq!(terminal.status, LookupStatus::Failed);
    assert_eq!(terminal.call, Some(4));
    assert_eq!(mock.calls(), 4);
    let stats = coalescer.stats();
    assert_eq!(stats.failures, 2);
    assert_eq!(stats.polls, 3);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_watch_stops_lookups() {
    let mock = MockLookup::scripted(vec![MockOutcome::Status(LookupStatus::Pending); 10]);
    let clock = fixtures::manual_clock();
    let coalescer = coalescer(&mock, &clock);

    let mut subscription = coalescer.watch(MockRequest::new("tx"));
    let first = subscription.changed().await.expect("first result");
    assert_eq!(first.status, LookupStatus::Pending);
    subscription.cancel();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(mock.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_watchers_of_same_key_share_lookups() {
    let mock = MockLookup::scripted(vec![
        MockOutcome::Status(LookupStatus::Pending),
        MockOutcome::Status(LookupStatus::Confirmed),
    ]);
    let clock = fixtures::manual_clock();
    let coalescer = coalescer(&mock, &clock);

    let mut a = coalescer.watch(MockRequest::new("tx"));
    let mut b = coalescer.watch(MockRequest::new("tx"));
    let (ra, rb) = tokio::join!(a.wait_terminal(), b.wait_terminal());

    assert_eq!(ra.map(|r| r.status), Some(LookupStatus::Confirmed));
    assert_eq!(rb.map(|r| r.status), Some(LookupStatus::Confirmed));
    assert_eq!(mock.calls(), 2);
    assert_eq!(mock.max_in_flight_per_key(), 1);
}
