//! Property-based tests for the client stores and lease-gated startup.

use std::collections::HashMap;
use std::sync::Arc;

use parley_client::{ChatMessage, ClientContext, MessageStore};
use parley_core::{CacheLimits, LeaseError, ParleyError};
use parley_storage::LmdbLeaseStore;
use parley_test_utils::fixtures;
use parley_test_utils::generators::arb_address;
use proptest::prelude::*;

proptest! {
    /// Whatever is appended, the store never holds more conversations or
    /// messages than configured, and each conversation keeps its newest
    /// messages in arrival order.
    #[test]
    fn prop_message_store_stays_bounded(
        appends in prop::collection::vec((0usize..6, arb_address()), 1..120),
        max_conversations in 1usize..5,
        max_messages in 1usize..8,
    ) {
        let limits = CacheLimits {
            max_conversations,
            max_messages_per_conversation: max_messages,
            ..CacheLimits::default()
        };
        let store = MessageStore::new(&limits).unwrap();
        let ids: Vec<_> = (0..6).map(|_| parley_core::ConversationId::now_v7()).collect();
        let mut sent: HashMap<usize, Vec<String>> = HashMap::new();

        for (n, (conversation, sender)) in appends.into_iter().enumerate() {
            let body = format!("m{}", n);
            store.append(ids[conversation], ChatMessage::text(sender, body.clone(), fixtures::epoch()));
            sent.entry(conversation).or_default().push(body);
            prop_assert!(store.len() <= max_conversations);
        }

        for (conversation, bodies) in sent {
            if let Some(messages) = store.messages(ids[conversation]) {
                let kept: Vec<String> = messages.into_iter().map(|m| m.body).collect();
                prop_assert!(kept.len() <= max_messages);
                let expected = &bodies[bodies.len() - kept.len()..];
                prop_assert_eq!(kept.as_slice(), expected);
            }
        }
    }
}

/// LMDB environments are opened once per process, so two "windows" share
/// clones of one store here, as two processes would share the file.
#[tokio::test]
async fn test_second_window_refused_on_shared_disk_store() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = LmdbLeaseStore::open(dir.path(), 1).unwrap();
    let config = fixtures::test_config();

    let first = ClientContext::start_with_store(config.clone(), Arc::new(store.clone()))
        .await
        .unwrap();
    let refused = ClientContext::start_with_store(config.clone(), Arc::new(store.clone()))
        .await
        .unwrap_err();
    assert!(matches!(
        refused,
        ParleyError::Lease(LeaseError::HeldElsewhere { .. })
    ));

    first.shutdown().await;
    let second = ClientContext::start_with_store(config, Arc::new(store))
        .await
        .unwrap();
    assert!(second.lease_active());
    second.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_conversation_streams() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = fixtures::test_config();
    config.lease.store_path = dir.path().join("lease");

    let context = ClientContext::start(config).await.unwrap();
    let conversation = parley_core::ConversationId::now_v7();
    let stream = tokio::spawn(async {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
    });
    context.messages().attach_stream(conversation, stream.abort_handle());

    context.shutdown().await;
    assert!(stream.await.unwrap_err().is_cancelled());
}
