//! Composition root.
//!
//! [`ClientContext`] owns every long-lived piece of client state: the
//! exclusivity lease, the message and username stores, and the transaction
//! status coalescer. Nothing here is global; a context is built by
//! [`ClientContext::start`] and torn down by [`ClientContext::shutdown`].

use std::sync::Arc;

use parley_core::{HolderId, LeaseError, ParleyConfig, ParleyResult};
use parley_lease::LeaseManager;
use parley_lookup::{
    CoalescerPolicy, PollSubscription, ProfileLookup, RequestCoalescer, TransactionRequest,
    TransactionStatus, TransactionStatusLookup,
};
use parley_storage::{LeaseStore, LmdbLeaseStore};

use crate::stores::{MessageStore, UsernameStore};

/// Running client state. Exists only while this process holds the lease.
pub struct ClientContext {
    config: ParleyConfig,
    lease: LeaseManager,
    messages: MessageStore,
    usernames: Option<UsernameStore>,
    transactions: RequestCoalescer<TransactionStatusLookup>,
}

impl ClientContext {
    /// Open the on-disk lease store and start.
    pub async fn start(config: ParleyConfig) -> ParleyResult<Self> {
        config.validate()?;
        let store = LmdbLeaseStore::from_config(&config.lease)?;
        Self::start_with_store(config, Arc::new(store)).await
    }

    /// Start against an existing lease store.
    ///
    /// Fails with [`LeaseError::HeldElsewhere`] when another live process
    /// holds the lease; nothing else is built in that case.
    pub async fn start_with_store(
        config: ParleyConfig,
        store: Arc<dyn LeaseStore>,
    ) -> ParleyResult<Self> {
        config.validate()?;

        let lease = LeaseManager::new(store, config.lease.clone());
        if !lease.acquire().await {
            tracing::warn!(
                slot = %config.lease.slot,
                "Another window is active, try again later"
            );
            return Err(LeaseError::HeldElsewhere {
                slot: config.lease.slot.clone(),
            }
            .into());
        }

        let (messages, usernames, transactions) = match Self::build_parts(&config) {
            Ok(parts) => parts,
            Err(e) => {
                lease.release().await;
                return Err(e);
            }
        };

        tracing::info!(
            holder_id = %lease.holder_id(),
            max_conversations = config.cache.max_conversations,
            max_usernames = config.cache.max_usernames,
            usernames_enabled = usernames.is_some(),
            "Client context started"
        );
        Ok(Self {
            config,
            lease,
            messages,
            usernames,
            transactions,
        })
    }

    fn build_parts(
        config: &ParleyConfig,
    ) -> ParleyResult<(
        MessageStore,
        Option<UsernameStore>,
        RequestCoalescer<TransactionStatusLookup>,
    )> {
        let policy = CoalescerPolicy::from(&config.polling);
        let transactions = RequestCoalescer::new(
            TransactionStatusLookup::from_config(&config.endpoints)?,
            policy,
        );
        let messages = MessageStore::with_payment_statuses(&config.cache, transactions.clone())?;

        let usernames = match config.endpoints.profile_base_url {
            Some(_) => {
                let profiles = ProfileLookup::from_config(&config.endpoints)?;
                Some(UsernameStore::new(
                    &config.cache,
                    RequestCoalescer::new(profiles, policy),
                )?)
            }
            None => {
                tracing::info!("No profile service configured, usernames disabled");
                None
            }
        };

        Ok((messages, usernames, transactions))
    }

    /// Release the lease and drop all cached state, stopping message streams.
    pub async fn shutdown(self) {
        let holder_id = self.lease.holder_id();
        self.messages.clear();
        self.lease.release().await;
        tracing::info!(holder_id = %holder_id, "Client context shut down");
    }

    pub fn config(&self) -> &ParleyConfig {
        &self.config
    }

    pub fn holder_id(&self) -> HolderId {
        self.lease.holder_id()
    }

    pub fn lease(&self) -> &LeaseManager {
        &self.lease
    }

    /// False once the heartbeat has stopped, e.g. because another process
    /// took over a lease this process let go stale.
    pub fn lease_active(&self) -> bool {
        self.lease.heartbeat_active()
    }

    pub fn messages(&self) -> &MessageStore {
        &self.messages
    }

    /// `None` when no profile service is configured.
    pub fn usernames(&self) -> Option<&UsernameStore> {
        self.usernames.as_ref()
    }

    /// Transaction statuses. A cached status lives as long as some stored
    /// message carries the payment it belongs to.
    pub fn transactions(&self) -> &RequestCoalescer<TransactionStatusLookup> {
        &self.transactions
    }

    /// Poll a transaction's status until it is confirmed or failed.
    pub fn watch_transaction(&self, request: TransactionRequest) -> PollSubscription<TransactionStatus> {
        self.transactions.watch(request)
    }
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("holder_id", &self.lease.holder_id())
            .field("conversations", &self.messages.len())
            .field("usernames_enabled", &self.usernames.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{ChainId, LookupStatus, ParleyError, TxHash};
    use parley_storage::InMemoryLeaseStore;

    const HASH: &str = "0x5c504ed432cb51138bcf09aa5e8a410dd4a1e204ef84bfed1be16dfba1b22060";

    fn config() -> ParleyConfig {
        let mut config = ParleyConfig::default();
        config.lease.slot = "parley.context-test".to_string();
        config
    }

    #[tokio::test]
    async fn test_second_context_is_refused() {
        let store = InMemoryLeaseStore::new();
        let first = ClientContext::start_with_store(config(), Arc::new(store.clone()))
            .await
            .unwrap();

        let err = ClientContext::start_with_store(config(), Arc::new(store.clone()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ParleyError::Lease(LeaseError::HeldElsewhere { .. })
        ));

        first.shutdown().await;
        let second = ClientContext::start_with_store(config(), Arc::new(store))
            .await
            .unwrap();
        assert!(second.lease_active());
        second.shutdown().await;
    }

    #[tokio::test]
    async fn test_usernames_enabled_with_profile_service() {
        let store = InMemoryLeaseStore::new();
        let mut with_profiles = config();
        with_profiles.endpoints.profile_base_url = Some("https://profiles.example.org".to_string());

        let context = ClientContext::start_with_store(with_profiles, Arc::new(store))
            .await
            .unwrap();
        assert!(context.usernames().is_some_and(|u| u.is_empty()));
        context.shutdown().await;
    }

    #[tokio::test]
    async fn test_usernames_disabled_without_profile_service() {
        let store = InMemoryLeaseStore::new();
        let context = ClientContext::start_with_store(config(), Arc::new(store))
            .await
            .unwrap();
        assert!(context.usernames().is_none());
        context.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_never_touches_lease() {
        let store = InMemoryLeaseStore::new();
        let mut bad = config();
        bad.cache.max_usernames = 0;

        assert!(ClientContext::start_with_store(bad, Arc::new(store.clone()))
            .await
            .is_err());
        assert_eq!(store.read("parley.context-test").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_payment_confirmed_without_rpc() {
        let store = InMemoryLeaseStore::new();
        let context = ClientContext::start_with_store(config(), Arc::new(store))
            .await
            .unwrap();

        let request = TransactionRequest::new(TxHash::parse(HASH).unwrap(), ChainId(1))
            .sent_at(chrono::Utc::now() - chrono::Duration::seconds(60));
        let status = context.transactions().fetch(request).await;
        assert_eq!(status.status, LookupStatus::Confirmed);
        assert_eq!(context.transactions().stats().lookups, 0);
        context.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_payment_status_dropped_with_its_conversation() {
        let store = InMemoryLeaseStore::new();
        let mut small = config();
        small.cache.max_conversations = 1;
        let context = ClientContext::start_with_store(small, Arc::new(store))
            .await
            .unwrap();

        let sent_at = chrono::Utc::now() - chrono::Duration::seconds(60);
        let payment = TransactionRequest::new(TxHash::parse(HASH).unwrap(), ChainId(1)).sent_at(sent_at);
        let key = (payment.tx_hash.clone(), payment.chain_id);
        let sender = parley_core::Address::parse("0x1111111111111111111111111111111111111111").unwrap();
        let paid = crate::ChatMessage::text(sender.clone(), "paid", sent_at).with_payment(payment.clone());

        // Removal forgets the status.
        let first = parley_core::ConversationId::now_v7();
        context.messages().append(first, paid.clone());
        context.transactions().fetch(payment.clone()).await;
        assert!(context.transactions().cached(&key).is_some());
        context.messages().remove(first);
        assert!(context.transactions().cached(&key).is_none());

        // So does eviction by a newer conversation.
        let second = parley_core::ConversationId::now_v7();
        context.messages().append(second, paid);
        context.transactions().fetch(payment).await;
        assert_eq!(context.transactions().stats().cached_results, 1);
        context.messages().append(
            parley_core::ConversationId::now_v7(),
            crate::ChatMessage::text(sender, "hello", sent_at),
        );
        assert!(!context.messages().contains(second));
        assert_eq!(context.transactions().stats().cached_results, 0);
        context.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_payment_status_dropped_when_history_trimmed() {
        let store = InMemoryLeaseStore::new();
        let mut short = config();
        short.cache.max_messages_per_conversation = 1;
        let context = ClientContext::start_with_store(short, Arc::new(store))
            .await
            .unwrap();

        let sent_at = chrono::Utc::now() - chrono::Duration::seconds(60);
        let payment = TransactionRequest::new(TxHash::parse(HASH).unwrap(), ChainId(1)).sent_at(sent_at);
        let sender = parley_core::Address::parse("0x1111111111111111111111111111111111111111").unwrap();
        let conversation = parley_core::ConversationId::now_v7();

        context.messages().append(
            conversation,
            crate::ChatMessage::text(sender.clone(), "paid", sent_at).with_payment(payment.clone()),
        );
        context.transactions().fetch(payment).await;
        assert_eq!(context.transactions().stats().cached_results, 1);

        assert_eq!(
            context.messages().append(conversation, crate::ChatMessage::text(sender, "later", sent_at)),
            1
        );
        assert_eq!(context.transactions().stats().cached_results, 0);
        context.shutdown().await;
    }
}
