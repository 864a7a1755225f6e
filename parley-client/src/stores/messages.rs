//! Per-conversation message lists.
//!
//! Conversations live in a [`BoundedCache`] keyed by conversation id, so only
//! the most recently viewed ones stay in memory. A conversation may own the
//! abort handle of its live message stream; the stream is stopped whenever
//! the conversation leaves memory, whether evicted, removed or replaced.
//!
//! When built with [`MessageStore::with_payment_statuses`], a message leaving
//! the store also takes the cached status of its payment with it, so the
//! status coalescer holds no more entries than the store holds payments.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};

use parley_core::{
    Address, CacheLimits, ConfigError, ConversationId, MessageId, ParleyResult, Timestamp,
};
use parley_lookup::{
    LookupBackend, RequestCoalescer, TransactionRequest, TransactionStatusLookup,
};
use parley_storage::{BoundedCache, CacheStats};
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;

/// A chat message as held by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender: Address,
    pub body: String,
    pub sent_at: Timestamp,
    /// Payment sent along with the message.
    pub payment: Option<TransactionRequest>,
}

impl ChatMessage {
    pub fn text(sender: Address, body: impl Into<String>, sent_at: Timestamp) -> Self {
        Self {
            id: MessageId::now_v7(),
            sender,
            body: body.into(),
            sent_at,
            payment: None,
        }
    }

    pub fn with_payment(mut self, payment: TransactionRequest) -> Self {
        self.payment = Some(payment);
        self
    }
}

/// Aborts the stream task when dropped.
#[derive(Debug)]
struct StreamGuard(AbortHandle);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Default)]
struct Conversation {
    messages: VecDeque<ChatMessage>,
    stream: Option<StreamGuard>,
}

type PaymentStatuses = RequestCoalescer<TransactionStatusLookup>;

/// Drop the cached status of every payment in `messages`. Returns how many
/// were cached.
fn forget_payments<'a, I>(statuses: Option<&PaymentStatuses>, messages: I) -> usize
where
    I: IntoIterator<Item = &'a ChatMessage>,
{
    let Some(statuses) = statuses else {
        return 0;
    };
    let mut forgotten = 0;
    for payment in messages.into_iter().filter_map(|m| m.payment.as_ref()) {
        if statuses.invalidate(&statuses.backend().key(payment)) {
            forgotten += 1;
        }
    }
    forgotten
}

/// Bounded store of conversations and their messages.
pub struct MessageStore {
    conversations: Mutex<BoundedCache<ConversationId, Conversation>>,
    max_messages: usize,
    payments: Option<PaymentStatuses>,
}

impl MessageStore {
    pub fn new(limits: &CacheLimits) -> ParleyResult<Self> {
        Self::build(limits, None)
    }

    /// A store that invalidates `statuses` for payments whose messages are
    /// evicted, removed or trimmed away.
    pub fn with_payment_statuses(
        limits: &CacheLimits,
        statuses: PaymentStatuses,
    ) -> ParleyResult<Self> {
        Self::build(limits, Some(statuses))
    }

    fn build(limits: &CacheLimits, payments: Option<PaymentStatuses>) -> ParleyResult<Self> {
        let capacity = NonZeroUsize::new(limits.max_conversations).ok_or_else(|| {
            ConfigError::InvalidValue {
                field: "cache.max_conversations".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            }
        })?;
        if limits.max_messages_per_conversation == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.max_messages_per_conversation".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            }
            .into());
        }

        let evicted_payments = payments.clone();
        let conversations = BoundedCache::with_eviction_callback(
            capacity,
            Box::new(move |id: ConversationId, conversation: Conversation| {
                let forgotten =
                    forget_payments(evicted_payments.as_ref(), &conversation.messages);
                tracing::debug!(
                    conversation_id = %id,
                    messages = conversation.messages.len(),
                    streaming = conversation.stream.is_some(),
                    forgotten_statuses = forgotten,
                    "Conversation evicted from memory"
                );
            }),
        );

        Ok(Self {
            conversations: Mutex::new(conversations),
            max_messages: limits.max_messages_per_conversation,
            payments,
        })
    }

    /// Append `message` to a conversation, creating it if needed.
    ///
    /// A message whose id is already present replaces the stored copy in
    /// place. Returns how many of the oldest messages were dropped to stay
    /// within the per-conversation cap.
    pub fn append(&self, conversation_id: ConversationId, message: ChatMessage) -> usize {
        let mut conversations = self.lock();
        let conversation = conversations.get_or_insert_with(conversation_id, Conversation::default);

        if let Some(existing) = conversation
            .messages
            .iter_mut()
            .find(|m| m.id == message.id)
        {
            *existing = message;
            return 0;
        }

        conversation.messages.push_back(message);
        let mut dropped = 0;
        while conversation.messages.len() > self.max_messages {
            if let Some(oldest) = conversation.messages.pop_front() {
                forget_payments(self.payments.as_ref(), [&oldest]);
            }
            dropped += 1;
        }
        if dropped > 0 {
            tracing::trace!(
                conversation_id = %conversation_id,
                dropped,
                "Trimmed conversation history"
            );
        }
        dropped
    }

    /// Append a batch, oldest first. Returns the total dropped.
    pub fn extend<I>(&self, conversation_id: ConversationId, messages: I) -> usize
    where
        I: IntoIterator<Item = ChatMessage>,
    {
        messages
            .into_iter()
            .map(|m| self.append(conversation_id, m))
            .sum()
    }

    /// Messages of a conversation, oldest first. Marks the conversation as
    /// most recently used.
    pub fn messages(&self, conversation_id: ConversationId) -> Option<Vec<ChatMessage>> {
        self.lock()
            .get(&conversation_id)
            .map(|c| c.messages.iter().cloned().collect())
    }

    pub fn contains(&self, conversation_id: ConversationId) -> bool {
        self.lock().has(&conversation_id)
    }

    /// Give the conversation ownership of its live stream. A stream attached
    /// earlier is aborted.
    pub fn attach_stream(&self, conversation_id: ConversationId, stream: AbortHandle) {
        let mut conversations = self.lock();
        let conversation = conversations.get_or_insert_with(conversation_id, Conversation::default);
        if conversation.stream.replace(StreamGuard(stream)).is_some() {
            tracing::debug!(conversation_id = %conversation_id, "Replaced conversation stream");
        }
    }

    pub fn has_stream(&self, conversation_id: ConversationId) -> bool {
        self.lock()
            .peek(&conversation_id)
            .map(|c| c.stream.is_some())
            .unwrap_or(false)
    }

    /// Drop a conversation and stop its stream. Returns its messages.
    pub fn remove(&self, conversation_id: ConversationId) -> Option<Vec<ChatMessage>> {
        let removed = self.lock().delete(&conversation_id)?;
        forget_payments(self.payments.as_ref(), &removed.messages);
        Some(removed.messages.iter().cloned().collect())
    }

    /// Evict least recently used conversations until at most `target` remain.
    pub fn trim_to(&self, target: usize) -> usize {
        let evicted = self.lock().evict_to(target);
        if evicted > 0 {
            tracing::info!(evicted, target, "Trimmed conversations under memory pressure");
        }
        evicted
    }

    /// Drop every conversation and stop every stream.
    pub fn clear(&self) {
        let mut conversations = self.lock();
        for conversation in conversations.values() {
            forget_payments(self.payments.as_ref(), &conversation.messages);
        }
        conversations.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Conversation ids, least recently used first.
    pub fn conversation_ids(&self) -> Vec<ConversationId> {
        self.lock().keys().copied().collect()
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats()
    }

    fn lock(&self) -> MutexGuard<'_, BoundedCache<ConversationId, Conversation>> {
        match self.conversations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore")
            .field("conversations", &self.len())
            .field("max_messages", &self.max_messages)
            .field("tracks_payments", &self.payments.is_some())
            .finish()
    }
}
