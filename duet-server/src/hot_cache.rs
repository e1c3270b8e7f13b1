//! Bounded per-conversation cache of the most recent messages.
//!
//! Each conversation keeps an ordered map of postcard-encoded [`ChatMessage`]
//! payloads keyed by `(timestamp, message id)`, plus the bookkeeping the sync
//! job needs:
//!
//! * the **watermark**: the highest timestamp known to be durable;
//! * the **sync floor**: the highest timestamp handed to the sync job. New
//!   appends are stamped above it, so an entry can never land at or below a
//!   timestamp the sync job has already claimed.
//!
//! Every append is stamped strictly after the newest timestamp the
//! conversation has assigned, so timestamps are unique within a conversation
//! and a timestamp alone is an exact pagination cursor.
//!
//! Entries above the watermark are never trimmed.

use std::collections::{BTreeMap, HashMap, HashSet};

use duet_proto::codec;
use duet_proto::message::{ChatMessage, ConversationId, MessageId, Timestamp};
use tokio::sync::RwLock;

/// Default number of entries kept per conversation after a trim.
pub const DEFAULT_CAPACITY: usize = 20;

/// Errors returned by the hot cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// A cached payload could not be decoded.
    #[error("corrupt cache entry {message_id} in conversation {conversation_id}: {reason}")]
    Corrupt {
        /// Conversation holding the entry.
        conversation_id: ConversationId,
        /// Key of the entry.
        message_id: MessageId,
        /// Decoder error.
        reason: String,
    },

    /// A message could not be encoded for caching.
    #[error("failed to encode message for cache: {0}")]
    Encode(String),
}

/// Result of [`HotCache::append`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The message was stored. Carries the message as stored, which may have
    /// been re-stamped to keep timestamps unique and above the sync floor.
    Inserted(ChatMessage),
    /// A message with the same id is already cached; nothing changed.
    Duplicate,
}

#[derive(Default)]
struct ConversationCache {
    entries: BTreeMap<(Timestamp, MessageId), Vec<u8>>,
    ids: HashSet<MessageId>,
    watermark: Timestamp,
    sync_floor: Timestamp,
    newest_assigned: Timestamp,
}

impl ConversationCache {
    fn decode(
        conversation_id: ConversationId,
        key: &(Timestamp, MessageId),
        bytes: &[u8],
    ) -> Result<ChatMessage, CacheError> {
        codec::decode(bytes).map_err(|e| CacheError::Corrupt {
            conversation_id,
            message_id: key.1,
            reason: e.to_string(),
        })
    }
}

/// In-memory hot cache shared by delivery, retrieval and the sync job.
pub struct HotCache {
    conversations: RwLock<HashMap<ConversationId, ConversationCache>>,
    capacity: usize,
}

impl Default for HotCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl HotCache {
    /// Creates an empty cache that trims each conversation to `capacity`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Per-conversation capacity after a trim.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stores a message unless its id is already cached.
    ///
    /// The stored timestamp is `max(timestamp, newest + 1)`, where `newest`
    /// is the later of the newest timestamp assigned in this conversation and
    /// the sync floor.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Encode`] if the message cannot be encoded.
    pub async fn append(&self, mut message: ChatMessage) -> Result<AppendOutcome, CacheError> {
        let mut conversations = self.conversations.write().await;
        let cache = conversations.entry(message.conversation_id).or_default();
        if cache.ids.contains(&message.id) {
            return Ok(AppendOutcome::Duplicate);
        }
        let floor = cache.sync_floor.max(cache.newest_assigned);
        if message.timestamp <= floor {
            tracing::debug!(
                conversation_id = %message.conversation_id,
                message_id = %message.id,
                from = %message.timestamp,
                to = %floor.next(),
                "re-stamping message after newest assigned timestamp"
            );
            message.timestamp = floor.next();
        }
        let bytes = codec::encode(&message).map_err(|e| CacheError::Encode(e.to_string()))?;
        cache.newest_assigned = message.timestamp;
        cache.ids.insert(message.id);
        cache.entries.insert(message.order_key(), bytes);
        drop(conversations);
        Ok(AppendOutcome::Inserted(message))
    }

    /// Up to `limit` messages strictly older than `before`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Corrupt`] if any entry in the window fails to
    /// decode.
    pub async fn page(
        &self,
        conversation_id: ConversationId,
        before: Timestamp,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, CacheError> {
        let conversations = self.conversations.read().await;
        let Some(cache) = conversations.get(&conversation_id) else {
            return Ok(Vec::new());
        };
        cache
            .entries
            .range(..(before, MessageId::MIN))
            .rev()
            .take(limit)
            .map(|(key, bytes)| ConversationCache::decode(conversation_id, key, bytes))
            .collect()
    }

    /// The newest cached message of a conversation.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Corrupt`] if the newest entry fails to decode.
    pub async fn latest(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<ChatMessage>, CacheError> {
        let conversations = self.conversations.read().await;
        conversations
            .get(&conversation_id)
            .and_then(|cache| cache.entries.last_key_value())
            .map(|(key, bytes)| ConversationCache::decode(conversation_id, key, bytes))
            .transpose()
    }

    /// Number of cached entries for a conversation.
    pub async fn len(&self, conversation_id: ConversationId) -> usize {
        self.conversations
            .read()
            .await
            .get(&conversation_id)
            .map_or(0, |cache| cache.entries.len())
    }

    /// Conversations that currently hold at least one entry.
    pub async fn conversations(&self) -> Vec<ConversationId> {
        self.conversations
            .read()
            .await
            .iter()
            .filter(|(_, cache)| !cache.entries.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Last-synced timestamp of a conversation; [`Timestamp::ZERO`] if never
    /// synced.
    pub async fn watermark(&self, conversation_id: ConversationId) -> Timestamp {
        self.conversations
            .read()
            .await
            .get(&conversation_id)
            .map_or(Timestamp::ZERO, |cache| cache.watermark)
    }

    /// Hands every entry newer than the watermark to the caller, oldest first,
    /// and raises the sync floor to the newest claimed timestamp.
    ///
    /// Entries that fail to decode cannot be synced; they are logged and
    /// skipped, and age out through [`HotCache::trim`].
    pub async fn claim_unsynced(&self, conversation_id: ConversationId) -> Vec<ChatMessage> {
        let mut conversations = self.conversations.write().await;
        let Some(cache) = conversations.get_mut(&conversation_id) else {
            return Vec::new();
        };
        let start = (cache.watermark.next(), MessageId::MIN);
        let mut claimed = Vec::new();
        let mut newest = cache.sync_floor;
        for (key, bytes) in cache.entries.range(start..) {
            newest = newest.max(key.0);
            match ConversationCache::decode(conversation_id, key, bytes) {
                Ok(message) => claimed.push(message),
                Err(e) => tracing::warn!(error = %e, "skipping undecodable cache entry"),
            }
        }
        cache.sync_floor = newest;
        drop(conversations);
        claimed
    }

    /// Raises the watermark to `synced_up_to`. Never lowers it.
    ///
    /// Returns the watermark after the update.
    pub async fn advance_watermark(
        &self,
        conversation_id: ConversationId,
        synced_up_to: Timestamp,
    ) -> Timestamp {
        let mut conversations = self.conversations.write().await;
        let cache = conversations.entry(conversation_id).or_default();
        cache.watermark = cache.watermark.max(synced_up_to);
        cache.sync_floor = cache.sync_floor.max(cache.watermark);
        cache.watermark
    }

    /// Drops the oldest entries until at most `capacity` remain, stopping at
    /// the first entry that is not yet durable.
    ///
    /// Returns the number of entries removed.
    pub async fn trim(&self, conversation_id: ConversationId) -> usize {
        let mut conversations = self.conversations.write().await;
        let Some(cache) = conversations.get_mut(&conversation_id) else {
            return 0;
        };
        let mut removed = 0;
        while cache.entries.len() > self.capacity {
            let Some(entry) = cache.entries.first_entry() else {
                break;
            };
            if entry.key().0 > cache.watermark {
                break;
            }
            let (_, message_id) = *entry.key();
            entry.remove();
            cache.ids.remove(&message_id);
            removed += 1;
        }
        removed
    }

    /// Inserts raw bytes under a key, bypassing encoding.
    #[cfg(test)]
    pub(crate) async fn insert_raw(
        &self,
        conversation_id: ConversationId,
        key: (Timestamp, MessageId),
        bytes: Vec<u8>,
    ) {
        let mut conversations = self.conversations.write().await;
        let cache = conversations.entry(conversation_id).or_default();
        cache.ids.insert(key.1);
        cache.entries.insert(key, bytes);
    }
}
