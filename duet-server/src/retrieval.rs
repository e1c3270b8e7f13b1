//! Paginated message history.
//!
//! The hot cache serves the newest window of a conversation. When it cannot
//! fill a page on its own, the page is completed from the durable store and
//! the two tiers are merged on `(timestamp, id)`, so paging backwards crosses
//! the tier boundary without gaps or repeats.

use std::collections::HashSet;
use std::sync::Arc;

use duet_proto::api::PageQuery;
use duet_proto::message::{ChatMessage, ConversationId, Timestamp, UserId};

use crate::durable::DurableStore;
use crate::error::ChatError;
use crate::hot_cache::HotCache;

/// Default page size.
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Upper bound applied to requested page sizes.
pub const DEFAULT_MAX_PAGE_SIZE: usize = 100;

/// Read path over the hot cache and the durable store.
pub struct History<S> {
    cache: Arc<HotCache>,
    store: Arc<S>,
    default_page_size: usize,
    max_page_size: usize,
}

impl<S: DurableStore> History<S> {
    /// Creates a history reader.
    #[must_use]
    pub fn new(
        cache: Arc<HotCache>,
        store: Arc<S>,
        default_page_size: usize,
        max_page_size: usize,
    ) -> Self {
        let max_page_size = max_page_size.max(1);
        Self {
            cache,
            store,
            default_page_size: default_page_size.clamp(1, max_page_size),
            max_page_size,
        }
    }

    /// Effective page size for a requested limit.
    #[must_use]
    pub fn page_size(&self, requested: Option<usize>) -> usize {
        requested.map_or(self.default_page_size, |limit| {
            limit.clamp(1, self.max_page_size)
        })
    }

    /// A page of history for a participant of the conversation.
    ///
    /// # Errors
    ///
    /// * [`ChatError::NotFound`] if the conversation does not exist.
    /// * [`ChatError::Unauthorized`] if `viewer` is not a participant.
    /// * Store errors from the durable tier.
    pub async fn page_for(
        &self,
        viewer: &UserId,
        conversation_id: ConversationId,
        query: PageQuery,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let conversation = self
            .store
            .conversation(conversation_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("conversation {conversation_id}")))?;
        if !conversation.has_participant(viewer) {
            return Err(ChatError::Unauthorized(format!(
                "{viewer} is not a participant of {conversation_id}"
            )));
        }
        self.page(conversation_id, query).await
    }

    /// Up to `limit` messages strictly older than `before`, newest first.
    /// Without `before` the newest page is returned, including messages
    /// re-stamped past the wall clock by a burst of appends.
    ///
    /// # Errors
    ///
    /// Store errors from the durable tier. A corrupt cache window is logged
    /// and served from the durable store alone.
    pub async fn page(
        &self,
        conversation_id: ConversationId,
        query: PageQuery,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let before = query.before.unwrap_or(Timestamp::MAX);
        let limit = self.page_size(query.limit);

        let cached = match self.cache.page(conversation_id, before, limit).await {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %e,
                    "hot cache read failed, serving from durable store"
                );
                Vec::new()
            }
        };
        if cached.len() >= limit {
            return Ok(cached);
        }

        let durable = self
            .store
            .messages_before(conversation_id, before, limit)
            .await?;
        tracing::debug!(
            conversation_id = %conversation_id,
            cached = cached.len(),
            durable = durable.len(),
            "merging history tiers"
        );
        Ok(merge_tiers(cached, durable.into_iter().map(ChatMessage::from), limit))
    }
}

/// Merges two newest-first runs, de-duplicating by id, newest first.
fn merge_tiers(
    cached: Vec<ChatMessage>,
    durable: impl IntoIterator<Item = ChatMessage>,
    limit: usize,
) -> Vec<ChatMessage> {
    let mut seen: HashSet<_> = cached.iter().map(|m| m.id).collect();
    let mut merged = cached;
    merged.extend(durable.into_iter().filter(|m| seen.insert(m.id)));
    merged.sort_by(|a, b| b.order_key().cmp(&a.order_key()));
    merged.truncate(limit);
    merged
}
