//! Live chat-list channels and conversation summaries.
//!
//! [`ChatListHub`] keeps at most one live update channel per user. Pushes are
//! best effort: a user without a channel, or with a full one, simply misses
//! the update and catches up through [`Summaries::list`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use duet_proto::message::{ConversationSummary, Timestamp, UserId};
use duet_proto::stream::ChatListUpdate;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::directory::Directory;
use crate::durable::{DurableStore, StoredConversation};
use crate::error::ChatError;
use crate::hot_cache::HotCache;
use crate::shard::Sharded;

/// Identifies one subscription, so a stale stream cannot remove its
/// replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receiving side of a user's chat-list channel.
#[derive(Debug)]
pub struct ChatListSubscription {
    /// Subscription id, to pass back to [`ChatListHub::unsubscribe`].
    pub id: SubscriptionId,
    /// Pushed updates.
    pub updates: mpsc::Receiver<ChatListUpdate>,
}

type Channels = HashMap<UserId, (SubscriptionId, mpsc::Sender<ChatListUpdate>)>;

/// Per-user chat-list channels.
pub struct ChatListHub {
    channels: Sharded<Channels>,
    next_id: AtomicU64,
    queue_size: usize,
}

impl Default for ChatListHub {
    fn default() -> Self {
        Self::new(crate::sessions::DEFAULT_OUTBOUND_QUEUE_SIZE)
    }
}

impl ChatListHub {
    /// Creates a hub whose channels buffer up to `queue_size` updates.
    #[must_use]
    pub fn new(queue_size: usize) -> Self {
        Self {
            channels: Sharded::default(),
            next_id: AtomicU64::new(1),
            queue_size: queue_size.max(1),
        }
    }

    /// Opens the user's channel, replacing (and closing) any previous one.
    pub fn subscribe(&self, user_id: &UserId) -> ChatListSubscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.queue_size);
        let replaced = self
            .channels
            .lock(user_id)
            .insert(user_id.clone(), (id, tx))
            .is_some();
        tracing::info!(user_id = %user_id, replaced, "chat list subscribed");
        ChatListSubscription { id, updates: rx }
    }

    /// Removes the user's channel if it is still `subscription`.
    pub fn unsubscribe(&self, user_id: &UserId, subscription: SubscriptionId) -> bool {
        let mut channels = self.channels.lock(user_id);
        if channels.get(user_id).is_some_and(|(id, _)| *id == subscription) {
            channels.remove(user_id);
            drop(channels);
            tracing::info!(user_id = %user_id, "chat list unsubscribed");
            true
        } else {
            false
        }
    }

    /// Pushes an update to the user's channel. Returns `false` if there is no
    /// channel or it is full or closed.
    pub fn notify(&self, user_id: &UserId, update: ChatListUpdate) -> bool {
        let sender = self
            .channels
            .lock(user_id)
            .get(user_id)
            .map(|(_, tx)| tx.clone());
        let Some(sender) = sender else {
            return false;
        };
        match sender.try_send(update) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(user_id = %user_id, "chat list queue full, dropping update");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Returns `true` if the user has a channel.
    #[must_use]
    pub fn is_subscribed(&self, user_id: &UserId) -> bool {
        self.channels.lock(user_id).contains_key(user_id)
    }

    /// Closes every channel.
    pub fn close_all(&self) {
        self.channels.for_each(HashMap::clear);
    }
}

/// Unsubscribes when dropped, unless the channel was replaced meanwhile.
pub struct SubscriptionGuard {
    hub: Arc<ChatListHub>,
    user_id: UserId,
    id: SubscriptionId,
}

impl SubscriptionGuard {
    /// Guards `id`, the current subscription of `user_id`.
    #[must_use]
    pub const fn new(hub: Arc<ChatListHub>, user_id: UserId, id: SubscriptionId) -> Self {
        Self { hub, user_id, id }
    }

    /// The subscribed user.
    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        &self.user_id
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.user_id, self.id);
    }
}

/// Builds conversation summaries from the hot cache, the durable store and
/// the directory.
pub struct Summaries<S, D> {
    cache: Arc<HotCache>,
    store: Arc<S>,
    directory: Arc<D>,
}

impl<S: DurableStore, D: Directory> Summaries<S, D> {
    /// Creates a summary builder.
    #[must_use]
    pub const fn new(cache: Arc<HotCache>, store: Arc<S>, directory: Arc<D>) -> Self {
        Self {
            cache,
            store,
            directory,
        }
    }

    /// Display name of `user_id`, falling back to the id itself.
    pub async fn display_name(&self, user_id: &UserId) -> String {
        match self.directory.user_by_id(user_id).await {
            Ok(Some(profile)) => profile.name,
            Ok(None) => user_id.to_string(),
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "directory lookup failed");
                user_id.to_string()
            }
        }
    }

    /// Summary of `conversation` as seen by `viewer`.
    ///
    /// # Errors
    ///
    /// [`ChatError::Unauthorized`] if `viewer` is not a participant; store
    /// errors otherwise. A corrupt cache entry falls back to the store.
    pub async fn summarize(
        &self,
        conversation: &StoredConversation,
        viewer: &UserId,
    ) -> Result<ConversationSummary, ChatError> {
        let counterpart_id = conversation.counterpart(viewer).cloned().ok_or_else(|| {
            ChatError::Unauthorized(format!(
                "{viewer} is not a participant of {}",
                conversation.id
            ))
        })?;

        let latest = match self.cache.latest(conversation.id).await {
            Ok(Some(message)) => Some((message.content, message.timestamp)),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "cache read failed, using durable latest message");
                None
            }
        };
        let latest = match latest {
            Some(found) => Some(found),
            None => self
                .store
                .latest_message(conversation.id)
                .await?
                .map(|row| (row.content, row.created_at)),
        };

        let counterpart_name = self.display_name(&counterpart_id).await;
        let (latest_message, latest_message_time) = latest.unzip();
        Ok(ConversationSummary {
            conversation_id: conversation.id,
            counterpart_id,
            counterpart_name,
            latest_message: latest_message.flatten(),
            latest_message_time,
        })
    }

    /// Summaries of all the user's conversations, most recent activity first.
    ///
    /// Activity is the latest message time, else the conversation's
    /// `updated_at`. With `before`, only conversations active strictly before
    /// it are returned.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub async fn list(
        &self,
        user_id: &UserId,
        before: Option<Timestamp>,
        limit: usize,
    ) -> Result<Vec<ConversationSummary>, ChatError> {
        let conversations = self.store.conversations_for(user_id).await?;
        let mut ranked = Vec::with_capacity(conversations.len());
        for conversation in &conversations {
            let summary = self.summarize(conversation, user_id).await?;
            let activity = summary
                .latest_message_time
                .unwrap_or(conversation.updated_at);
            if before.is_none_or(|before| activity < before) {
                ranked.push((activity, summary));
            }
        }
        ranked.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| b.1.conversation_id.cmp(&a.1.conversation_id))
        });
        Ok(ranked
            .into_iter()
            .take(limit)
            .map(|(_, summary)| summary)
            .collect())
    }
}
