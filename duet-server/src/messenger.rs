//! The messaging core assembled from its components.
//!
//! [`Messenger`] owns one instance of every component and exposes the
//! operations the transport layer calls. It holds no state of its own.

use std::sync::Arc;

use duet_proto::api::{ChatListResponse, ConversationStatus, PageQuery, StartChatResponse};
use duet_proto::message::{ChatMessage, ConversationId, UserId};
use duet_proto::stream::ChatListUpdate;

use crate::chat_list::{
    ChatListHub, ChatListSubscription, SubscriptionGuard, SubscriptionId, Summaries,
};
use crate::delivery::{Delivery, DeliveryReport};
use crate::directory::{Directory, UserProfile};
use crate::durable::DurableStore;
use crate::error::ChatError;
use crate::hot_cache::HotCache;
use crate::resolver::DmResolver;
use crate::retrieval::History;
use crate::sessions::{Attachment, ConnectionGuard, ConnectionHandle, SessionError, SessionRegistry};
use crate::sync::SyncJob;

/// Tunables of the messaging core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessengerSettings {
    /// Hot cache entries kept per conversation after a sync.
    pub cache_capacity: usize,
    /// Page size when none is requested.
    pub default_page_size: usize,
    /// Largest page size served.
    pub max_page_size: usize,
    /// Largest accepted message content, in bytes.
    pub max_content_size: usize,
    /// Depth of each connection's outbound queue.
    pub outbound_queue_size: usize,
}

impl Default for MessengerSettings {
    fn default() -> Self {
        Self {
            cache_capacity: crate::hot_cache::DEFAULT_CAPACITY,
            default_page_size: crate::retrieval::DEFAULT_PAGE_SIZE,
            max_page_size: crate::retrieval::DEFAULT_MAX_PAGE_SIZE,
            max_content_size: duet_proto::message::MAX_CONTENT_SIZE,
            outbound_queue_size: crate::sessions::DEFAULT_OUTBOUND_QUEUE_SIZE,
        }
    }
}

/// Direct-messaging core over a durable store `S` and a user directory `D`.
pub struct Messenger<S, D> {
    store: Arc<S>,
    directory: Arc<D>,
    cache: Arc<HotCache>,
    sessions: Arc<SessionRegistry>,
    chat_list: Arc<ChatListHub>,
    summaries: Arc<Summaries<S, D>>,
    resolver: DmResolver<S, D>,
    delivery: Delivery<S, D>,
    history: History<S>,
    sync: Arc<SyncJob<S>>,
    settings: MessengerSettings,
}

impl<S: DurableStore, D: Directory> Messenger<S, D> {
    /// Wires every component around the given store and directory.
    #[must_use]
    pub fn new(store: Arc<S>, directory: Arc<D>, settings: MessengerSettings) -> Self {
        let cache = Arc::new(HotCache::new(settings.cache_capacity));
        let sessions = Arc::new(SessionRegistry::new(settings.outbound_queue_size));
        let chat_list = Arc::new(ChatListHub::new(settings.outbound_queue_size));
        let summaries = Arc::new(Summaries::new(
            Arc::clone(&cache),
            Arc::clone(&store),
            Arc::clone(&directory),
        ));
        Self {
            resolver: DmResolver::new(Arc::clone(&store), Arc::clone(&directory)),
            delivery: Delivery::new(
                Arc::clone(&cache),
                Arc::clone(&sessions),
                Arc::clone(&chat_list),
                Arc::clone(&summaries),
                settings.max_content_size,
            ),
            history: History::new(
                Arc::clone(&cache),
                Arc::clone(&store),
                settings.default_page_size,
                settings.max_page_size,
            ),
            sync: Arc::new(SyncJob::new(Arc::clone(&cache), Arc::clone(&store))),
            store,
            directory,
            cache,
            sessions,
            chat_list,
            summaries,
            settings,
        }
    }

    /// Settings the core was built with.
    #[must_use]
    pub const fn settings(&self) -> &MessengerSettings {
        &self.settings
    }

    /// The hot cache.
    #[must_use]
    pub const fn cache(&self) -> &Arc<HotCache> {
        &self.cache
    }

    /// The durable store.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The session registry.
    #[must_use]
    pub const fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// The chat-list hub.
    #[must_use]
    pub const fn chat_list(&self) -> &Arc<ChatListHub> {
        &self.chat_list
    }

    /// The sync job.
    #[must_use]
    pub const fn sync_job(&self) -> &Arc<SyncJob<S>> {
        &self.sync
    }

    /// Opens (or reopens) the direct conversation between `caller` and
    /// `counterpart_id`, and authorizes the pair to attach.
    ///
    /// # Errors
    ///
    /// * [`ChatError::PermissionDenied`] when `caller` targets themselves.
    /// * [`ChatError::NotFound`] when the counterpart does not exist.
    /// * [`ChatError::ReferentialIntegrity`] when the caller does not exist.
    pub async fn start_chat(
        &self,
        caller: &UserId,
        counterpart_id: &UserId,
    ) -> Result<StartChatResponse, ChatError> {
        if caller == counterpart_id {
            return Err(ChatError::PermissionDenied(
                "cannot start a chat with yourself".into(),
            ));
        }
        let counterpart = self
            .directory
            .user_by_id(counterpart_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("user {counterpart_id}")))?;
        self.open_with(caller, counterpart).await
    }

    /// Like [`Messenger::start_chat`], addressing the counterpart by email.
    ///
    /// # Errors
    ///
    /// Same as [`Messenger::start_chat`].
    pub async fn start_chat_by_email(
        &self,
        caller: &UserId,
        email: &str,
    ) -> Result<StartChatResponse, ChatError> {
        let counterpart = self
            .directory
            .user_by_email(email)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("user with email {email}")))?;
        if &counterpart.id == caller {
            return Err(ChatError::PermissionDenied(
                "cannot start a chat with yourself".into(),
            ));
        }
        self.open_with(caller, counterpart).await
    }

    async fn open_with(
        &self,
        caller: &UserId,
        counterpart: UserProfile,
    ) -> Result<StartChatResponse, ChatError> {
        let resolution = self.resolver.resolve(caller, &counterpart.id).await?;
        self.sessions.authorize(
            resolution.conversation_id,
            caller.clone(),
            counterpart.id.clone(),
        );
        tracing::info!(
            conversation_id = %resolution.conversation_id,
            user_id = %caller,
            counterpart_id = %counterpart.id,
            is_new = resolution.is_new,
            "chat started"
        );
        if resolution.is_new {
            self.spawn_chat_list_refresh(caller.clone(), resolution.conversation_id);
        }
        Ok(StartChatResponse {
            conversation_id: resolution.conversation_id,
            status: ConversationStatus::from_is_new(resolution.is_new),
            counterpart_id: counterpart.id,
            counterpart_name: counterpart.name,
        })
    }

    /// Pushes the new conversation's summary to its creator's chat list in
    /// the background.
    fn spawn_chat_list_refresh(&self, user_id: UserId, conversation_id: ConversationId) {
        let store = Arc::clone(&self.store);
        let summaries = Arc::clone(&self.summaries);
        let chat_list = Arc::clone(&self.chat_list);
        tokio::spawn(async move {
            let summary = match store.conversation(conversation_id).await {
                Ok(Some(conversation)) => summaries.summarize(&conversation, &user_id).await,
                Ok(None) => return,
                Err(e) => Err(e.into()),
            };
            match summary {
                Ok(summary) => {
                    chat_list.notify(&user_id, ChatListUpdate::summary(summary));
                }
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "chat list refresh failed");
                }
            }
        });
    }

    /// Attaches a live connection for `user_id` to a conversation.
    ///
    /// A conversation without an in-memory session (e.g. after a restart) is
    /// re-authorized from its durable participant pair.
    ///
    /// # Errors
    ///
    /// [`ChatError::SessionNotFound`] for an unknown conversation,
    /// [`ChatError::Unauthorized`] for a non-participant.
    pub async fn attach(
        &self,
        conversation_id: ConversationId,
        user_id: &UserId,
    ) -> Result<Attachment, ChatError> {
        match self.sessions.attach(conversation_id, user_id) {
            Err(SessionError::NotFound(_)) => {}
            other => return other.map_err(ChatError::from),
        }
        let Some(conversation) = self.store.conversation(conversation_id).await? else {
            return Err(ChatError::SessionNotFound(conversation_id));
        };
        let [a, b] = conversation.participants;
        tracing::info!(conversation_id = %conversation_id, "restoring session from durable pair");
        self.sessions.authorize(conversation_id, a, b);
        Ok(self.sessions.attach(conversation_id, user_id)?)
    }

    /// Guard that detaches `handle` when the connection ends.
    #[must_use]
    pub fn guard(&self, handle: ConnectionHandle) -> ConnectionGuard {
        ConnectionGuard::new(Arc::clone(&self.sessions), handle)
    }

    /// Delivers one inbound message from a live connection.
    ///
    /// # Errors
    ///
    /// See [`Delivery::deliver`].
    pub async fn deliver(
        &self,
        sender: &ConnectionHandle,
        content: Option<String>,
    ) -> Result<DeliveryReport, ChatError> {
        self.delivery.deliver(sender, content).await
    }

    /// A page of a conversation's history, newest first.
    ///
    /// # Errors
    ///
    /// See [`History::page_for`].
    pub async fn history(
        &self,
        caller: &UserId,
        conversation_id: ConversationId,
        query: PageQuery,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        self.history.page_for(caller, conversation_id, query).await
    }

    /// The caller's conversations, most recently active first.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub async fn list_chats(
        &self,
        caller: &UserId,
        query: PageQuery,
    ) -> Result<ChatListResponse, ChatError> {
        let limit = self.history.page_size(query.limit);
        let summaries = self.summaries.list(caller, query.before, limit).await?;
        Ok(ChatListResponse::new(summaries))
    }

    /// Opens the caller's chat-list channel.
    #[must_use]
    pub fn subscribe_chat_list(&self, user_id: &UserId) -> ChatListSubscription {
        self.chat_list.subscribe(user_id)
    }

    /// Guard that closes the caller's chat-list channel when the stream ends,
    /// if it is still `subscription`.
    #[must_use]
    pub fn chat_list_guard(&self, user_id: UserId, subscription: SubscriptionId) -> SubscriptionGuard {
        SubscriptionGuard::new(Arc::clone(&self.chat_list), user_id, subscription)
    }

    /// Handles a `StartDirect` request from the chat-list stream.
    ///
    /// Answers with the conversation's summary, or the "no data" sentinel
    /// when the counterpart does not exist or is the caller.
    ///
    /// # Errors
    ///
    /// Store and directory failures.
    pub async fn start_direct(
        &self,
        caller: &UserId,
        counterpart_id: &UserId,
    ) -> Result<ChatListUpdate, ChatError> {
        let started = match self.start_chat(caller, counterpart_id).await {
            Ok(started) => started,
            Err(ChatError::NotFound(_) | ChatError::PermissionDenied(_)) => {
                return Ok(ChatListUpdate::no_data());
            }
            Err(e) => return Err(e),
        };
        let Some(conversation) = self.store.conversation(started.conversation_id).await? else {
            return Ok(ChatListUpdate::no_data());
        };
        let summary = self.summaries.summarize(&conversation, caller).await?;
        Ok(ChatListUpdate::summary(summary))
    }

    /// Closes every live connection and chat-list channel.
    pub fn close_all(&self) {
        self.sessions.close_all();
        self.chat_list.close_all();
    }
}
