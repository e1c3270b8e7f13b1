//! Fan-out delivery of inbound messages.
//!
//! A message is written to the hot cache before it is pushed anywhere, so a
//! message seen by a participant is always readable through history. Pushes
//! use `try_send`: a slow or gone connection loses the frame without holding
//! up the others.

use std::sync::Arc;

use duet_proto::message::{ChatMessage, ConversationSummary};
use duet_proto::stream::{ChatListUpdate, ChatServerFrame};
use tokio::sync::mpsc::error::TrySendError;

use crate::chat_list::{ChatListHub, Summaries};
use crate::directory::Directory;
use crate::durable::DurableStore;
use crate::error::ChatError;
use crate::hot_cache::{AppendOutcome, HotCache};
use crate::sessions::{ConnectionHandle, SessionRegistry};

/// Outcome of a successful delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// The message as stored.
    pub message: ChatMessage,
    /// Connections the message was queued on.
    pub delivered: usize,
    /// Connections whose queue was full or closed.
    pub dropped: usize,
    /// Whether the counterpart's chat list received the summary.
    pub chat_list_notified: bool,
}

/// Persists inbound messages and fans them out to live connections.
pub struct Delivery<S, D> {
    cache: Arc<HotCache>,
    sessions: Arc<SessionRegistry>,
    chat_list: Arc<ChatListHub>,
    summaries: Arc<Summaries<S, D>>,
    max_content_size: usize,
}

impl<S: DurableStore, D: Directory> Delivery<S, D> {
    /// Creates a delivery pipeline.
    #[must_use]
    pub const fn new(
        cache: Arc<HotCache>,
        sessions: Arc<SessionRegistry>,
        chat_list: Arc<ChatListHub>,
        summaries: Arc<Summaries<S, D>>,
        max_content_size: usize,
    ) -> Self {
        Self {
            cache,
            sessions,
            chat_list,
            summaries,
            max_content_size,
        }
    }

    /// Handles one inbound `{content}` frame from `sender`'s connection.
    ///
    /// # Errors
    ///
    /// * [`ChatError::SessionNotFound`] / [`ChatError::Unauthorized`] if the
    ///   sender is no longer authorized; the connection should be closed.
    /// * [`ChatError::ContentTooLarge`] if the content exceeds the limit; the
    ///   message is dropped but the connection may continue.
    /// * [`ChatError::Internal`] if the message cannot be cached.
    pub async fn deliver(
        &self,
        sender: &ConnectionHandle,
        content: Option<String>,
    ) -> Result<DeliveryReport, ChatError> {
        let conversation_id = sender.conversation_id;
        let pair = self.sessions.check(conversation_id, &sender.user_id)?;

        let size = content.as_ref().map_or(0, String::len);
        if size > self.max_content_size {
            tracing::warn!(
                conversation_id = %conversation_id,
                user_id = %sender.user_id,
                size,
                max = self.max_content_size,
                "content exceeds size limit"
            );
            return Err(ChatError::ContentTooLarge {
                size,
                max: self.max_content_size,
            });
        }

        let composed = ChatMessage::compose(conversation_id, sender.user_id.clone(), content);
        let message = match self.cache.append(composed).await? {
            AppendOutcome::Inserted(message) => message,
            AppendOutcome::Duplicate => {
                return Err(ChatError::Internal("message id collision".into()));
            }
        };

        let mut delivered = 0;
        let mut dropped = 0;
        for peer in self.sessions.peers(conversation_id) {
            match peer.sender.try_send(ChatServerFrame::Message(message.clone())) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        user_id = %peer.user_id,
                        connection_id = %peer.connection_id,
                        "outbound queue full, dropping message for connection"
                    );
                    dropped += 1;
                }
                Err(TrySendError::Closed(_)) => dropped += 1,
            }
        }

        let chat_list_notified = match pair.iter().find(|user| **user != sender.user_id) {
            Some(counterpart) => {
                let summary = ConversationSummary {
                    conversation_id,
                    counterpart_id: sender.user_id.clone(),
                    counterpart_name: self.summaries.display_name(&sender.user_id).await,
                    latest_message: message.content.clone(),
                    latest_message_time: Some(message.timestamp),
                };
                self.chat_list
                    .notify(counterpart, ChatListUpdate::summary(summary))
            }
            None => false,
        };

        tracing::debug!(
            conversation_id = %conversation_id,
            message_id = %message.id,
            delivered,
            dropped,
            "message delivered"
        );
        Ok(DeliveryReport {
            message,
            delivered,
            dropped,
            chat_list_notified,
        })
    }
}
