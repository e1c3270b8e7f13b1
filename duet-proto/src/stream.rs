//! Frames exchanged over the two WebSocket streams.
//!
//! * `/private-chat` carries [`ChatClientFrame`] inbound and
//!   [`ChatServerFrame`] outbound for one conversation.
//! * `/chat-list/stream` carries [`ChatListClientFrame`] inbound and
//!   [`ChatListServerFrame`] outbound for one user.
//!
//! The first inbound frame of each stream is the handshake (`Join` and
//! `Subscribe` respectively).

use serde::{Deserialize, Serialize};

use crate::message::{ChatMessage, ConversationId, ConversationSummary, UserId};

/// Client-to-server frames on a conversation stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatClientFrame {
    /// Handshake: attach to a conversation as the given user.
    Join {
        /// Conversation to attach to.
        conversation_id: ConversationId,
        /// The attaching user.
        user_id: UserId,
    },
    /// Send a message into the conversation.
    Send {
        /// Message content.
        content: Option<String>,
    },
}

/// Server-to-client frames on a conversation stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatServerFrame {
    /// Handshake accepted; the connection is live.
    Joined {
        /// The attached conversation.
        conversation_id: ConversationId,
    },
    /// A message delivered to this connection.
    Message(ChatMessage),
    /// A system notice. Terminal notices are followed by a close frame.
    Notice(Notice),
}

/// A system notice sent on a conversation stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    /// What happened.
    pub code: NoticeCode,
    /// Human-readable description.
    pub text: String,
}

impl Notice {
    /// Creates a notice.
    #[must_use]
    pub fn new(code: NoticeCode, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    /// Returns `true` if the server closes the stream after this notice.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self.code, NoticeCode::ContentTooLarge)
    }
}

/// Reason codes for [`Notice`] frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoticeCode {
    /// No authorized session exists for the conversation.
    SessionNotFound,
    /// The user is not a participant of the conversation.
    Unauthorized,
    /// The handshake frame was missing or malformed.
    InvalidHandshake,
    /// The message content exceeded the size limit; the message was dropped.
    ContentTooLarge,
    /// The server failed to process the message.
    Internal,
}

/// Client-to-server frames on the chat-list stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatListClientFrame {
    /// Handshake: subscribe to chat-list updates for a user.
    Subscribe {
        /// The subscribing user.
        user_id: UserId,
    },
    /// Start (or reopen) a direct conversation with another user.
    StartDirect {
        /// The other user.
        counterpart_id: UserId,
    },
}

/// Server-to-client frames on the chat-list stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatListServerFrame {
    /// Handshake accepted.
    Subscribed {
        /// The subscribed user.
        user_id: UserId,
    },
    /// A conversation summary changed, or a reply to `StartDirect`.
    Update(ChatListUpdate),
}

/// Payload of a chat-list update: a summary or the "no data" sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatListUpdate {
    /// The updated summary, absent for the sentinel.
    pub data: Option<ConversationSummary>,
    /// `true` for the sentinel.
    pub no_data: bool,
}

impl ChatListUpdate {
    /// Wraps a summary.
    #[must_use]
    pub const fn summary(summary: ConversationSummary) -> Self {
        Self {
            data: Some(summary),
            no_data: false,
        }
    }

    /// The "no data" sentinel.
    #[must_use]
    pub const fn no_data() -> Self {
        Self {
            data: None,
            no_data: true,
        }
    }
}
