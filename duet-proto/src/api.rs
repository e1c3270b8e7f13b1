//! Request and response bodies of the HTTP API.
//!
//! All bodies are JSON with camelCase field names.

use serde::{Deserialize, Serialize};

use crate::message::{ChatMessage, ConversationId, ConversationSummary, Timestamp, UserId};

/// Header carrying the authenticated caller's user id.
///
/// Credential verification happens upstream; the messaging core trusts
/// this header.
pub const USER_ID_HEADER: &str = "x-user-id";

/// `POST /start-chat` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartChatRequest {
    /// The user to open a direct conversation with.
    pub counterpart_id: UserId,
}

/// `GET /new-chat` query: start a conversation with the user owning `email`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewChatQuery {
    /// Email address of the counterpart.
    pub email: String,
}

/// Whether a start-chat request created the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    /// The conversation was created by this request.
    New,
    /// The conversation already existed.
    Existing,
}

impl ConversationStatus {
    /// Maps the resolver's `is_new` flag onto the wire status.
    #[must_use]
    pub const fn from_is_new(is_new: bool) -> Self {
        if is_new { Self::New } else { Self::Existing }
    }
}

/// Response to a start-chat request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartChatResponse {
    /// The resolved conversation.
    pub conversation_id: ConversationId,
    /// `new` or `existing`.
    #[serde(rename = "type")]
    pub status: ConversationStatus,
    /// The other participant.
    pub counterpart_id: UserId,
    /// Display name of the other participant.
    pub counterpart_name: String,
}

/// Query parameters shared by the paginated endpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageQuery {
    /// Exclusive upper bound; absent means "newest".
    pub before: Option<Timestamp>,
    /// Page size; defaults to the server's configured page size.
    pub limit: Option<usize>,
}

/// `GET /messages/{conversationId}` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryResponse {
    /// Messages, newest first.
    pub messages: Vec<ChatMessage>,
}

/// `GET /chats` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatListResponse {
    /// Conversation summaries, most recently active first.
    pub conversations: Vec<ConversationSummary>,
    /// `true` when `conversations` is empty.
    pub no_data: bool,
}

impl ChatListResponse {
    /// Wraps a page of summaries, deriving the `noData` flag.
    #[must_use]
    pub fn new(conversations: Vec<ConversationSummary>) -> Self {
        let no_data = conversations.is_empty();
        Self {
            conversations,
            no_data,
        }
    }
}

/// JSON body returned with every error status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable machine-readable error code (e.g. `not_found`).
    pub code: String,
    /// Human-readable description.
    pub error: String,
}
