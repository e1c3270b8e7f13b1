//! Durable message store: the source of truth for conversations, participant
//! pairs and messages.
//!
//! [`DurableStore`] is the contract the core consumes. [`LogStore`] implements
//! it as an append-only log of [`LogRecord`]s with in-memory indexes. It runs
//! either purely in memory or journaled to a JSON-lines file that is replayed
//! on open.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};

use duet_proto::message::{ChatMessage, ConversationId, MessageId, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use crate::resolver::PairKey;

/// Errors returned by a durable store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing storage could not be read or written.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Stored data could not be decoded, or a write violated the schema.
    #[error("store corrupt: {0}")]
    Corrupt(String),
}

/// Kind of conversation. Only direct (two-party) conversations exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationKind {
    /// A conversation between exactly two users.
    Direct,
}

/// A conversation row with its participant pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredConversation {
    /// Conversation id.
    pub id: ConversationId,
    /// Conversation kind.
    pub kind: ConversationKind,
    /// Both participants, in canonical (sorted) order.
    pub participants: [UserId; 2],
    /// Creation time.
    pub created_at: Timestamp,
    /// Time of the latest durable change (creation or newest message).
    pub updated_at: Timestamp,
}

impl StoredConversation {
    /// Returns `true` if `user` is one of the two participants.
    #[must_use]
    pub fn has_participant(&self, user: &UserId) -> bool {
        self.participants.contains(user)
    }

    /// Returns the participant that is not `user`, if `user` participates.
    #[must_use]
    pub fn counterpart(&self, user: &UserId) -> Option<&UserId> {
        match &self.participants {
            [a, b] if a == user => Some(b),
            [a, b] if b == user => Some(a),
            _ => None,
        }
    }
}

/// A message row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableMessage {
    /// Message id; unique across the store.
    pub id: MessageId,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Sender.
    pub sender_id: UserId,
    /// Textual content.
    pub content: Option<String>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Soft-delete flag; deleted rows are never returned by reads.
    #[serde(default)]
    pub deleted: bool,
}

impl From<&ChatMessage> for DurableMessage {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            id: msg.id,
            conversation_id: msg.conversation_id,
            sender_id: msg.sender_id.clone(),
            content: msg.content.clone(),
            created_at: msg.timestamp,
            deleted: false,
        }
    }
}

impl From<DurableMessage> for ChatMessage {
    fn from(row: DurableMessage) -> Self {
        Self {
            id: row.id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            content: row.content,
            timestamp: row.created_at,
        }
    }
}

/// Result of [`DurableStore::create_direct`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedConversation {
    /// The conversation for the pair.
    pub conversation: StoredConversation,
    /// `false` if a conversation for the pair already existed.
    pub created: bool,
}

/// Storage contract consumed by the messaging core.
pub trait DurableStore: Send + Sync + 'static {
    /// Finds the direct conversation whose participant set equals `pair`.
    fn find_direct(
        &self,
        pair: &PairKey,
    ) -> impl Future<Output = Result<Option<StoredConversation>, StoreError>> + Send;

    /// Creates the direct conversation for `pair`, or returns the existing one.
    ///
    /// Atomic: concurrent calls for the same pair yield one conversation.
    fn create_direct(
        &self,
        pair: &PairKey,
    ) -> impl Future<Output = Result<CreatedConversation, StoreError>> + Send;

    /// Loads a conversation by id.
    fn conversation(
        &self,
        id: ConversationId,
    ) -> impl Future<Output = Result<Option<StoredConversation>, StoreError>> + Send;

    /// All conversations `user` participates in.
    fn conversations_for(
        &self,
        user: &UserId,
    ) -> impl Future<Output = Result<Vec<StoredConversation>, StoreError>> + Send;

    /// Inserts messages, skipping ids that are already stored.
    ///
    /// Returns the number of rows actually inserted. Fails without inserting
    /// anything if a message references an unknown conversation.
    fn insert_messages(
        &self,
        batch: Vec<DurableMessage>,
    ) -> impl Future<Output = Result<usize, StoreError>> + Send;

    /// Up to `limit` non-deleted messages strictly older than `before`,
    /// newest first.
    fn messages_before(
        &self,
        conversation_id: ConversationId,
        before: Timestamp,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<DurableMessage>, StoreError>> + Send;

    /// The newest non-deleted message of a conversation.
    fn latest_message(
        &self,
        conversation_id: ConversationId,
    ) -> impl Future<Output = Result<Option<DurableMessage>, StoreError>> + Send;
}

/// One entry of the append-only log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    /// A conversation was created.
    Conversation(StoredConversation),
    /// A message was made durable.
    Message(DurableMessage),
}

/// In-memory indexes rebuilt from the log.
#[derive(Default)]
struct LogState {
    conversations: HashMap<ConversationId, StoredConversation>,
    by_pair: HashMap<PairKey, ConversationId>,
    by_user: HashMap<UserId, Vec<ConversationId>>,
    messages: HashMap<ConversationId, BTreeMap<(Timestamp, MessageId), DurableMessage>>,
    message_ids: HashSet<MessageId>,
}

impl LogState {
    fn apply(&mut self, record: LogRecord) {
        match record {
            LogRecord::Conversation(conversation) => {
                let [a, b] = &conversation.participants;
                self.by_pair
                    .insert(PairKey::new(a.clone(), b.clone()), conversation.id);
                for user in &conversation.participants {
                    self.by_user
                        .entry(user.clone())
                        .or_default()
                        .push(conversation.id);
                }
                self.conversations.insert(conversation.id, conversation);
            }
            LogRecord::Message(message) => {
                if !self.message_ids.insert(message.id) {
                    return;
                }
                if let Some(conversation) = self.conversations.get_mut(&message.conversation_id) {
                    conversation.updated_at = conversation.updated_at.max(message.created_at);
                }
                self.messages
                    .entry(message.conversation_id)
                    .or_default()
                    .insert((message.created_at, message.id), message);
            }
        }
    }

    fn find_direct(&self, pair: &PairKey) -> Option<StoredConversation> {
        self.by_pair
            .get(pair)
            .and_then(|id| self.conversations.get(id))
            .cloned()
    }

    /// Filters a batch down to the rows that would actually be inserted.
    fn fresh_rows(&self, batch: Vec<DurableMessage>) -> Result<Vec<LogRecord>, StoreError> {
        let mut seen = HashSet::new();
        let mut records = Vec::with_capacity(batch.len());
        for message in batch {
            if !self.conversations.contains_key(&message.conversation_id) {
                return Err(StoreError::Corrupt(format!(
                    "message {} references unknown conversation {}",
                    message.id, message.conversation_id
                )));
            }
            if self.message_ids.contains(&message.id) || !seen.insert(message.id) {
                continue;
            }
            records.push(LogRecord::Message(message));
        }
        Ok(records)
    }
}

/// Append-only [`DurableStore`] with an optional JSON-lines journal.
pub struct LogStore {
    state: RwLock<LogState>,
    journal: Option<Journal>,
}

struct Journal {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl LogStore {
    /// Creates a store that keeps everything in process memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(LogState::default()),
            journal: None,
        }
    }

    /// Opens (or creates) a journaled store at `path`, replaying its records.
    ///
    /// A malformed final line is treated as a torn write and cut from the
    /// file before appending resumes; a malformed line anywhere else is an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the file cannot be read or
    /// opened, or [`StoreError::Corrupt`] if a record cannot be decoded.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| unavailable(&path, &e))?;
        }

        let mut state = LogState::default();
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(unavailable(&path, &e)),
        };
        let segments: Vec<&[u8]> = contents.split_inclusive(|b| *b == b'\n').collect();
        let last = segments
            .iter()
            .rposition(|segment| !segment.trim_ascii().is_empty())
            .unwrap_or(0);

        // Byte length of the replayable prefix.
        let mut valid_len = 0;
        let mut torn = false;
        let mut needs_newline = false;
        for (index, segment) in segments.iter().enumerate() {
            let line = segment.trim_ascii();
            if line.is_empty() {
                valid_len += segment.len();
                continue;
            }
            match serde_json::from_slice::<LogRecord>(line) {
                Ok(record) => {
                    state.apply(record);
                    valid_len += segment.len();
                    needs_newline = !segment.ends_with(b"\n");
                }
                Err(e) if index == last => {
                    tracing::warn!(path = %path.display(), error = %e, "truncating torn final log record");
                    torn = true;
                    break;
                }
                Err(e) => {
                    return Err(StoreError::Corrupt(format!(
                        "{} line {}: {e}",
                        path.display(),
                        index + 1
                    )));
                }
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| unavailable(&path, &e))?;
        if torn {
            file.set_len(valid_len as u64)
                .await
                .map_err(|e| unavailable(&path, &e))?;
        }
        if needs_newline {
            file.write_all(b"\n")
                .await
                .map_err(|e| unavailable(&path, &e))?;
        }
        if torn || needs_newline {
            file.sync_data().await.map_err(|e| unavailable(&path, &e))?;
        }

        tracing::info!(
            path = %path.display(),
            conversations = state.conversations.len(),
            messages = state.message_ids.len(),
            "durable log loaded"
        );

        Ok(Self {
            state: RwLock::new(state),
            journal: Some(Journal {
                path,
                file: Mutex::new(file),
            }),
        })
    }

    /// Writes records to the journal (if any), then applies them.
    ///
    /// The caller holds the state write lock, so journal order matches apply
    /// order.
    async fn commit(&self, state: &mut LogState, records: Vec<LogRecord>) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        if let Some(journal) = &self.journal {
            let mut buf = Vec::new();
            for record in &records {
                serde_json::to_writer(&mut buf, record)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                buf.push(b'\n');
            }
            let mut file = journal.file.lock().await;
            file.write_all(&buf)
                .await
                .map_err(|e| unavailable(&journal.path, &e))?;
            file.sync_data()
                .await
                .map_err(|e| unavailable(&journal.path, &e))?;
        }
        for record in records {
            state.apply(record);
        }
        Ok(())
    }
}

fn unavailable(path: &Path, err: &std::io::Error) -> StoreError {
    StoreError::Unavailable(format!("{}: {err}", path.display()))
}

impl DurableStore for LogStore {
    async fn find_direct(&self, pair: &PairKey) -> Result<Option<StoredConversation>, StoreError> {
        Ok(self.state.read().await.find_direct(pair))
    }

    async fn create_direct(&self, pair: &PairKey) -> Result<CreatedConversation, StoreError> {
        let mut state = self.state.write().await;
        if let Some(conversation) = state.find_direct(pair) {
            return Ok(CreatedConversation {
                conversation,
                created: false,
            });
        }
        let now = Timestamp::now();
        let conversation = StoredConversation {
            id: ConversationId::new(),
            kind: ConversationKind::Direct,
            participants: pair.to_array(),
            created_at: now,
            updated_at: now,
        };
        self.commit(&mut state, vec![LogRecord::Conversation(conversation.clone())])
            .await?;
        drop(state);
        tracing::info!(
            conversation_id = %conversation.id,
            user_a = %conversation.participants[0],
            user_b = %conversation.participants[1],
            "direct conversation created"
        );
        Ok(CreatedConversation {
            conversation,
            created: true,
        })
    }

    async fn conversation(&self, id: ConversationId) -> Result<Option<StoredConversation>, StoreError> {
        Ok(self.state.read().await.conversations.get(&id).cloned())
    }

    async fn conversations_for(&self, user: &UserId) -> Result<Vec<StoredConversation>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .by_user
            .get(user)
            .into_iter()
            .flatten()
            .filter_map(|id| state.conversations.get(id))
            .cloned()
            .collect())
    }

    async fn insert_messages(&self, batch: Vec<DurableMessage>) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        let records = state.fresh_rows(batch)?;
        let inserted = records.len();
        self.commit(&mut state, records).await?;
        Ok(inserted)
    }

    async fn messages_before(
        &self,
        conversation_id: ConversationId,
        before: Timestamp,
        limit: usize,
    ) -> Result<Vec<DurableMessage>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .get(&conversation_id)
            .map(|rows| {
                rows.range(..(before, MessageId::MIN))
                    .rev()
                    .map(|(_, row)| row)
                    .filter(|row| !row.deleted)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn latest_message(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<DurableMessage>, StoreError> {
        let state = self.state.read().await;
        Ok(state.messages.get(&conversation_id).and_then(|rows| {
            rows.values().rev().find(|row| !row.deleted).cloned()
        }))
    }
}
