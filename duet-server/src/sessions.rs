//! Authorized sessions and live connections.
//!
//! A session records which two users may use a conversation. Each attached
//! WebSocket is a live connection with its own bounded outbound queue; a user
//! may hold several connections to the same conversation (multiple devices).
//!
//! State is partitioned by conversation id across [`Sharded`] partitions.
//! Empty per-user and per-conversation maps are removed as soon as their last
//! connection detaches.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use duet_proto::message::{ConversationId, UserId};
use duet_proto::stream::ChatServerFrame;
use tokio::sync::mpsc;

use crate::shard::Sharded;

/// Default capacity of each connection's outbound queue.
pub const DEFAULT_OUTBOUND_QUEUE_SIZE: usize = 256;

/// Errors returned by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No authorized session exists for the conversation.
    #[error("chat session not found for conversation {0}")]
    NotFound(ConversationId),

    /// The user is not one of the conversation's two participants.
    #[error("user {user_id} is not a participant of conversation {conversation_id}")]
    Unauthorized {
        /// The conversation.
        conversation_id: ConversationId,
        /// The rejected user.
        user_id: UserId,
    },
}

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identifies one live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    /// Conversation the connection is attached to.
    pub conversation_id: ConversationId,
    /// The attached user.
    pub user_id: UserId,
    /// The connection itself.
    pub connection_id: ConnectionId,
}

/// A successful attach: the handle plus the receiving end of the outbound
/// queue, to be drained by the connection's writer task.
#[derive(Debug)]
pub struct Attachment {
    /// Handle of the new connection.
    pub handle: ConnectionHandle,
    /// Frames to write to the socket, in delivery order.
    pub outbound: mpsc::Receiver<ChatServerFrame>,
}

/// Lifecycle of a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered; the handshake reply has not been sent yet.
    Attached,
    /// Handshake complete; frames are flowing.
    Streaming,
    /// Removed from the registry.
    Detached,
}

/// A live outbound queue, as seen by fan-out.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Owner of the connection.
    pub user_id: UserId,
    /// The connection.
    pub connection_id: ConnectionId,
    /// Sending end of the connection's outbound queue.
    pub sender: mpsc::Sender<ChatServerFrame>,
}

type UserConnections = HashMap<ConnectionId, mpsc::Sender<ChatServerFrame>>;

#[derive(Default)]
struct Partition {
    sessions: HashMap<ConversationId, [UserId; 2]>,
    live: HashMap<ConversationId, HashMap<UserId, UserConnections>>,
}

/// Registry of authorized sessions and live connections.
pub struct SessionRegistry {
    partitions: Sharded<Partition>,
    next_connection: AtomicU64,
    queue_size: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOUND_QUEUE_SIZE)
    }
}

impl SessionRegistry {
    /// Creates an empty registry whose connections get `queue_size`-deep
    /// outbound queues.
    #[must_use]
    pub fn new(queue_size: usize) -> Self {
        Self {
            partitions: Sharded::default(),
            next_connection: AtomicU64::new(1),
            queue_size: queue_size.max(1),
        }
    }

    /// Records `{a, b}` as the allowed pair for a conversation, replacing any
    /// previous record.
    pub fn authorize(&self, conversation_id: ConversationId, a: UserId, b: UserId) {
        tracing::debug!(conversation_id = %conversation_id, user_a = %a, user_b = %b, "session authorized");
        self.partitions
            .lock(&conversation_id)
            .sessions
            .insert(conversation_id, [a, b]);
    }

    /// The authorized pair of a conversation.
    #[must_use]
    pub fn participants(&self, conversation_id: ConversationId) -> Option<[UserId; 2]> {
        self.partitions
            .lock(&conversation_id)
            .sessions
            .get(&conversation_id)
            .cloned()
    }

    /// Checks that `user_id` may use the conversation.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotFound`] if no session exists,
    /// [`SessionError::Unauthorized`] if the user is not in the pair.
    pub fn check(
        &self,
        conversation_id: ConversationId,
        user_id: &UserId,
    ) -> Result<[UserId; 2], SessionError> {
        let pair = self
            .participants(conversation_id)
            .ok_or(SessionError::NotFound(conversation_id))?;
        if pair.contains(user_id) {
            Ok(pair)
        } else {
            Err(SessionError::Unauthorized {
                conversation_id,
                user_id: user_id.clone(),
            })
        }
    }

    /// Registers a new live connection for an authorized user.
    ///
    /// # Errors
    ///
    /// Same as [`SessionRegistry::check`].
    pub fn attach(
        &self,
        conversation_id: ConversationId,
        user_id: &UserId,
    ) -> Result<Attachment, SessionError> {
        let mut partition = self.partitions.lock(&conversation_id);
        let pair = partition
            .sessions
            .get(&conversation_id)
            .ok_or(SessionError::NotFound(conversation_id))?;
        if !pair.contains(user_id) {
            return Err(SessionError::Unauthorized {
                conversation_id,
                user_id: user_id.clone(),
            });
        }

        let connection_id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.queue_size);
        partition
            .live
            .entry(conversation_id)
            .or_default()
            .entry(user_id.clone())
            .or_default()
            .insert(connection_id, tx);
        drop(partition);

        tracing::info!(
            conversation_id = %conversation_id,
            user_id = %user_id,
            connection_id = %connection_id,
            "connection attached"
        );
        Ok(Attachment {
            handle: ConnectionHandle {
                conversation_id,
                user_id: user_id.clone(),
                connection_id,
            },
            outbound: rx,
        })
    }

    /// Removes exactly the given connection, then any map it leaves empty.
    ///
    /// Returns `true` if the connection was still registered.
    pub fn detach(&self, handle: &ConnectionHandle) -> bool {
        let mut partition = self.partitions.lock(&handle.conversation_id);
        let Some(users) = partition.live.get_mut(&handle.conversation_id) else {
            return false;
        };
        let removed = users
            .get_mut(&handle.user_id)
            .is_some_and(|conns| conns.remove(&handle.connection_id).is_some());
        if users.get(&handle.user_id).is_some_and(HashMap::is_empty) {
            users.remove(&handle.user_id);
        }
        if users.is_empty() {
            partition.live.remove(&handle.conversation_id);
        }
        drop(partition);

        if removed {
            tracing::info!(
                conversation_id = %handle.conversation_id,
                user_id = %handle.user_id,
                connection_id = %handle.connection_id,
                "connection detached"
            );
        }
        removed
    }

    /// Snapshot of every live connection of a conversation.
    #[must_use]
    pub fn peers(&self, conversation_id: ConversationId) -> Vec<Peer> {
        let partition = self.partitions.lock(&conversation_id);
        partition
            .live
            .get(&conversation_id)
            .map(|users| {
                users
                    .iter()
                    .flat_map(|(user_id, conns)| {
                        conns.iter().map(|(connection_id, sender)| Peer {
                            user_id: user_id.clone(),
                            connection_id: *connection_id,
                            sender: sender.clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of live connections of `user_id` in a conversation.
    #[must_use]
    pub fn connection_count(&self, conversation_id: ConversationId, user_id: &UserId) -> usize {
        self.partitions
            .lock(&conversation_id)
            .live
            .get(&conversation_id)
            .and_then(|users| users.get(user_id))
            .map_or(0, HashMap::len)
    }

    /// Number of conversations with at least one live connection.
    #[must_use]
    pub fn live_conversations(&self) -> usize {
        let mut total = 0;
        self.partitions.for_each(|p| total += p.live.len());
        total
    }

    /// Drops every live connection. Writers see their queue close and shut
    /// the socket down. Sessions are kept.
    ///
    /// Returns the number of connections dropped.
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        self.partitions.for_each(|p| {
            closed += p
                .live
                .drain()
                .flat_map(|(_, users)| users.into_values())
                .map(|conns| conns.len())
                .sum::<usize>();
        });
        tracing::info!(connections = closed, "closed all live connections");
        closed
    }
}

/// Detaches its connection exactly once, when told to or when dropped.
///
/// Held by the task that owns a connection so that cleanup runs on every exit
/// path, including panics and task aborts.
pub struct ConnectionGuard {
    registry: Arc<SessionRegistry>,
    handle: ConnectionHandle,
    state: ConnectionState,
}

impl ConnectionGuard {
    /// Wraps a freshly attached connection.
    #[must_use]
    pub const fn new(registry: Arc<SessionRegistry>, handle: ConnectionHandle) -> Self {
        Self {
            registry,
            handle,
            state: ConnectionState::Attached,
        }
    }

    /// The guarded connection.
    #[must_use]
    pub const fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Marks the handshake as complete.
    pub fn mark_streaming(&mut self) {
        if self.state == ConnectionState::Attached {
            self.state = ConnectionState::Streaming;
        }
    }

    /// Detaches now. Later calls (and the drop) are no-ops.
    pub fn detach(&mut self) {
        if self.state != ConnectionState::Detached {
            self.registry.detach(&self.handle);
            self.state = ConnectionState::Detached;
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.detach();
    }
}
