//! Direct-conversation resolution.
//!
//! Maps an unordered pair of users to the one conversation they share,
//! creating it on first contact. Resolved pairs are cached in memory; the
//! durable store is the authority and serialises concurrent creations.

use std::collections::HashMap;
use std::sync::Arc;

use duet_proto::message::{ConversationId, UserId};
use tokio::sync::RwLock;

use crate::directory::Directory;
use crate::durable::DurableStore;
use crate::error::ChatError;

/// Canonical key for an unordered user pair: the two ids in sorted order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey {
    low: UserId,
    high: UserId,
}

impl PairKey {
    /// Builds the key for `{a, b}`; argument order does not matter.
    #[must_use]
    pub fn new(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    /// The lexicographically smaller id.
    #[must_use]
    pub const fn low(&self) -> &UserId {
        &self.low
    }

    /// The lexicographically larger id.
    #[must_use]
    pub const fn high(&self) -> &UserId {
        &self.high
    }

    /// Both ids in canonical order.
    #[must_use]
    pub fn to_array(&self) -> [UserId; 2] {
        [self.low.clone(), self.high.clone()]
    }

    /// Returns `true` if both ids are the same user.
    #[must_use]
    pub fn is_self_pair(&self) -> bool {
        self.low == self.high
    }
}

impl std::fmt::Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dm:{}:{}", self.low, self.high)
    }
}

/// Result of [`DmResolver::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// The pair's conversation.
    pub conversation_id: ConversationId,
    /// `true` only for the call that created the conversation.
    pub is_new: bool,
}

/// Find-or-create for direct conversations, with a pair cache in front of the
/// durable store.
pub struct DmResolver<S, D> {
    store: Arc<S>,
    directory: Arc<D>,
    cache: RwLock<HashMap<PairKey, ConversationId>>,
}

impl<S: DurableStore, D: Directory> DmResolver<S, D> {
    /// Creates a resolver over the given store and directory.
    #[must_use]
    pub fn new(store: Arc<S>, directory: Arc<D>) -> Self {
        Self {
            store,
            directory,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the conversation for `{a, b}`, creating it if none exists.
    ///
    /// # Errors
    ///
    /// * [`ChatError::InvalidArgument`] if `a == b`.
    /// * [`ChatError::ReferentialIntegrity`] if a new conversation would
    ///   reference a user the directory does not know.
    /// * [`ChatError::Transient`] / [`ChatError::Internal`] on store or
    ///   directory failure.
    pub async fn resolve(&self, a: &UserId, b: &UserId) -> Result<Resolution, ChatError> {
        let pair = PairKey::new(a.clone(), b.clone());
        if pair.is_self_pair() {
            return Err(ChatError::InvalidArgument(format!(
                "cannot open a conversation between {a} and themselves"
            )));
        }

        if let Some(conversation_id) = self.cache.read().await.get(&pair).copied() {
            tracing::debug!(pair = %pair, conversation_id = %conversation_id, "dm cache hit");
            return Ok(Resolution {
                conversation_id,
                is_new: false,
            });
        }

        if let Some(existing) = self.store.find_direct(&pair).await? {
            self.remember(pair, existing.id).await;
            return Ok(Resolution {
                conversation_id: existing.id,
                is_new: false,
            });
        }

        for user in [pair.low(), pair.high()] {
            if self.directory.user_by_id(user).await?.is_none() {
                return Err(ChatError::ReferentialIntegrity(format!(
                    "user {user} does not exist"
                )));
            }
        }

        let created = self.store.create_direct(&pair).await?;
        let conversation_id = created.conversation.id;
        self.remember(pair, conversation_id).await;
        Ok(Resolution {
            conversation_id,
            is_new: created.created,
        })
    }

    /// Number of cached pairs.
    pub async fn cached_pairs(&self) -> usize {
        self.cache.read().await.len()
    }

    async fn remember(&self, pair: PairKey, conversation_id: ConversationId) {
        self.cache.write().await.insert(pair, conversation_id);
    }
}
