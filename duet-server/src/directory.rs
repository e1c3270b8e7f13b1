//! User directory collaborator.
//!
//! The messaging core never owns user accounts; it only needs to check that a
//! user exists and to read a display name. [`Directory`] exposes exactly the
//! two typed lookups the core performs. [`MemoryDirectory`] is the in-process
//! implementation, seeded from the `[[users]]` section of the config file.

use std::collections::HashMap;
use std::future::Future;

use duet_proto::message::UserId;
use tokio::sync::RwLock;

/// Errors returned by a directory backend.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    /// The backend could not be reached.
    #[error("user directory unavailable: {0}")]
    Unavailable(String),
}

/// Public profile of a user.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct UserProfile {
    /// Stable user identifier.
    pub id: UserId,
    /// Display name shown to the other participant.
    pub name: String,
    /// Login email address.
    pub email: String,
}

impl UserProfile {
    /// Creates a profile.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            name: name.into(),
            email: email.into(),
        }
    }
}

/// Identity lookups consumed by the messaging core.
pub trait Directory: Send + Sync + 'static {
    /// Looks up a user by id. `Ok(None)` means the user does not exist.
    fn user_by_id(
        &self,
        id: &UserId,
    ) -> impl Future<Output = Result<Option<UserProfile>, DirectoryError>> + Send;

    /// Looks up a user by email address (case-insensitive).
    fn user_by_email(
        &self,
        email: &str,
    ) -> impl Future<Output = Result<Option<UserProfile>, DirectoryError>> + Send;
}

/// In-memory [`Directory`].
#[derive(Default)]
pub struct MemoryDirectory {
    users: RwLock<Users>,
}

#[derive(Default)]
struct Users {
    by_id: HashMap<UserId, UserProfile>,
    id_by_email: HashMap<String, UserId>,
}

impl MemoryDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a directory holding the given profiles.
    #[must_use]
    pub fn with_users(profiles: impl IntoIterator<Item = UserProfile>) -> Self {
        let mut users = Users::default();
        for profile in profiles {
            users.insert(profile);
        }
        Self {
            users: RwLock::new(users),
        }
    }

    /// Adds or replaces a profile.
    pub async fn insert(&self, profile: UserProfile) {
        self.users.write().await.insert(profile);
    }

    /// Number of known users.
    pub async fn len(&self) -> usize {
        self.users.read().await.by_id.len()
    }

    /// Returns `true` if no users are known.
    pub async fn is_empty(&self) -> bool {
        self.users.read().await.by_id.is_empty()
    }
}

impl Users {
    fn insert(&mut self, profile: UserProfile) {
        if let Some(previous) = self.by_id.get(&profile.id) {
            self.id_by_email.remove(&previous.email.to_lowercase());
        }
        self.id_by_email
            .insert(profile.email.to_lowercase(), profile.id.clone());
        self.by_id.insert(profile.id.clone(), profile);
    }
}

impl Directory for MemoryDirectory {
    async fn user_by_id(&self, id: &UserId) -> Result<Option<UserProfile>, DirectoryError> {
        Ok(self.users.read().await.by_id.get(id).cloned())
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<UserProfile>, DirectoryError> {
        let users = self.users.read().await;
        Ok(users
            .id_by_email
            .get(&email.to_lowercase())
            .and_then(|id| users.by_id.get(id))
            .cloned())
    }
}
