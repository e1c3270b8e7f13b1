//! Duet messaging server library.
//!
//! Exposes the messaging core (DM resolution, session registry, fan-out
//! delivery, hot cache, retrieval, chat-list notifications and the sync job)
//! and the axum server wrapping it, for use in tests and embedding.

pub mod chat_list;
pub mod config;
pub mod delivery;
pub mod directory;
pub mod durable;
pub mod error;
pub mod hot_cache;
pub mod messenger;
pub mod resolver;
pub mod retrieval;
pub mod server;
pub mod sessions;
pub mod shard;
pub mod sync;
