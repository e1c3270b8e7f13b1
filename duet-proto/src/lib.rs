//! Shared protocol definitions for the Duet messaging backend.

pub mod api;
pub mod codec;
pub mod message;
pub mod stream;
