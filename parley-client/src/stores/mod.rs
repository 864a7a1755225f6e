//! In-memory client stores, each bounded by an LRU cache.

mod messages;
mod usernames;

pub use messages::{ChatMessage, MessageStore};
pub use usernames::{short_address, UsernameStore};
