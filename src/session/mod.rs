//! Conversation sessions kept in the key-value store.

pub mod errors;
pub mod manager;
pub mod types;

pub use errors::SessionError;
pub use manager::SessionManager;
pub use types::{Message, Session, SessionStats};
