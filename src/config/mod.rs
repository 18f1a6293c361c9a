//! Configuration: bootstrap settings, stored config rows and hot reload.

pub mod env;
pub mod errors;
pub mod loader;
pub mod settings;

pub use errors::ConfigError;
pub use loader::{ConfigLoader, Reloadable, DEFAULT_CONFIG_KEY, DEFAULT_POLL_INTERVAL};
pub use settings::{AssistantSettings, SessionSettings};
