//! Storage capabilities.
//!
//! Submodules:
//! - `kv`: the key-value capability (`KvStore`) used for sessions, cache,
//!   rate-limit windows, cost counters and confirmation slots
//! - `memory`: in-process `KvStore` implementation
//! - `database`: SQLite store for configuration rows
//! - `records`: row shapes shared across areas
//! - `errors`: storage error types

pub mod database;
pub mod errors;
pub mod kv;
pub mod memory;
pub mod records;

pub use database::AssistantDatabase;
pub use errors::StoreError;
pub use kv::KvStore;
pub use memory::MemoryKvStore;
pub use records::{ConfigRow, HealthRecord, HealthState, OptimizationConfigRow};
