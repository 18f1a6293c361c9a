//! Key-value store capability.
//!
//! The core never talks to a concrete key-value engine. Sessions, cached tool
//! results, rate-limit windows, cost counters and confirmation slots all go
//! through [`KvStore`], which mirrors the small subset of Redis-style commands
//! the core actually needs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use super::errors::StoreError;

/// Minimal key-value capability used by the assistant core.
///
/// List indices follow the Redis convention: negative values count from the
/// end (`-1` is the last element) and ranges are inclusive on both ends.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;

    // ─── Strings ─────────────────────────────────────────────────────────

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set a string value, replacing whatever the key held. `ttl = None` keeps it forever.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Delete keys; returns how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError>;

    /// Atomically read and delete a string value.
    async fn take(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Atomically increment an integer value (missing keys start at 0).
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Set a TTL on an existing key. Returns `false` if the key is missing.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Remaining TTL, or `None` for missing keys and keys without expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    // ─── Hashes ──────────────────────────────────────────────────────────

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError>;

    async fn hincr_by_float(&self, key: &str, field: &str, delta: f64) -> Result<f64, StoreError>;

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    // ─── Lists ───────────────────────────────────────────────────────────

    /// Append to the tail of a list; returns the new length.
    async fn rpush(&self, key: &str, value: &str) -> Result<u64, StoreError>;

    /// Keep only the elements in `[start, stop]`.
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError>;

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError>;

    async fn llen(&self, key: &str) -> Result<u64, StoreError>;

    // ─── Sets ────────────────────────────────────────────────────────────

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    // ─── Sorted sets ─────────────────────────────────────────────────────

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Members with `min <= score <= max`, ascending by score.
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64)
        -> Result<Vec<String>, StoreError>;

    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;

    // ─── Keyspace ────────────────────────────────────────────────────────

    /// All live keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Resolve a Redis-style inclusive `[start, stop]` range against a length.
///
/// Returns `None` when the range selects nothing.
pub(crate) fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len_i = len as i64;
    let norm = |idx: i64| if idx < 0 { len_i + idx } else { idx };
    let start = norm(start).max(0);
    let stop = norm(stop).min(len_i - 1);
    if start > stop || start >= len_i {
        return None;
    }
    Some((start as usize, stop as usize))
}
