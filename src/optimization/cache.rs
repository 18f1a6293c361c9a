//! Result cache for idempotent tools.
//!
//! Keys are `ai:cache:<tool>:<hex of the first 8 bytes of sha256(args json)>`.
//! Argument maps serialize with sorted keys, so maps equal as JSON share a key.
//! Store failures degrade to a miss.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::config::CacheConfig;
use crate::storage::{KvStore, StoreError};

const CACHE_PREFIX: &str = "ai:cache:";

/// Keys deleted per batch by `clear`.
const DELETE_BATCH: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    pub result: Value,
    pub cached_at: i64,
    pub expires_at: i64,
    pub tool_name: String,
}

pub fn cache_key(tool: &str, args: &Value) -> String {
    let canonical = serde_json::to_string(args).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{CACHE_PREFIX}{tool}:{hex}")
}

pub struct ToolCache {
    kv: Arc<dyn KvStore>,
    config: RwLock<Arc<CacheConfig>>,
}

impl ToolCache {
    pub fn new(kv: Arc<dyn KvStore>, config: CacheConfig) -> Self {
        Self {
            kv,
            config: RwLock::new(Arc::new(config)),
        }
    }

    pub fn config(&self) -> Arc<CacheConfig> {
        self.config
            .read()
            .map(|c| Arc::clone(&c))
            .unwrap_or_default()
    }

    pub fn update_config(&self, config: CacheConfig) {
        if let Ok(mut guard) = self.config.write() {
            *guard = Arc::new(config);
        }
    }

    pub fn is_cacheable(&self, tool: &str) -> bool {
        self.config().is_cacheable(tool)
    }

    /// Cached result for this call, if any and still fresh.
    pub async fn get(&self, tool: &str, args: &Value) -> Option<Value> {
        if !self.is_cacheable(tool) {
            return None;
        }
        let key = cache_key(tool, args);
        let raw = match self.kv.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(tool, error = %e, "cache read failed, treating as miss");
                return None;
            }
        };
        let entry: CachedResult = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(tool, error = %e, "corrupt cache entry");
                return None;
            }
        };
        if entry.expires_at <= chrono::Utc::now().timestamp() {
            return None;
        }
        tracing::debug!(tool, "cache hit");
        Some(entry.result)
    }

    /// Store a result. Non-idempotent tools are ignored.
    pub async fn set(&self, tool: &str, args: &Value, result: &Value) {
        let config = self.config();
        if !config.is_cacheable(tool) {
            return;
        }
        let ttl = config.ttl_secs(tool);
        let now = chrono::Utc::now().timestamp();
        let entry = CachedResult {
            result: result.clone(),
            cached_at: now,
            expires_at: now + ttl as i64,
            tool_name: tool.to_string(),
        };
        let raw = match serde_json::to_string(&entry) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(tool, error = %e, "failed to serialize cache entry");
                return;
            }
        };
        let key = cache_key(tool, args);
        if let Err(e) = self
            .kv
            .set(&key, &raw, Some(Duration::from_secs(ttl.max(1))))
            .await
        {
            tracing::warn!(tool, error = %e, "cache write failed");
        }
    }

    /// Drop every cached result for one tool.
    pub async fn invalidate(&self, tool: &str) -> Result<u64, StoreError> {
        self.delete_prefix(&format!("{CACHE_PREFIX}{tool}:")).await
    }

    /// Drop every cached result.
    pub async fn clear(&self) -> Result<u64, StoreError> {
        self.delete_prefix(CACHE_PREFIX).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let keys = self.kv.scan_prefix(prefix).await?;
        let mut deleted = 0;
        for batch in keys.chunks(DELETE_BATCH) {
            deleted += self.kv.delete(batch).await?;
        }
        tracing::info!(prefix, deleted, "cache entries removed");
        Ok(deleted)
    }
}
