//! Typed configuration backed by the relational store, with hot reload.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::env::expand_env_vars;
use super::errors::ConfigError;
use crate::storage::AssistantDatabase;

// ─── Constants ───────────────────────────────────────────────────────────────

/// How often the poller checks the store for changes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// The one active key per optimization config type.
pub const DEFAULT_CONFIG_KEY: &str = "default";

// ─── Reloadable ──────────────────────────────────────────────────────────────

/// A component that rebuilds its snapshot from the store on demand.
#[async_trait]
pub trait Reloadable: Send + Sync {
    /// Short name used in logs.
    fn component(&self) -> &str;

    /// Rebuild from the store. On error the previous snapshot must stay in place.
    async fn reload(&self) -> Result<(), ConfigError>;
}

// ─── ConfigLoader ────────────────────────────────────────────────────────────

/// Single source of truth for configuration stored in the database.
pub struct ConfigLoader {
    db: Arc<AssistantDatabase>,
    cache: RwLock<HashMap<String, Value>>,
    /// `max_updated_at` observed at the last reload.
    last_reload: AtomicI64,
    components: RwLock<Vec<Arc<dyn Reloadable>>>,
}

impl ConfigLoader {
    pub fn new(db: Arc<AssistantDatabase>) -> Self {
        let stamp = db.max_updated_at().unwrap_or(0);
        Self {
            db,
            cache: RwLock::new(HashMap::new()),
            last_reload: AtomicI64::new(stamp),
            components: RwLock::new(Vec::new()),
        }
    }

    pub fn database(&self) -> &Arc<AssistantDatabase> {
        &self.db
    }

    /// Register a component to be reloaded when the store changes.
    pub fn register(&self, component: Arc<dyn Reloadable>) {
        if let Ok(mut components) = self.components.write() {
            components.push(component);
        }
    }

    // ─── Reads ───────────────────────────────────────────────────────────

    /// Parsed value of a generic config row, or `None` when absent or empty.
    pub fn get(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        if let Some(hit) = self.cached(key) {
            return Ok(Some(hit));
        }
        let raw = self.db.get_config(key)?.map(|row| row.value);
        self.parse_and_cache(key, raw)
    }

    /// Deserialize a generic config row into `T`.
    pub fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.get(key)? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| ConfigError::Invalid {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Parsed value of the active optimization config for `config_type`.
    pub fn get_optimization(&self, config_type: &str) -> Result<Option<Value>, ConfigError> {
        let cache_key = format!("optimization:{config_type}");
        if let Some(hit) = self.cached(&cache_key) {
            return Ok(Some(hit));
        }
        let raw = self
            .db
            .get_optimization_config(config_type, DEFAULT_CONFIG_KEY)?;
        self.parse_and_cache(&cache_key, raw)
    }

    /// Typed optimization config; a missing row yields `T::default()`.
    pub fn get_optimization_typed<T: DeserializeOwned + Default>(
        &self,
        config_type: &str,
    ) -> Result<T, ConfigError> {
        match self.get_optimization(config_type)? {
            Some(value) => serde_json::from_value(value).map_err(|e| ConfigError::Invalid {
                key: config_type.to_string(),
                reason: e.to_string(),
            }),
            None => Ok(T::default()),
        }
    }

    fn cached(&self, key: &str) -> Option<Value> {
        self.cache.read().ok().and_then(|c| c.get(key).cloned())
    }

    fn parse_and_cache(&self, key: &str, raw: Option<String>) -> Result<Option<Value>, ConfigError> {
        let raw = match raw {
            Some(r) if !r.trim().is_empty() => r,
            _ => return Ok(None),
        };
        let expanded = expand_env_vars(&raw);
        let value: Value = serde_json::from_str(&expanded).map_err(|e| ConfigError::Parse {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(key.to_string(), value.clone());
        }
        Ok(Some(value))
    }

    // ─── Reload ──────────────────────────────────────────────────────────

    /// Whether any row changed since the last reload.
    pub fn needs_reload(&self) -> Result<bool, ConfigError> {
        let latest = self.db.max_updated_at()?;
        Ok(latest > self.last_reload.load(Ordering::SeqCst))
    }

    /// Drop the parsed-value cache only.
    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }

    /// Drop the cache and reload every registered component.
    ///
    /// Component failures are logged and collected; the rest still reload.
    pub async fn reload_all(&self) -> Vec<ConfigError> {
        // Capture the stamp first so changes made during the reload are seen next time.
        match self.db.max_updated_at() {
            Ok(stamp) => self.last_reload.store(stamp, Ordering::SeqCst),
            Err(e) => tracing::warn!(error = %e, "could not read config stamp"),
        }
        self.clear_cache();

        let components: Vec<Arc<dyn Reloadable>> = match self.components.read() {
            Ok(c) => c.clone(),
            Err(_) => Vec::new(),
        };

        let mut failures = Vec::new();
        for component in components {
            match component.reload().await {
                Ok(()) => tracing::debug!(component = component.component(), "reloaded"),
                Err(e) => {
                    tracing::error!(
                        component = component.component(),
                        error = %e,
                        "reload failed, keeping previous snapshot"
                    );
                    failures.push(e);
                }
            }
        }
        tracing::info!(failed = failures.len(), "configuration reloaded");
        failures
    }

    /// Reload if the store changed. Returns whether a reload ran.
    pub async fn poll_once(&self) -> bool {
        match self.needs_reload() {
            Ok(true) => {
                self.reload_all().await;
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::warn!(error = %e, "config change check failed");
                false
            }
        }
    }

    /// Spawn the background poller. Stops when `token` is cancelled.
    pub fn spawn_poller(self: Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick fires immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("config poller stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.poll_once().await;
                    }
                }
            }
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingComponent {
        reloads: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Reloadable for CountingComponent {
        fn component(&self) -> &str {
            "counter"
        }

        async fn reload(&self) -> Result<(), ConfigError> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ConfigError::Reload {
                    component: "counter".into(),
                    reason: "boom".into(),
                });
            }
            Ok(())
        }
    }

    fn loader() -> ConfigLoader {
        ConfigLoader::new(Arc::new(AssistantDatabase::open_in_memory().unwrap()))
    }

    #[test]
    fn test_get_missing_and_empty() {
        let loader = loader();
        assert!(loader.get("nothing").unwrap().is_none());
        loader.database().upsert_config("blank", "  ", true).unwrap();
        assert!(loader.get("blank").unwrap().is_none());
    }

    #[test]
    fn test_get_malformed_json() {
        let loader = loader();
        loader.database().upsert_config("bad", "{not json", true).unwrap();
        assert!(matches!(
            loader.get("bad").unwrap_err(),
            ConfigError::Parse { .. }
        ));
    }

    #[test]
    fn test_get_expands_and_caches() {
        let loader = loader();
        std::env::set_var("__AI_ASSISTANT_TEST_HOST__", "kb.internal");
        loader
            .database()
            .upsert_config("kb", r#"{"host":"${__AI_ASSISTANT_TEST_HOST__}"}"#, true)
            .unwrap();
        let value = loader.get("kb").unwrap().unwrap();
        assert_eq!(value["host"], "kb.internal");
        std::env::remove_var("__AI_ASSISTANT_TEST_HOST__");

        // Served from cache until a reload drops it.
        loader.database().upsert_config("kb", r#"{"host":"other"}"#, true).unwrap();
        assert_eq!(loader.get("kb").unwrap().unwrap()["host"], "kb.internal");
        loader.clear_cache();
        assert_eq!(loader.get("kb").unwrap().unwrap()["host"], "other");
    }

    #[test]
    fn test_optimization_typed_defaults() {
        #[derive(serde::Deserialize, Default, Debug, PartialEq)]
        struct Limits {
            #[serde(default)]
            rpm: u32,
        }
        let loader = loader();
        let limits: Limits = loader.get_optimization_typed("rate_limit").unwrap();
        assert_eq!(limits, Limits::default());

        loader
            .database()
            .upsert_optimization_config("rate_limit", DEFAULT_CONFIG_KEY, r#"{"rpm":5}"#)
            .unwrap();
        let limits: Limits = loader.get_optimization_typed("rate_limit").unwrap();
        assert_eq!(limits.rpm, 5);
    }

    #[tokio::test]
    async fn test_needs_reload_after_change() {
        let loader = loader();
        assert!(!loader.needs_reload().unwrap());
        loader.database().upsert_config("x", "{}", true).unwrap();
        assert!(loader.needs_reload().unwrap());
        loader.reload_all().await;
        assert!(!loader.needs_reload().unwrap());
    }

    #[tokio::test]
    async fn test_reload_calls_components_and_collects_failures() {
        let loader = loader();
        let ok = Arc::new(CountingComponent {
            reloads: AtomicUsize::new(0),
            fail: false,
        });
        let bad = Arc::new(CountingComponent {
            reloads: AtomicUsize::new(0),
            fail: true,
        });
        loader.register(ok.clone());
        loader.register(bad.clone());

        let failures = loader.reload_all().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(ok.reloads.load(Ordering::SeqCst), 1);
        assert_eq!(bad.reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_poll_once_only_on_change() {
        let loader = loader();
        let counter = Arc::new(CountingComponent {
            reloads: AtomicUsize::new(0),
            fail: false,
        });
        loader.register(counter.clone());

        assert!(!loader.poll_once().await);
        loader.database().upsert_config("y", "{}", true).unwrap();
        assert!(loader.poll_once().await);
        assert_eq!(counter.reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_poller_stops_on_cancel() {
        let loader = Arc::new(loader());
        let token = CancellationToken::new();
        let handle = loader.spawn_poller(Duration::from_millis(10), token.clone());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
