//! One façade over every optimization engine.
//!
//! The orchestrator talks only to [`OptimizationManager`]. Reloads are
//! all-or-nothing: every config type is parsed and validated before any
//! engine sees a new value, so one bad row keeps the whole previous set.

use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::cache::ToolCache;
use super::concurrent::ConcurrentExecutor;
use super::config::{
    CacheConfig, ConcurrentConfig, CostConfig, ModelRouterConfig, ModelSpec, RateLimitConfig,
    RetryConfig, TaskType, CACHE, CONCURRENT, COST, MODEL_ROUTER, RATE_LIMIT, RETRY,
};
use super::cost::{CostStats, CostTracker, ThresholdStatus, UsageRecord};
use super::errors::OptimizationError;
use super::model_router::ModelRouter;
use super::rate_limiter::{Clock, RateDecision, RateLimiter, RateStatus};
use super::retry::{RetryHandler, RetryableError};
use crate::config::{ConfigError, ConfigLoader, Reloadable};
use crate::storage::{KvStore, StoreError};

/// Every optimization config parsed and validated together.
#[derive(Debug, Clone)]
pub struct OptimizationSnapshot {
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub model_router: ModelRouterConfig,
    pub retry: RetryConfig,
    pub concurrent: ConcurrentConfig,
    pub cost: CostConfig,
}

impl OptimizationSnapshot {
    /// Read all six config types. A missing model-router row routes every
    /// task to `default_model`.
    pub fn load(loader: &ConfigLoader, default_model: &str) -> Result<Self, OptimizationError> {
        let rate_limit: RateLimitConfig = loader.get_optimization_typed(RATE_LIMIT)?;
        let cache: CacheConfig = loader.get_optimization_typed(CACHE)?;
        let retry: RetryConfig = loader.get_optimization_typed(RETRY)?;
        let concurrent: ConcurrentConfig = loader.get_optimization_typed(CONCURRENT)?;
        let cost: CostConfig = loader.get_optimization_typed(COST)?;
        let model_router = match loader.get_optimization(MODEL_ROUTER)? {
            Some(value) => {
                serde_json::from_value(value).map_err(|e| OptimizationError::InvalidConfig {
                    config_type: MODEL_ROUTER,
                    reason: e.to_string(),
                })?
            }
            None => ModelRouterConfig::single(default_model),
        };

        rate_limit.validate()?;
        retry.validate()?;
        concurrent.validate()?;
        model_router.validate()?;

        Ok(Self {
            rate_limit,
            cache,
            model_router,
            retry,
            concurrent,
            cost,
        })
    }
}

pub struct OptimizationManager {
    loader: Arc<ConfigLoader>,
    default_model: String,
    rate_limiter: RateLimiter,
    cache: ToolCache,
    cost: CostTracker,
    router: RwLock<Arc<ModelRouter>>,
    retry: RwLock<Arc<RetryHandler>>,
    concurrent: RwLock<Arc<ConcurrentExecutor>>,
}

impl OptimizationManager {
    /// Build every engine from the store. Invalid config is fatal here.
    pub fn new(
        loader: Arc<ConfigLoader>,
        kv: Arc<dyn KvStore>,
        default_model: &str,
    ) -> Result<Self, OptimizationError> {
        let snapshot = OptimizationSnapshot::load(&loader, default_model)?;
        let router = ModelRouter::new(snapshot.model_router)?;
        tracing::info!(
            rpm = snapshot.rate_limit.default_rpm,
            cacheable_tools = snapshot.cache.idempotent_tools.len(),
            max_retries = snapshot.retry.max_retries,
            max_concurrency = snapshot.concurrent.max_concurrency,
            "optimization manager initialised"
        );
        Ok(Self {
            loader,
            default_model: default_model.to_string(),
            rate_limiter: RateLimiter::new(Arc::clone(&kv), snapshot.rate_limit),
            cache: ToolCache::new(Arc::clone(&kv), snapshot.cache),
            cost: CostTracker::new(kv, snapshot.cost),
            router: RwLock::new(Arc::new(router)),
            retry: RwLock::new(Arc::new(RetryHandler::new(snapshot.retry))),
            concurrent: RwLock::new(Arc::new(ConcurrentExecutor::new(&snapshot.concurrent))),
        })
    }

    /// Drive rate-limit windows from `clock` instead of the system time.
    pub fn with_rate_clock(mut self, clock: Clock) -> Self {
        self.rate_limiter = self.rate_limiter.with_clock(clock);
        self
    }

    /// Re-read every config type and swap them in together.
    pub fn reload_configs(&self) -> Result<(), OptimizationError> {
        self.loader.clear_cache();
        let snapshot = OptimizationSnapshot::load(&self.loader, &self.default_model)?;
        let router = ModelRouter::new(snapshot.model_router)?;

        self.rate_limiter.update_config(snapshot.rate_limit);
        self.cache.update_config(snapshot.cache);
        self.cost.update_config(snapshot.cost);
        if let Ok(mut guard) = self.router.write() {
            *guard = Arc::new(router);
        }
        if let Ok(mut guard) = self.retry.write() {
            *guard = Arc::new(RetryHandler::new(snapshot.retry));
        }
        if let Ok(mut guard) = self.concurrent.write() {
            *guard = Arc::new(ConcurrentExecutor::new(&snapshot.concurrent));
        }
        tracing::info!("optimization configs reloaded");
        Ok(())
    }

    // ─── Rate limit ──────────────────────────────────────────────────────

    pub async fn check_rate_limit(&self, user_id: &str, group: Option<&str>) -> RateDecision {
        self.rate_limiter.check(user_id, group).await
    }

    pub async fn rate_limit_status(
        &self,
        user_id: &str,
        group: Option<&str>,
    ) -> Result<RateStatus, StoreError> {
        self.rate_limiter.status(user_id, group).await
    }

    // ─── Cache ───────────────────────────────────────────────────────────

    pub fn is_cacheable(&self, tool: &str) -> bool {
        self.cache.is_cacheable(tool)
    }

    pub async fn cache_get(&self, tool: &str, args: &Value) -> Option<Value> {
        self.cache.get(tool, args).await
    }

    pub async fn cache_set(&self, tool: &str, args: &Value, result: &Value) {
        self.cache.set(tool, args, result).await
    }

    pub async fn cache_invalidate(&self, tool: &str) -> Result<u64, StoreError> {
        self.cache.invalidate(tool).await
    }

    pub async fn cache_clear(&self) -> Result<u64, StoreError> {
        self.cache.clear().await
    }

    // ─── Model routing ───────────────────────────────────────────────────

    fn router(&self) -> Arc<ModelRouter> {
        match self.router.read() {
            Ok(r) => Arc::clone(&r),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn model_for(&self, task: TaskType) -> ModelSpec {
        self.router().get_model(task).clone()
    }

    pub fn fallback_chain(&self, task: TaskType) -> Vec<String> {
        self.router().fallback_chain(task)
    }

    // ─── Retry + concurrency ─────────────────────────────────────────────

    pub fn retry_handler(&self) -> Arc<RetryHandler> {
        match self.retry.read() {
            Ok(r) => Arc::clone(&r),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub async fn retry<T, E, F, Fut>(&self, token: &CancellationToken, label: &str, op: F) -> Result<T, E>
    where
        E: RetryableError,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.retry_handler().execute(token, label, op).await
    }

    pub fn concurrent(&self) -> Arc<ConcurrentExecutor> {
        match self.concurrent.read() {
            Ok(c) => Arc::clone(&c),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    // ─── Cost ────────────────────────────────────────────────────────────

    /// Record usage. Store failures are logged, never surfaced to the turn.
    pub async fn record_usage(&self, usage: &UsageRecord) -> f64 {
        match self.cost.record_usage(usage).await {
            Ok(cost) => cost,
            Err(e) => {
                tracing::warn!(model = %usage.model, error = %e, "failed to record usage");
                0.0
            }
        }
    }

    pub async fn cost_daily(&self, date: NaiveDate) -> Result<CostStats, StoreError> {
        self.cost.daily_stats(date).await
    }

    pub async fn cost_user(&self, user_id: &str, date: NaiveDate) -> Result<CostStats, StoreError> {
        self.cost.user_stats(user_id, date).await
    }

    pub async fn cost_model(&self, model: &str, date: NaiveDate) -> Result<CostStats, StoreError> {
        self.cost.model_stats(model, date).await
    }

    pub async fn check_cost_threshold(&self) -> Result<ThresholdStatus, StoreError> {
        self.cost.check_threshold().await
    }
}

#[async_trait]
impl Reloadable for OptimizationManager {
    fn component(&self) -> &str {
        "optimization"
    }

    async fn reload(&self) -> Result<(), ConfigError> {
        self.reload_configs().map_err(|e| ConfigError::Reload {
            component: "optimization".into(),
            reason: e.to_string(),
        })
    }
}
