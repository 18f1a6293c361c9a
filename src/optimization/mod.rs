//! Resource governance applied to every chat turn: rate limiting, result
//! caching, model routing, retries, bounded fan-out and usage accounting.

pub mod cache;
pub mod concurrent;
pub mod config;
pub mod cost;
pub mod errors;
pub mod manager;
pub mod model_router;
pub mod rate_limiter;
pub mod retry;

pub use cache::{cache_key, CachedResult, ToolCache};
pub use concurrent::ConcurrentExecutor;
pub use config::{
    CacheConfig, ConcurrentConfig, CostConfig, ModelPrice, ModelRouterConfig, ModelSpec,
    RateLimitConfig, RetryConfig, TaskType,
};
pub use cost::{CostStats, CostTracker, ThresholdStatus, UsageRecord};
pub use errors::OptimizationError;
pub use manager::{OptimizationManager, OptimizationSnapshot};
pub use model_router::ModelRouter;
pub use rate_limiter::{Clock, LimitMode, RateDecision, RateLimiter, RateStatus};
pub use retry::{RetryHandler, RetryableError};
