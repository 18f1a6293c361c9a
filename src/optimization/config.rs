//! Typed configuration blobs, one per optimization config type.
//!
//! Each blob lives in `ai_optimization_configs` under key `default`. Every
//! field has a serde default so partial rows parse.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::OptimizationError;

// ─── Config type tags ────────────────────────────────────────────────────────

pub const RATE_LIMIT: &str = "rate_limit";
pub const CACHE: &str = "cache";
pub const MODEL_ROUTER: &str = "model_router";
pub const RETRY: &str = "retry";
pub const CONCURRENT: &str = "concurrent";
pub const COST: &str = "cost";

pub const CONFIG_TYPES: [&str; 6] = [RATE_LIMIT, CACHE, MODEL_ROUTER, RETRY, CONCURRENT, COST];

// ─── Rate limit ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Requests per minute when no override applies.
    pub default_rpm: u32,
    /// Extra requests the local fallback bucket may absorb.
    pub burst: u32,
    /// Per-user overrides; win over group overrides.
    pub user_limits: HashMap<String, u32>,
    /// Per-business-group overrides.
    pub group_limits: HashMap<String, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_rpm: 60,
            burst: 10,
            user_limits: HashMap::new(),
            group_limits: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// User override, then group override, then the default.
    pub fn effective_limit(&self, user_id: &str, group: &str) -> u32 {
        self.user_limits
            .get(user_id)
            .or_else(|| self.group_limits.get(group))
            .copied()
            .unwrap_or(self.default_rpm)
    }

    pub fn validate(&self) -> Result<(), OptimizationError> {
        if self.enabled && self.default_rpm == 0 {
            return Err(OptimizationError::InvalidConfig {
                config_type: RATE_LIMIT,
                reason: "default_rpm must be at least 1".into(),
            });
        }
        Ok(())
    }
}

// ─── Cache ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub default_ttl_secs: u64,
    /// Only these tools are ever cached.
    pub idempotent_tools: Vec<String>,
    /// Per-tool TTL overrides.
    pub tool_ttls: HashMap<String, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: 300,
            idempotent_tools: Vec::new(),
            tool_ttls: HashMap::new(),
        }
    }
}

impl CacheConfig {
    pub fn is_cacheable(&self, tool: &str) -> bool {
        self.enabled && self.idempotent_tools.iter().any(|t| t == tool)
    }

    pub fn ttl_secs(&self, tool: &str) -> u64 {
        self.tool_ttls
            .get(tool)
            .copied()
            .unwrap_or(self.default_ttl_secs)
    }
}

// ─── Model router ────────────────────────────────────────────────────────────

/// What a model is being asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Routing,
    Execution,
    Summary,
    General,
    Knowledge,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Routing => "routing",
            TaskType::Execution => "execution",
            TaskType::Summary => "summary",
            TaskType::General => "general",
            TaskType::Knowledge => "knowledge",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelSpec {
    pub model: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Tried in order when this model fails.
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

impl ModelSpec {
    pub fn named(model: &str) -> Self {
        Self {
            model: model.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelRouterConfig {
    pub tasks: HashMap<TaskType, ModelSpec>,
    /// Global fallback; also the terminal entry of every fallback chain.
    pub fallback: Option<ModelSpec>,
    /// Global priority list appended after per-task fallbacks.
    pub priority: Vec<String>,
}

impl ModelRouterConfig {
    /// A router that sends every task to one model.
    pub fn single(model: &str) -> Self {
        Self {
            fallback: Some(ModelSpec::named(model)),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), OptimizationError> {
        let has_fallback = self
            .fallback
            .as_ref()
            .is_some_and(|f| !f.model.trim().is_empty());
        if self.tasks.is_empty() && !has_fallback {
            return Err(OptimizationError::InvalidConfig {
                config_type: MODEL_ROUTER,
                reason: "no task models and no global fallback".into(),
            });
        }
        if let Some((task, _)) = self.tasks.iter().find(|(_, s)| s.model.trim().is_empty()) {
            return Err(OptimizationError::InvalidConfig {
                config_type: MODEL_ROUTER,
                reason: format!("task '{task}' has an empty model name"),
            });
        }
        for (task, spec) in &self.tasks {
            if spec.temperature.is_some_and(|t| !(0.0..=2.0).contains(&t)) {
                return Err(OptimizationError::InvalidConfig {
                    config_type: MODEL_ROUTER,
                    reason: format!("task '{task}' temperature must be within [0, 2]"),
                });
            }
        }
        Ok(())
    }
}

// ─── Retry ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), OptimizationError> {
        if self.multiplier < 1.0 {
            return Err(OptimizationError::InvalidConfig {
                config_type: RETRY,
                reason: "multiplier must be >= 1".into(),
            });
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(OptimizationError::InvalidConfig {
                config_type: RETRY,
                reason: "max_backoff_ms must be >= initial_backoff_ms".into(),
            });
        }
        Ok(())
    }
}

// ─── Concurrency ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrentConfig {
    pub max_concurrency: usize,
}

impl Default for ConcurrentConfig {
    fn default() -> Self {
        Self { max_concurrency: 5 }
    }
}

impl ConcurrentConfig {
    pub fn validate(&self) -> Result<(), OptimizationError> {
        if self.max_concurrency == 0 {
            return Err(OptimizationError::InvalidConfig {
                config_type: CONCURRENT,
                reason: "max_concurrency must be at least 1".into(),
            });
        }
        Ok(())
    }
}

// ─── Cost ────────────────────────────────────────────────────────────────────

/// Price per 1000 tokens.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelPrice {
    #[serde(default)]
    pub prompt: f64,
    #[serde(default)]
    pub completion: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    pub enabled: bool,
    pub retention_days: u32,
    /// Daily spend that triggers an alert. `None` disables the check.
    pub alert_threshold: Option<f64>,
    pub prices: HashMap<String, ModelPrice>,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 30,
            alert_threshold: None,
            prices: HashMap::new(),
        }
    }
}

impl CostConfig {
    /// Cost of one call; unpriced models cost nothing.
    pub fn cost_of(&self, model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        match self.prices.get(model) {
            Some(price) => {
                prompt_tokens as f64 / 1000.0 * price.prompt
                    + completion_tokens as f64 / 1000.0 * price.completion
            }
            None => 0.0,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
