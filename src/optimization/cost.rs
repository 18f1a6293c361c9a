//! LLM usage accounting.
//!
//! Usage is aggregated into day-scoped hashes in the key-value store:
//!
//! - `ai:cost:daily:<date>`: `total_cost`, `total_calls`, `prompt_tokens`,
//!   `completion_tokens` and one `model:<name>` cost field per model
//! - `ai:cost:user:<user>:<date>` and `ai:cost:model:<model>:<date>`: the
//!   same counters scoped to one user or one model
//!
//! Every key expires after the configured retention.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;

use super::config::CostConfig;
use crate::storage::{KvStore, StoreError};

const COST_PREFIX: &str = "ai:cost:";
const SECS_PER_DAY: u64 = 86_400;

/// One LLM call's token counts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageRecord {
    pub model: String,
    pub user_id: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Aggregated counters for one hash.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CostStats {
    pub date: String,
    pub total_cost: f64,
    pub total_calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Cost per model. Only populated on the daily hash.
    pub by_model: HashMap<String, f64>,
}

impl CostStats {
    fn from_fields(date: &str, fields: HashMap<String, String>) -> Self {
        let mut stats = CostStats {
            date: date.to_string(),
            ..Default::default()
        };
        for (field, value) in fields {
            match field.as_str() {
                "total_cost" => stats.total_cost = value.parse().unwrap_or(0.0),
                "total_calls" => stats.total_calls = value.parse().unwrap_or(0),
                "prompt_tokens" => stats.prompt_tokens = value.parse().unwrap_or(0),
                "completion_tokens" => stats.completion_tokens = value.parse().unwrap_or(0),
                other => {
                    if let Some(model) = other.strip_prefix("model:") {
                        stats
                            .by_model
                            .insert(model.to_string(), value.parse().unwrap_or(0.0));
                    }
                }
            }
        }
        stats
    }
}

/// Result of comparing today's spend against the alert threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdStatus {
    pub total_cost: f64,
    pub threshold: Option<f64>,
    pub exceeded: bool,
}

pub fn daily_key(date: &str) -> String {
    format!("{COST_PREFIX}daily:{date}")
}

pub fn user_key(user_id: &str, date: &str) -> String {
    format!("{COST_PREFIX}user:{user_id}:{date}")
}

pub fn model_key(model: &str, date: &str) -> String {
    format!("{COST_PREFIX}model:{model}:{date}")
}

fn today() -> NaiveDate {
    chrono::Utc::now().date_naive()
}

pub struct CostTracker {
    kv: Arc<dyn KvStore>,
    config: RwLock<Arc<CostConfig>>,
}

impl CostTracker {
    pub fn new(kv: Arc<dyn KvStore>, config: CostConfig) -> Self {
        Self {
            kv,
            config: RwLock::new(Arc::new(config)),
        }
    }

    pub fn config(&self) -> Arc<CostConfig> {
        self.config
            .read()
            .map(|c| Arc::clone(&c))
            .unwrap_or_default()
    }

    pub fn update_config(&self, config: CostConfig) {
        if let Ok(mut guard) = self.config.write() {
            *guard = Arc::new(config);
        }
    }

    /// Record one call against today's counters. Returns the computed cost.
    pub async fn record_usage(&self, usage: &UsageRecord) -> Result<f64, StoreError> {
        self.record_usage_on(usage, today()).await
    }

    /// [`record_usage`](Self::record_usage) against an explicit day.
    pub async fn record_usage_on(&self, usage: &UsageRecord, date: NaiveDate) -> Result<f64, StoreError> {
        let config = self.config();
        if !config.enabled {
            return Ok(0.0);
        }
        let cost = config.cost_of(&usage.model, usage.prompt_tokens, usage.completion_tokens);
        let date = date.format("%Y-%m-%d").to_string();
        let retention = Duration::from_secs(u64::from(config.retention_days.max(1)) * SECS_PER_DAY);

        let daily = daily_key(&date);
        self.bump(&daily, usage, cost).await?;
        if !usage.model.is_empty() {
            self.kv
                .hincr_by_float(&daily, &format!("model:{}", usage.model), cost)
                .await?;
        }
        self.kv.expire(&daily, retention).await?;

        if !usage.user_id.is_empty() {
            let key = user_key(&usage.user_id, &date);
            self.bump(&key, usage, cost).await?;
            self.kv.expire(&key, retention).await?;
        }
        if !usage.model.is_empty() {
            let key = model_key(&usage.model, &date);
            self.bump(&key, usage, cost).await?;
            self.kv.expire(&key, retention).await?;
        }

        tracing::debug!(
            model = %usage.model,
            user_id = %usage.user_id,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            cost,
            "usage recorded"
        );
        Ok(cost)
    }

    async fn bump(&self, key: &str, usage: &UsageRecord, cost: f64) -> Result<(), StoreError> {
        self.kv.hincr_by_float(key, "total_cost", cost).await?;
        self.kv.hincr_by(key, "total_calls", 1).await?;
        self.kv
            .hincr_by(key, "prompt_tokens", usage.prompt_tokens as i64)
            .await?;
        self.kv
            .hincr_by(key, "completion_tokens", usage.completion_tokens as i64)
            .await?;
        Ok(())
    }

    pub async fn daily_stats(&self, date: NaiveDate) -> Result<CostStats, StoreError> {
        let date = date.format("%Y-%m-%d").to_string();
        let fields = self.kv.hget_all(&daily_key(&date)).await?;
        Ok(CostStats::from_fields(&date, fields))
    }

    pub async fn user_stats(&self, user_id: &str, date: NaiveDate) -> Result<CostStats, StoreError> {
        let date = date.format("%Y-%m-%d").to_string();
        let fields = self.kv.hget_all(&user_key(user_id, &date)).await?;
        Ok(CostStats::from_fields(&date, fields))
    }

    pub async fn model_stats(&self, model: &str, date: NaiveDate) -> Result<CostStats, StoreError> {
        let date = date.format("%Y-%m-%d").to_string();
        let fields = self.kv.hget_all(&model_key(model, &date)).await?;
        Ok(CostStats::from_fields(&date, fields))
    }

    /// Compare today's total against the alert threshold.
    pub async fn check_threshold(&self) -> Result<ThresholdStatus, StoreError> {
        let threshold = self.config().alert_threshold;
        let stats = self.daily_stats(today()).await?;
        let exceeded = threshold.is_some_and(|t| stats.total_cost >= t);
        if exceeded {
            tracing::warn!(
                total_cost = stats.total_cost,
                threshold = threshold.unwrap_or_default(),
                "daily llm cost threshold exceeded"
            );
        }
        Ok(ThresholdStatus {
            total_cost: stats.total_cost,
            threshold,
            exceeded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::config::ModelPrice;
    use crate::storage::MemoryKvStore;

    fn tracker(threshold: Option<f64>) -> (Arc<MemoryKvStore>, CostTracker) {
        let kv = Arc::new(MemoryKvStore::new());
        let mut config = CostConfig {
            alert_threshold: threshold,
            ..Default::default()
        };
        config.prices.insert(
            "gpt-4o".into(),
            ModelPrice {
                prompt: 0.01,
                completion: 0.03,
            },
        );
        (kv.clone(), CostTracker::new(kv, config))
    }

    fn usage(model: &str, user: &str) -> UsageRecord {
        UsageRecord {
            model: model.into(),
            user_id: user.into(),
            prompt_tokens: 1000,
            completion_tokens: 500,
        }
    }

    #[tokio::test]
    async fn test_record_aggregates_daily_user_model() {
        let (kv, tracker) = tracker(None);
        let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let cost = tracker.record_usage_on(&usage("gpt-4o", "u1"), day).await.unwrap();
        assert!((cost - 0.025).abs() < 1e-9);
        tracker.record_usage_on(&usage("gpt-4o", "u2"), day).await.unwrap();
        tracker.record_usage_on(&usage("local", "u1"), day).await.unwrap();

        let daily = tracker.daily_stats(day).await.unwrap();
        assert_eq!(daily.total_calls, 3);
        assert_eq!(daily.prompt_tokens, 3000);
        assert!((daily.total_cost - 0.05).abs() < 1e-9);
        assert!((daily.by_model["gpt-4o"] - 0.05).abs() < 1e-9);
        assert_eq!(daily.by_model["local"], 0.0);

        let u1 = tracker.user_stats("u1", day).await.unwrap();
        assert_eq!(u1.total_calls, 2);
        let m = tracker.model_stats("gpt-4o", day).await.unwrap();
        assert_eq!(m.total_calls, 2);

        let ttl = kv.ttl(&daily_key("2026-03-01")).await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(29 * SECS_PER_DAY));
    }

    #[tokio::test]
    async fn test_disabled_records_nothing() {
        let kv = Arc::new(MemoryKvStore::new());
        let tracker = CostTracker::new(
            kv.clone(),
            CostConfig {
                enabled: false,
                ..Default::default()
            },
        );
        assert_eq!(tracker.record_usage(&usage("gpt-4o", "u1")).await.unwrap(), 0.0);
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn test_threshold() {
        let (_kv, tracker) = tracker(Some(0.04));
        tracker.record_usage(&usage("gpt-4o", "u1")).await.unwrap();
        assert!(!tracker.check_threshold().await.unwrap().exceeded);
        tracker.record_usage(&usage("gpt-4o", "u1")).await.unwrap();
        let status = tracker.check_threshold().await.unwrap();
        assert!(status.exceeded);
        assert_eq!(status.threshold, Some(0.04));
    }

    #[tokio::test]
    async fn test_empty_day_is_zero() {
        let (_kv, tracker) = tracker(None);
        let stats = tracker
            .daily_stats(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap())
            .await
            .unwrap();
        assert_eq!(stats.total_calls, 0);
        assert_eq!(stats.date, "2020-01-01");
    }
}
