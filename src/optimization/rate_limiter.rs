//! Per-user request rate limiting.
//!
//! Distributed mode counts requests in a minute-windowed key-value counter.
//! When the store is unreachable, a local token bucket per key takes over.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::config::RateLimitConfig;
use crate::storage::{KvStore, StoreError};

const WINDOW: Duration = Duration::from_secs(60);

/// Which tier produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitMode {
    Disabled,
    Distributed,
    Local,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Set when `allowed` is false.
    pub retry_after: Option<Duration>,
    pub mode: LimitMode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateStatus {
    pub limit: u32,
    pub remaining: u32,
    pub reset_in_secs: u64,
}

// ─── Token bucket ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    /// Tokens added per second.
    rate: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(limit: u32, burst: u32, now: Instant) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            capacity,
            tokens: capacity,
            rate: f64::from(limit) / WINDOW.as_secs_f64(),
            last: now,
        }
    }

    /// Take one token, or report how long until one is available.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        if self.rate <= 0.0 {
            return Err(WINDOW);
        }
        Err(Duration::from_secs_f64((1.0 - self.tokens) / self.rate))
    }

    fn available(&self) -> u32 {
        self.tokens.floor().max(0.0) as u32
    }
}

// ─── RateLimiter ─────────────────────────────────────────────────────────────

pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    config: RwLock<Arc<RateLimitConfig>>,
    buckets: RwLock<HashMap<String, Arc<Mutex<TokenBucket>>>>,
    clock: Clock,
}

/// Wall-clock source in unix seconds.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Counter key for one user/group in one minute window.
pub fn window_key(user_id: &str, group: &str, now_secs: u64) -> String {
    format!(
        "ai:ratelimit:{user_id}:{group}:{}",
        now_secs / WINDOW.as_secs()
    )
}

fn group_or_default(group: Option<&str>) -> &str {
    group.filter(|g| !g.is_empty()).unwrap_or("default")
}

fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>, config: RateLimitConfig) -> Self {
        Self {
            kv,
            config: RwLock::new(Arc::new(config)),
            buckets: RwLock::new(HashMap::new()),
            clock: Arc::new(unix_now),
        }
    }

    /// Replace the window clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> Arc<RateLimitConfig> {
        self.config
            .read()
            .map(|c| Arc::clone(&c))
            .unwrap_or_default()
    }

    /// Swap the config and wipe local buckets so they rebuild with new limits.
    pub fn update_config(&self, config: RateLimitConfig) {
        if let Ok(mut guard) = self.config.write() {
            *guard = Arc::new(config);
        }
        if let Ok(mut buckets) = self.buckets.write() {
            buckets.clear();
        }
    }

    pub async fn check(&self, user_id: &str, group: Option<&str>) -> RateDecision {
        self.check_at(user_id, group, (self.clock)()).await
    }

    /// [`check`](Self::check) against an explicit clock, in unix seconds.
    pub async fn check_at(&self, user_id: &str, group: Option<&str>, now_secs: u64) -> RateDecision {
        let config = self.config();
        let group = group_or_default(group);
        let limit = config.effective_limit(user_id, group);
        if !config.enabled {
            return RateDecision {
                allowed: true,
                limit,
                remaining: limit,
                retry_after: None,
                mode: LimitMode::Disabled,
            };
        }

        match self.check_distributed(user_id, group, limit, now_secs).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "rate limit store unavailable, using local bucket");
                self.check_local(user_id, group, limit, config.burst)
            }
        }
    }

    async fn check_distributed(
        &self,
        user_id: &str,
        group: &str,
        limit: u32,
        now_secs: u64,
    ) -> Result<RateDecision, StoreError> {
        let key = window_key(user_id, group, now_secs);
        let count = self.kv.incr(&key).await?;
        if count == 1 {
            self.kv.expire(&key, WINDOW).await?;
        }
        let count = count.max(0) as u64;
        if count > u64::from(limit) {
            let retry_after = match self.kv.ttl(&key).await? {
                Some(ttl) if !ttl.is_zero() => ttl,
                _ => Duration::from_secs(WINDOW.as_secs() - now_secs % WINDOW.as_secs()),
            };
            tracing::info!(user_id, group, limit, "rate limit exceeded");
            return Ok(RateDecision {
                allowed: false,
                limit,
                remaining: 0,
                retry_after: Some(retry_after.min(WINDOW)),
                mode: LimitMode::Distributed,
            });
        }
        Ok(RateDecision {
            allowed: true,
            limit,
            remaining: (u64::from(limit) - count) as u32,
            retry_after: None,
            mode: LimitMode::Distributed,
        })
    }

    fn check_local(&self, user_id: &str, group: &str, limit: u32, burst: u32) -> RateDecision {
        let key = format!("{user_id}:{group}");
        let now = Instant::now();

        let existing = self
            .buckets
            .read()
            .ok()
            .and_then(|b| b.get(&key).cloned());
        let bucket = match existing {
            Some(b) => b,
            None => match self.buckets.write() {
                Ok(mut buckets) => Arc::clone(
                    buckets
                        .entry(key)
                        .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(limit, burst, now)))),
                ),
                Err(_) => Arc::new(Mutex::new(TokenBucket::new(limit, burst, now))),
            },
        };

        let Ok(mut bucket) = bucket.lock() else {
            return RateDecision {
                allowed: true,
                limit,
                remaining: 0,
                retry_after: None,
                mode: LimitMode::Local,
            };
        };
        match bucket.try_take(now) {
            Ok(()) => RateDecision {
                allowed: true,
                limit,
                remaining: bucket.available(),
                retry_after: None,
                mode: LimitMode::Local,
            },
            Err(delay) => RateDecision {
                allowed: false,
                limit,
                remaining: 0,
                retry_after: Some(delay),
                mode: LimitMode::Local,
            },
        }
    }

    /// Remaining budget in the current window without consuming any.
    pub async fn status(&self, user_id: &str, group: Option<&str>) -> Result<RateStatus, StoreError> {
        let now_secs = (self.clock)();
        let config = self.config();
        let group = group_or_default(group);
        let limit = config.effective_limit(user_id, group);
        let key = window_key(user_id, group, now_secs);
        let used: u64 = self
            .kv
            .get(&key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(RateStatus {
            limit,
            remaining: u64::from(limit).saturating_sub(used) as u32,
            reset_in_secs: WINDOW.as_secs() - now_secs % WINDOW.as_secs(),
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
