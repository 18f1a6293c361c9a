//! In-process [`KvStore`] implementation.
//!
//! Backs tests and single-node deployments. Expiry is lazy: an expired entry
//! is dropped the next time any operation touches it (or during a scan).
//! The offline switch makes every call fail with `StoreError::Unavailable`,
//! which is how degraded-mode behaviour is exercised.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::errors::StoreError;
use super::kv::{resolve_range, KvStore};

// ─── Entries ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
    Set(HashSet<String>),
    ZSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

// ─── MemoryKvStore ───────────────────────────────────────────────────────────

/// Thread-safe in-memory key-value store with TTL support.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
    offline: AtomicBool,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store going away (or coming back).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of live keys (expired entries excluded).
    pub fn len(&self) -> usize {
        let now = Instant::now();
        match self.entries.lock() {
            Ok(map) => map.values().filter(|e| !e.is_expired(now)).count(),
            Err(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` against the live entry map, failing when offline.
    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Entry>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                reason: "memory store is offline".into(),
            });
        }
        let mut map = self.entries.lock().map_err(|e| StoreError::Unavailable {
            reason: format!("lock poisoned: {e}"),
        })?;
        f(&mut map)
    }
}

/// Drop the entry for `key` if it has expired, then return a mutable handle to it.
fn live<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let now = Instant::now();
    if map.get(key).map(|e| e.is_expired(now)).unwrap_or(false) {
        map.remove(key);
    }
    map.get_mut(key)
}

/// Fetch the live entry for `key`, inserting `empty()` when absent.
fn live_or_insert<'a>(
    map: &'a mut HashMap<String, Entry>,
    key: &str,
    empty: fn() -> Value,
) -> &'a mut Entry {
    let now = Instant::now();
    if map.get(key).map(|e| e.is_expired(now)).unwrap_or(false) {
        map.remove(key);
    }
    map.entry(key.to_string())
        .or_insert_with(|| Entry::new(empty()))
}

fn wrong_type(key: &str, expected: &'static str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
        expected,
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.with_entries(|_| Ok(()))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_entries(|map| match live(map, key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key, "string")),
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.with_entries(|map| {
            map.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: ttl.map(|t| Instant::now() + t),
                },
            );
            Ok(())
        })
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError> {
        self.with_entries(|map| {
            let mut removed = 0;
            for key in keys {
                if live(map, key).is_some() {
                    map.remove(key);
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    async fn take(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_entries(|map| match live(map, key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(_),
                ..
            }) => match map.remove(key) {
                Some(Entry {
                    value: Value::Str(s),
                    ..
                }) => Ok(Some(s)),
                _ => Ok(None),
            },
            Some(_) => Err(wrong_type(key, "string")),
        })
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.with_entries(|map| {
            let entry = live_or_insert(map, key, || Value::Str("0".into()));
            match &mut entry.value {
                Value::Str(s) => {
                    let current: i64 = s.parse().map_err(|_| StoreError::NotANumber {
                        key: key.to_string(),
                    })?;
                    let next = current + 1;
                    *s = next.to_string();
                    Ok(next)
                }
                _ => Err(wrong_type(key, "string")),
            }
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.with_entries(|map| match live(map, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        })
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        self.with_entries(|map| {
            let now = Instant::now();
            Ok(live(map, key)
                .and_then(|e| e.expires_at)
                .map(|at| at.saturating_duration_since(now)))
        })
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        self.with_entries(|map| {
            let entry = live_or_insert(map, key, || Value::Hash(HashMap::new()));
            match &mut entry.value {
                Value::Hash(h) => {
                    let current: i64 = match h.get(field) {
                        Some(v) => v.parse().map_err(|_| StoreError::NotANumber {
                            key: format!("{key}.{field}"),
                        })?,
                        None => 0,
                    };
                    let next = current + delta;
                    h.insert(field.to_string(), next.to_string());
                    Ok(next)
                }
                _ => Err(wrong_type(key, "hash")),
            }
        })
    }

    async fn hincr_by_float(&self, key: &str, field: &str, delta: f64) -> Result<f64, StoreError> {
        self.with_entries(|map| {
            let entry = live_or_insert(map, key, || Value::Hash(HashMap::new()));
            match &mut entry.value {
                Value::Hash(h) => {
                    let current: f64 = match h.get(field) {
                        Some(v) => v.parse().map_err(|_| StoreError::NotANumber {
                            key: format!("{key}.{field}"),
                        })?,
                        None => 0.0,
                    };
                    let next = current + delta;
                    h.insert(field.to_string(), next.to_string());
                    Ok(next)
                }
                _ => Err(wrong_type(key, "hash")),
            }
        })
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.with_entries(|map| match live(map, key) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(h.clone()),
            Some(_) => Err(wrong_type(key, "hash")),
        })
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        self.with_entries(|map| {
            let entry = live_or_insert(map, key, || Value::List(VecDeque::new()));
            match &mut entry.value {
                Value::List(l) => {
                    l.push_back(value.to_string());
                    Ok(l.len() as u64)
                }
                _ => Err(wrong_type(key, "list")),
            }
        })
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        self.with_entries(|map| {
            let remove_key = match live(map, key) {
                None => return Ok(()),
                Some(Entry {
                    value: Value::List(l),
                    ..
                }) => match resolve_range(l.len(), start, stop) {
                    Some((s, e)) => {
                        l.truncate(e + 1);
                        l.drain(..s);
                        false
                    }
                    None => true,
                },
                Some(_) => return Err(wrong_type(key, "list")),
            };
            if remove_key {
                map.remove(key);
            }
            Ok(())
        })
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        self.with_entries(|map| match live(map, key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::List(l),
                ..
            }) => Ok(match resolve_range(l.len(), start, stop) {
                Some((s, e)) => l.range(s..=e).cloned().collect(),
                None => Vec::new(),
            }),
            Some(_) => Err(wrong_type(key, "list")),
        })
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        self.with_entries(|map| match live(map, key) {
            None => Ok(0),
            Some(Entry {
                value: Value::List(l),
                ..
            }) => Ok(l.len() as u64),
            Some(_) => Err(wrong_type(key, "list")),
        })
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.with_entries(|map| {
            let entry = live_or_insert(map, key, || Value::Set(HashSet::new()));
            match &mut entry.value {
                Value::Set(s) => Ok(s.insert(member.to_string())),
                _ => Err(wrong_type(key, "set")),
            }
        })
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.with_entries(|map| match live(map, key) {
            None => Ok(false),
            Some(Entry {
                value: Value::Set(s),
                ..
            }) => Ok(s.remove(member)),
            Some(_) => Err(wrong_type(key, "set")),
        })
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.with_entries(|map| match live(map, key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Set(s),
                ..
            }) => {
                let mut members: Vec<String> = s.iter().cloned().collect();
                members.sort();
                Ok(members)
            }
            Some(_) => Err(wrong_type(key, "set")),
        })
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.with_entries(|map| {
            let entry = live_or_insert(map, key, || Value::ZSet(HashMap::new()));
            match &mut entry.value {
                Value::ZSet(z) => {
                    z.insert(member.to_string(), score);
                    Ok(())
                }
                _ => Err(wrong_type(key, "zset")),
            }
        })
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.with_entries(|map| match live(map, key) {
            None => Ok(false),
            Some(Entry {
                value: Value::ZSet(z),
                ..
            }) => Ok(z.remove(member).is_some()),
            Some(_) => Err(wrong_type(key, "zset")),
        })
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError> {
        self.with_entries(|map| match live(map, key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::ZSet(z),
                ..
            }) => {
                let mut hits: Vec<(&String, f64)> = z
                    .iter()
                    .filter(|(_, &score)| score >= min && score <= max)
                    .map(|(m, &s)| (m, s))
                    .collect();
                hits.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
                Ok(hits.into_iter().map(|(m, _)| m.clone()).collect())
            }
            Some(_) => Err(wrong_type(key, "zset")),
        })
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.with_entries(|map| match live(map, key) {
            None => Ok(0),
            Some(Entry {
                value: Value::ZSet(z),
                ..
            }) => Ok(z.len() as u64),
            Some(_) => Err(wrong_type(key, "zset")),
        })
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.with_entries(|map| {
            let now = Instant::now();
            map.retain(|_, e| !e.is_expired(now));
            let mut keys: Vec<String> = map
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect();
            keys.sort();
            Ok(keys)
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
