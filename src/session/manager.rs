//! SessionManager: conversation sessions and bounded message history.
//!
//! Key layout under the configured prefix:
//! - `session:<id>:meta`: serialized [`Session`], TTL refreshed on every write
//! - `session:<id>:messages`: list of serialized [`Message`], trimmed to
//!   `max_messages` on append
//! - `user:<user_id>:sessions`: set of the user's session ids
//! - `active_sessions`: sorted set scored by last activity (unix ms)

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::errors::SessionError;
use super::types::{Message, Session, SessionStats};
use crate::config::SessionSettings;
use crate::inference::types::Role;
use crate::storage::KvStore;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct SessionManager {
    kv: Arc<dyn KvStore>,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(kv: Arc<dyn KvStore>, settings: SessionSettings) -> Self {
        Self { kv, settings }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    // ─── Keys ────────────────────────────────────────────────────────────

    fn meta_key(&self, id: &str) -> String {
        format!("{}session:{id}:meta", self.settings.key_prefix)
    }

    fn messages_key(&self, id: &str) -> String {
        format!("{}session:{id}:messages", self.settings.key_prefix)
    }

    fn user_key(&self, user_id: &str) -> String {
        format!("{}user:{user_id}:sessions", self.settings.key_prefix)
    }

    fn active_key(&self) -> String {
        format!("{}active_sessions", self.settings.key_prefix)
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.settings.ttl_secs.max(1))
    }

    // ─── Sessions ────────────────────────────────────────────────────────

    /// Create a session. A fresh id is generated when `id` is `None`.
    pub async fn create(
        &self,
        user_id: &str,
        mode: &str,
        id: Option<&str>,
    ) -> Result<Session, SessionError> {
        let now = now_ms();
        let session = Session {
            id: id
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            user_id: user_id.to_string(),
            mode: mode.to_string(),
            created_at: now,
            last_active_at: now,
            message_count: 0,
        };
        self.save(&session).await?;
        self.kv.sadd(&self.user_key(user_id), &session.id).await?;
        self.kv
            .zadd(&self.active_key(), &session.id, now as f64)
            .await?;
        tracing::info!(session_id = %session.id, user_id, "session created");
        Ok(session)
    }

    async fn save(&self, session: &Session) -> Result<(), SessionError> {
        let raw = serde_json::to_string(session).map_err(|e| SessionError::Corrupt {
            key: self.meta_key(&session.id),
            reason: e.to_string(),
        })?;
        self.kv
            .set(&self.meta_key(&session.id), &raw, Some(self.ttl()))
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Session>, SessionError> {
        let key = self.meta_key(id);
        match self.kv.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| SessionError::Corrupt {
                    key,
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Fetch an existing session or create it under the given id.
    ///
    /// A session owned by another user is refused untouched.
    pub async fn get_or_create(
        &self,
        user_id: &str,
        mode: &str,
        id: Option<&str>,
    ) -> Result<Session, SessionError> {
        if let Some(id) = id.filter(|s| !s.is_empty()) {
            if let Some(existing) = self.get(id).await? {
                if existing.user_id != user_id {
                    return Err(SessionError::NotOwner {
                        session_id: id.to_string(),
                    });
                }
                if let Some(session) = self.touch(id).await? {
                    return Ok(session);
                }
            }
            return self.create(user_id, mode, Some(id)).await;
        }
        self.create(user_id, mode, None).await
    }

    /// Update last activity and refresh TTLs. `None` when the session is gone.
    pub async fn touch(&self, id: &str) -> Result<Option<Session>, SessionError> {
        let Some(mut session) = self.get(id).await? else {
            return Ok(None);
        };
        session.last_active_at = now_ms().max(session.last_active_at);
        self.save(&session).await?;
        self.kv.expire(&self.messages_key(id), self.ttl()).await?;
        self.kv
            .zadd(&self.active_key(), id, session.last_active_at as f64)
            .await?;
        Ok(Some(session))
    }

    /// Remove a session and its history. Returns whether it existed.
    pub async fn delete(&self, id: &str) -> Result<bool, SessionError> {
        let session = self.get(id).await?;
        let removed = self
            .kv
            .delete(&[self.meta_key(id), self.messages_key(id)])
            .await?;
        if let Some(session) = &session {
            self.kv.srem(&self.user_key(&session.user_id), id).await?;
        }
        self.kv.zrem(&self.active_key(), id).await?;
        tracing::info!(session_id = id, "session deleted");
        Ok(removed > 0)
    }

    /// The user's sessions that still exist, most recently active first.
    pub async fn list_user_sessions(&self, user_id: &str) -> Result<Vec<Session>, SessionError> {
        let ids = self.kv.smembers(&self.user_key(user_id)).await?;
        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(&id).await? {
                Some(session) => sessions.push(session),
                // expired; drop the dangling reference
                None => {
                    self.kv.srem(&self.user_key(user_id), &id).await?;
                }
            }
        }
        sessions.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        Ok(sessions)
    }

    // ─── Messages ────────────────────────────────────────────────────────

    /// Append a message, trim the list and refresh TTLs.
    ///
    /// The stored timestamp never goes below the previous message's.
    pub async fn add_message(&self, session_id: &str, mut message: Message) -> Result<Message, SessionError> {
        let Some(mut session) = self.get(session_id).await? else {
            return Err(SessionError::NotFound {
                session_id: session_id.to_string(),
            });
        };
        let key = self.messages_key(session_id);

        let last_ts = match self.kv.lrange(&key, -1, -1).await?.first() {
            Some(raw) => serde_json::from_str::<Message>(raw)
                .map(|m| m.timestamp)
                .unwrap_or(0),
            None => 0,
        };
        if message.id.is_empty() {
            message.id = Uuid::new_v4().to_string();
        }
        message.timestamp = now_ms().max(last_ts);

        let raw = serde_json::to_string(&message).map_err(|e| SessionError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        let len = self.kv.rpush(&key, &raw).await?;
        let max = self.settings.max_messages.max(1) as u64;
        if len > max {
            self.kv.ltrim(&key, -(max as i64), -1).await?;
        }
        self.kv.expire(&key, self.ttl()).await?;

        session.message_count += 1;
        session.last_active_at = message.timestamp.max(session.last_active_at);
        self.save(&session).await?;
        self.kv
            .zadd(&self.active_key(), session_id, session.last_active_at as f64)
            .await?;
        Ok(message)
    }

    /// The most recent `limit` messages, oldest first. `0` returns all retained.
    pub async fn get_messages(&self, session_id: &str, limit: usize) -> Result<Vec<Message>, SessionError> {
        let key = self.messages_key(session_id);
        let start = if limit == 0 { 0 } else { -(limit as i64) };
        let raw = self.kv.lrange(&key, start, -1).await?;
        raw.iter()
            .map(|r| {
                serde_json::from_str(r).map_err(|e| SessionError::Corrupt {
                    key: key.clone(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    /// The last `history_limit` messages.
    pub async fn history(&self, session_id: &str) -> Result<Vec<Message>, SessionError> {
        self.get_messages(session_id, self.settings.history_limit).await
    }

    pub async fn get_stats(&self, session_id: &str) -> Result<SessionStats, SessionError> {
        let session = self
            .get(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound {
                session_id: session_id.to_string(),
            })?;
        let messages = self.get_messages(session_id, 0).await?;
        let count_role = |role: Role| messages.iter().filter(|m| m.role == role).count() as u64;
        Ok(SessionStats {
            session_id: session.id.clone(),
            user_id: session.user_id.clone(),
            message_count: session.message_count,
            stored_messages: messages.len() as u64,
            user_messages: count_role(Role::User),
            assistant_messages: count_role(Role::Assistant),
            created_at: session.created_at,
            last_active_at: session.last_active_at,
            duration_secs: (session.last_active_at - session.created_at) / 1000,
        })
    }

    // ─── Liveness ────────────────────────────────────────────────────────

    pub async fn active_count(&self) -> Result<u64, SessionError> {
        Ok(self.kv.zcard(&self.active_key()).await?)
    }

    /// Session ids with no activity for at least `threshold`.
    pub async fn get_inactive(&self, threshold: Duration) -> Result<Vec<String>, SessionError> {
        let cutoff = now_ms() - threshold.as_millis() as i64;
        Ok(self
            .kv
            .zrange_by_score(&self.active_key(), f64::MIN, cutoff as f64)
            .await?)
    }

    /// Drop inactive sessions from the active set. Returns how many were swept.
    pub async fn sweep_inactive(&self, threshold: Duration) -> Result<usize, SessionError> {
        let ids = self.get_inactive(threshold).await?;
        for id in &ids {
            self.kv.zrem(&self.active_key(), id).await?;
        }
        if !ids.is_empty() {
            tracing::info!(swept = ids.len(), "inactive sessions swept");
        }
        Ok(ids.len())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKvStore;

    fn manager(max_messages: usize) -> SessionManager {
        SessionManager::new(
            Arc::new(MemoryKvStore::new()),
            SessionSettings {
                max_messages,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let mgr = manager(10);
        let session = mgr.create("u1", "chat", None).await.unwrap();
        assert!(!session.id.is_empty());
        assert_eq!(mgr.get(&session.id).await.unwrap().unwrap().user_id, "u1");
        assert_eq!(mgr.list_user_sessions("u1").await.unwrap().len(), 1);

        assert!(mgr.delete(&session.id).await.unwrap());
        assert!(mgr.get(&session.id).await.unwrap().is_none());
        assert!(mgr.list_user_sessions("u1").await.unwrap().is_empty());
        assert_eq!(mgr.active_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_or_create_with_unknown_id() {
        let mgr = manager(10);
        let session = mgr.get_or_create("u1", "chat", Some("given-id")).await.unwrap();
        assert_eq!(session.id, "given-id");
        let again = mgr.get_or_create("u1", "chat", Some("given-id")).await.unwrap();
        assert_eq!(again.created_at, session.created_at);
    }

    #[tokio::test]
    async fn test_foreign_user_cannot_refresh_session() {
        let mgr = manager(10);
        let session = mgr.create("u1", "chat", Some("owned")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let err = mgr.get_or_create("u2", "chat", Some("owned")).await.unwrap_err();
        assert!(matches!(err, SessionError::NotOwner { ref session_id } if session_id == "owned"));

        let stored = mgr.get("owned").await.unwrap().unwrap();
        assert_eq!(stored.user_id, "u1");
        assert_eq!(stored.last_active_at, session.last_active_at);
        assert!(mgr.list_user_sessions("u2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trim_keeps_most_recent() {
        let mgr = manager(3);
        let session = mgr.create("u1", "chat", None).await.unwrap();
        for i in 0..5 {
            mgr.add_message(&session.id, Message::new(Role::User, format!("m{i}")))
                .await
                .unwrap();
        }
        let messages = mgr.get_messages(&session.id, 0).await.unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
        assert!(messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let stats = mgr.get_stats(&session.id).await.unwrap();
        assert_eq!(stats.message_count, 5);
        assert_eq!(stats.stored_messages, 3);
    }

    #[tokio::test]
    async fn test_fewer_appends_than_max() {
        let mgr = manager(10);
        let session = mgr.create("u1", "chat", None).await.unwrap();
        for i in 0..4 {
            mgr.add_message(&session.id, Message::new(Role::User, format!("m{i}")))
                .await
                .unwrap();
        }
        assert_eq!(mgr.get_messages(&session.id, 0).await.unwrap().len(), 4);
        let last_two = mgr.get_messages(&session.id, 2).await.unwrap();
        assert_eq!(last_two[0].content, "m2");
        assert_eq!(last_two[1].content, "m3");
    }

    #[tokio::test]
    async fn test_message_roundtrip_through_store() {
        let mgr = manager(10);
        let session = mgr.create("u1", "chat", None).await.unwrap();
        let stored = mgr
            .add_message(&session.id, Message::new(Role::Assistant, "answer").with_trace("t-9"))
            .await
            .unwrap();
        let fetched = mgr.get_messages(&session.id, 1).await.unwrap();
        assert_eq!(fetched[0], stored);
    }

    #[tokio::test]
    async fn test_add_message_to_missing_session() {
        let mgr = manager(10);
        let err = mgr
            .add_message("nope", Message::new(Role::User, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_store_offline_surfaces() {
        let kv = Arc::new(MemoryKvStore::new());
        let mgr = SessionManager::new(kv.clone(), SessionSettings::default());
        kv.set_offline(true);
        assert!(matches!(
            mgr.create("u1", "chat", None).await.unwrap_err(),
            SessionError::Store(_)
        ));
    }

    #[tokio::test]
    async fn test_inactive_sweep() {
        let mgr = manager(10);
        let session = mgr.create("u1", "chat", None).await.unwrap();
        assert!(mgr.get_inactive(Duration::from_secs(3600)).await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let inactive = mgr.get_inactive(Duration::from_millis(5)).await.unwrap();
        assert_eq!(inactive, vec![session.id.clone()]);
        assert_eq!(mgr.sweep_inactive(Duration::from_millis(5)).await.unwrap(), 1);
        assert_eq!(mgr.active_count().await.unwrap(), 0);
    }
}
