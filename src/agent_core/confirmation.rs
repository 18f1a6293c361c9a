//! One-shot confirmation slots for high-risk tool calls.
//!
//! A slot is staged in the key-value store under `ai:confirm:<id>` with the
//! store TTL set to the slot lifetime. Consuming it is a validate-then-take:
//! every check runs against a plain read so a mismatched caller leaves the
//! slot intact, and only the final `take` removes it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::ChatError;
use crate::storage::KvStore;
use crate::tools::RiskLevel;

const KEY_PREFIX: &str = "ai:confirm:";

/// Default slot lifetime.
pub const DEFAULT_CONFIRMATION_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmAction {
    Approve,
    Reject,
}

impl ConfirmAction {
    pub fn parse(action: &str) -> Option<Self> {
        match action.trim().to_ascii_lowercase().as_str() {
            "approve" | "confirm" | "yes" => Some(ConfirmAction::Approve),
            "reject" | "cancel" | "no" => Some(ConfirmAction::Reject),
            _ => None,
        }
    }
}

/// Everything needed to run the proposed call later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationSlot {
    pub confirm_id: String,
    pub session_id: String,
    pub user_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub risk_level: RiskLevel,
    pub summary: String,
    /// Agent that proposed the call; its prompt is reused for the summary.
    pub agent: String,
    /// The user message that led to the proposal.
    pub query: String,
    /// Unix seconds.
    pub expires_at: i64,
}

pub struct ConfirmationManager {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

fn slot_key(confirm_id: &str) -> String {
    format!("{KEY_PREFIX}{confirm_id}")
}

fn rejected(confirm_id: &str, reason: impl Into<String>) -> ChatError {
    ChatError::Confirmation {
        confirm_id: confirm_id.to_string(),
        reason: reason.into(),
    }
}

impl ConfirmationManager {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Persist a new slot and return it with its id and expiry filled in.
    #[allow(clippy::too_many_arguments)]
    pub async fn stage(
        &self,
        session_id: &str,
        user_id: &str,
        tool_name: &str,
        arguments: Value,
        risk_level: RiskLevel,
        summary: String,
        agent: &str,
        query: &str,
    ) -> Result<ConfirmationSlot, ChatError> {
        let slot = ConfirmationSlot {
            confirm_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            tool_name: tool_name.to_string(),
            arguments,
            risk_level,
            summary,
            agent: agent.to_string(),
            query: query.to_string(),
            expires_at: chrono::Utc::now().timestamp() + self.ttl.as_secs() as i64,
        };
        let raw = serde_json::to_string(&slot).map_err(|e| ChatError::InvalidRequest {
            reason: format!("unserializable tool arguments: {e}"),
        })?;
        self.kv
            .set(&slot_key(&slot.confirm_id), &raw, Some(self.ttl))
            .await?;
        tracing::info!(
            confirm_id = %slot.confirm_id,
            tool = %slot.tool_name,
            risk = %slot.risk_level,
            "confirmation staged"
        );
        Ok(slot)
    }

    /// Read a slot without consuming it.
    pub async fn peek(&self, confirm_id: &str) -> Result<Option<ConfirmationSlot>, ChatError> {
        let Some(raw) = self.kv.get(&slot_key(confirm_id)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| rejected(confirm_id, format!("corrupt slot: {e}")))
    }

    /// Validate and atomically consume a slot.
    ///
    /// Fails without consuming when the slot is missing or expired, belongs to
    /// another user or session, or the action is not recognised. A second
    /// consumer racing past validation gets "already used".
    pub async fn consume(
        &self,
        confirm_id: &str,
        action: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<(ConfirmAction, ConfirmationSlot), ChatError> {
        let action = ConfirmAction::parse(action)
            .ok_or_else(|| rejected(confirm_id, format!("unknown action '{action}'")))?;
        let slot = self
            .peek(confirm_id)
            .await?
            .ok_or_else(|| rejected(confirm_id, "not found or already used"))?;

        if slot.expires_at <= chrono::Utc::now().timestamp() {
            return Err(rejected(confirm_id, "expired"));
        }
        if slot.user_id != user_id {
            tracing::warn!(confirm_id, user_id, "confirmation from a different user");
            return Err(rejected(confirm_id, "belongs to another user"));
        }
        if slot.session_id != session_id {
            return Err(rejected(confirm_id, "belongs to another session"));
        }

        if self.kv.take(&slot_key(confirm_id)).await?.is_none() {
            return Err(rejected(confirm_id, "not found or already used"));
        }
        tracing::info!(confirm_id, action = ?action, "confirmation consumed");
        Ok((action, slot))
    }
}
