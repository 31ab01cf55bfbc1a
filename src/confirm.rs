//! Confirm-then-execute protocol for LLM-proposed tool calls.
//!
//! A staged call lives as `mcp_confirm:<user_id>:<token>` with a short TTL.
//! The token is the sole capability reference: presenting it resolves the
//! staged call, and resolution always deletes the record, so a token can be
//! used at most once. An expired record and a missing record are the same
//! thing to the caller.

use crate::store::{keys, KvStore};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Staged calls expire after five minutes without a decision.
pub const CONFIRMATION_TTL: Duration = Duration::from_secs(5 * 60);

pub const CONFIRM_YES_PREFIX: &str = "confirm_yes:";
pub const CONFIRM_NO_PREFIX: &str = "confirm_no:";

/// A staged, not-yet-executed tool invocation awaiting user approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub function_name: String,
    pub arguments: Value,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmDecision {
    Approve,
    Reject,
}

/// Parse a callback payload (`confirm_yes:<key>` / `confirm_no:<key>`).
/// Returns `None` for unrelated callbacks.
pub fn parse_callback(data: &str) -> Option<(ConfirmDecision, &str)> {
    if let Some(key) = data.strip_prefix(CONFIRM_YES_PREFIX) {
        return Some((ConfirmDecision::Approve, key));
    }
    if let Some(key) = data.strip_prefix(CONFIRM_NO_PREFIX) {
        return Some((ConfirmDecision::Reject, key));
    }
    None
}

/// Storage for pending confirmations, addressable by any process that
/// receives the user's callback.
#[async_trait]
pub trait ConfirmationStore: Send + Sync {
    /// Stage a call; returns the full confirmation key to embed in the
    /// callback payloads.
    async fn stage(&self, user_id: i64, function_name: &str, arguments: Value) -> Result<String>;

    /// Single-use resolution: fetch and immediately delete. `None` means the
    /// record never existed, already resolved, or expired.
    async fn take(&self, key: &str) -> Result<Option<PendingConfirmation>>;

    /// Drop a staged call that was never offered to the user (for example
    /// when the confirmation prompt could not be delivered).
    async fn discard(&self, key: &str) -> Result<()>;
}

pub struct KvConfirmationStore {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl KvConfirmationStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            ttl: CONFIRMATION_TTL,
        }
    }

    #[cfg(test)]
    pub fn with_ttl(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }
}

#[async_trait]
impl ConfirmationStore for KvConfirmationStore {
    async fn stage(&self, user_id: i64, function_name: &str, arguments: Value) -> Result<String> {
        let token = Uuid::new_v4().simple().to_string();
        let key = keys::confirmation(user_id, &token[..8]);
        let record = PendingConfirmation {
            function_name: function_name.to_string(),
            arguments,
            user_id,
            created_at: Utc::now(),
        };
        self.kv
            .set_ex(&key, &serde_json::to_string(&record)?, self.ttl)
            .await?;
        Ok(key)
    }

    async fn take(&self, key: &str) -> Result<Option<PendingConfirmation>> {
        let Some(raw) = self.kv.get(key).await? else {
            return Ok(None);
        };
        // Delete before handing the record out: replay is impossible even if
        // the caller dies mid-execution.
        self.kv.del(key).await?;
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!("dropping undecodable confirmation record {key}: {e}");
                Ok(None)
            }
        }
    }

    async fn discard(&self, key: &str) -> Result<()> {
        self.kv.del(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn store() -> KvConfirmationStore {
        KvConfirmationStore::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn staged_call_resolves_exactly_once() {
        let confirmations = store();
        let key = confirmations
            .stage(42, "create_task", json!({"title": "buy milk"}))
            .await
            .unwrap();
        assert!(key.starts_with("mcp_confirm:42:"));

        let record = confirmations.take(&key).await.unwrap().unwrap();
        assert_eq!(record.function_name, "create_task");
        assert_eq!(record.user_id, 42);
        assert_eq!(record.arguments["title"], "buy milk");

        // Second resolution reports not-found.
        assert!(confirmations.take(&key).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_confirmation_is_unresolvable() {
        let confirmations = KvConfirmationStore::with_ttl(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(300),
        );
        let key = confirmations
            .stage(1, "delete_task", json!({"task_id": "t1"}))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(confirmations.take(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn discard_removes_the_record() {
        let confirmations = store();
        let key = confirmations
            .stage(1, "create_task", json!({}))
            .await
            .unwrap();
        confirmations.discard(&key).await.unwrap();
        assert!(confirmations.take(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tokens_are_unique_per_stage() {
        let confirmations = store();
        let a = confirmations.stage(1, "f", json!({})).await.unwrap();
        let b = confirmations.stage(1, "f", json!({})).await.unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn callback_parsing_covers_both_decisions() {
        assert_eq!(
            parse_callback("confirm_yes:mcp_confirm:1:abcd1234"),
            Some((ConfirmDecision::Approve, "mcp_confirm:1:abcd1234"))
        );
        assert_eq!(
            parse_callback("confirm_no:mcp_confirm:1:abcd1234"),
            Some((ConfirmDecision::Reject, "mcp_confirm:1:abcd1234"))
        );
        assert_eq!(parse_callback("something_else"), None);
        assert_eq!(parse_callback(""), None);
    }
}
