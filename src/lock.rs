//! Per-user distributed lock: the sole arbiter of session ownership across
//! scheduler processes. Absence of the key means no process owns the user.

use crate::store::{keys, KvStore};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

const LOCK_MARKER: &str = "1";

pub struct SessionLock {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl SessionLock {
    /// `ttl` should equal the session idle timeout: a crashed process leaks
    /// its locks for at most one idle period.
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Single atomic set-if-absent. Returns false when another process holds
    /// the user. Never waits.
    pub async fn acquire(&self, user_id: i64) -> Result<bool> {
        self.kv
            .set_nx_ex(&keys::lock(user_id), LOCK_MARKER, self.ttl)
            .await
    }

    pub async fn release(&self, user_id: i64) -> Result<()> {
        self.kv.del(&keys::lock(user_id)).await
    }
}
