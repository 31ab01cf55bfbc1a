//! Storage seams: a TTL'd key/value store and per-user append-only event
//! streams. Production runs on Redis; tests and single-process setups run on
//! the in-memory backend.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// A single entry delivered from a user's stream. `payload` is the raw JSON
/// value of the entry's `message` field, as produced by the inbound gateway.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub payload: String,
}

/// Cursor value meaning "only entries appended after this read starts".
pub const CURSOR_LATEST: &str = "$";

/// TTL'd key/value operations. All writes carry an explicit TTL; nothing in
/// this key space lives forever.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Atomic set-if-absent with TTL. Returns true when the key was created,
    /// false when it already existed. Never blocks.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn del(&self, key: &str) -> Result<()>;
}

/// Per-user append-only streams, consumed by exactly one session at a time
/// (ownership is enforced by the distributed lock, not by the stream).
#[async_trait]
pub trait EventStream: Send + Sync {
    /// Read entries appended after `cursor`, blocking up to `block` when none
    /// are available. `cursor` is either [`CURSOR_LATEST`] or the id of the
    /// last entry this consumer processed.
    async fn read(
        &self,
        user_id: i64,
        cursor: &str,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;

    /// Users that currently have a stream key (a stream key only exists while
    /// it holds entries, so these are the users with pending traffic).
    async fn pending_users(&self) -> Result<Vec<i64>>;
}

/// Key-space layout shared with the inbound gateway and other processes.
pub mod keys {
    pub fn lock(user_id: i64) -> String {
        format!("lock:{user_id}")
    }

    pub fn state(user_id: i64) -> String {
        format!("agent:state:{user_id}")
    }

    pub fn stream(user_id: i64) -> String {
        format!("agent:{user_id}:stream")
    }

    pub const STREAM_PATTERN: &str = "agent:*:stream";

    pub fn confirmation(user_id: i64, token: &str) -> String {
        format!("mcp_confirm:{user_id}:{token}")
    }

    /// Parse the user id out of an `agent:<uid>:stream` key.
    pub fn user_from_stream(key: &str) -> Option<i64> {
        let rest = key.strip_prefix("agent:")?;
        let uid = rest.strip_suffix(":stream")?;
        uid.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::keys;

    #[test]
    fn key_layout_matches_wire_contract() {
        assert_eq!(keys::lock(42), "lock:42");
        assert_eq!(keys::state(42), "agent:state:42");
        assert_eq!(keys::stream(42), "agent:42:stream");
        assert_eq!(keys::confirmation(42, "ab12"), "mcp_confirm:42:ab12");
    }

    #[test]
    fn user_from_stream_roundtrips() {
        assert_eq!(keys::user_from_stream("agent:42:stream"), Some(42));
        assert_eq!(keys::user_from_stream(&keys::stream(-7)), Some(-7));
        assert_eq!(keys::user_from_stream("agent:nope:stream"), None);
        assert_eq!(keys::user_from_stream("lock:42"), None);
    }
}
