//! In-process backend with the same semantics as the Redis one: TTL'd keys
//! and blocking stream reads. Backs tests and single-process development
//! without a Redis server. TTLs use tokio's clock so paused-time tests work.

use super::{EventStream, KvStore, StreamEntry, CURSOR_LATEST};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

struct KvEntry {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryStore {
    kv: Mutex<HashMap<String, KvEntry>>,
    streams: Mutex<HashMap<i64, Vec<(u64, String)>>>,
    next_seq: Mutex<u64>,
    appended: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry to a user's stream, waking blocked readers.
    /// Returns the assigned entry id.
    pub fn append(&self, user_id: i64, payload: &str) -> String {
        let seq = {
            let mut next = self.next_seq.lock();
            *next += 1;
            *next
        };
        self.streams
            .lock()
            .entry(user_id)
            .or_default()
            .push((seq, payload.to_string()));
        self.appended.notify_waiters();
        format!("{seq}-0")
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let mut kv = self.kv.lock();
        match kv.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                kv.remove(key);
                None
            }
            None => None,
        }
    }

    fn entries_after(&self, user_id: i64, cursor_seq: u64) -> Vec<StreamEntry> {
        self.streams
            .lock()
            .get(&user_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(seq, _)| *seq > cursor_seq)
                    .map(|(seq, payload)| StreamEntry {
                        id: format!("{seq}-0"),
                        payload: payload.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn resolve_cursor(&self, user_id: i64, cursor: &str) -> u64 {
        if cursor == CURSOR_LATEST {
            return self
                .streams
                .lock()
                .get(&user_id)
                .and_then(|entries| entries.last())
                .map(|(seq, _)| *seq)
                .unwrap_or(0);
        }
        cursor
            .split('-')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.live_value(key))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.kv.lock().insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        if self.live_value(key).is_some() {
            return Ok(false);
        }
        self.kv.lock().insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.kv.lock().remove(key);
        Ok(())
    }
}

#[async_trait]
impl EventStream for MemoryStore {
    async fn read(
        &self,
        user_id: i64,
        cursor: &str,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let cursor_seq = self.resolve_cursor(user_id, cursor);
        let deadline = Instant::now() + block;
        loop {
            // Register for wakeups before checking, so an append between the
            // check and the await is not lost.
            let notified = self.appended.notified();
            let entries = self.entries_after(user_id, cursor_seq);
            if !entries.is_empty() {
                return Ok(entries);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn pending_users(&self) -> Result<Vec<i64>> {
        Ok(self
            .streams
            .lock()
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(uid, _)| *uid)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::keys;

    #[tokio::test(start_paused = true)]
    async fn keys_expire_after_ttl() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "v", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_nx_is_exclusive_until_deleted() {
        let store = MemoryStore::new();
        assert!(store
            .set_nx_ex(&keys::lock(1), "1", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!store
            .set_nx_ex(&keys::lock(1), "1", Duration::from_secs(60))
            .await
            .unwrap());
        store.del(&keys::lock(1)).await.unwrap();
        assert!(store
            .set_nx_ex(&keys::lock(1), "1", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn latest_cursor_skips_backlog_but_sees_new_entries() {
        let store = MemoryStore::new();
        store.append(7, r#"{"text":"old"}"#);

        let entries = store
            .read(7, CURSOR_LATEST, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(entries.is_empty());

        let id = store.append(7, r#"{"text":"new"}"#);
        let entries = store
            .read(7, "1-0", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
        assert!(entries[0].payload.contains("new"));
    }

    #[tokio::test]
    async fn read_wakes_on_append() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let reader = std::sync::Arc::clone(&store);
        let handle = tokio::spawn(async move {
            reader.read(3, "0-0", Duration::from_secs(5)).await.unwrap()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.append(3, r#"{"text":"hi"}"#);

        let entries = handle.await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn pending_users_lists_streams_with_entries() {
        let store = MemoryStore::new();
        assert!(store.pending_users().await.unwrap().is_empty());
        store.append(1, "{}");
        store.append(2, "{}");
        let mut users = store.pending_users().await.unwrap();
        users.sort_unstable();
        assert_eq!(users, vec![1, 2]);
    }
}
