//! Redis backend: plain keys with TTLs plus XREAD-based stream consumption.

use super::{EventStream, KvStore, StreamEntry};
use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::time::Duration;

/// Shared Redis handle. `ConnectionManager` multiplexes and reconnects, so
/// cloning per call is cheap and the store stays `Send + Sync`.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let manager = client
            .get_connection_manager()
            .await
            .context("connecting to redis")?;
        Ok(Self { manager })
    }

    pub fn from_manager(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut con = self.manager.clone();
        let value: Option<String> = con.get(key).await.context("redis GET")?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut con = self.manager.clone();
        con.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .context("redis SETEX")?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut con = self.manager.clone();
        // SET key value NX EX <ttl>: one round trip, atomic on the server.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut con)
            .await
            .context("redis SET NX EX")?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut con = self.manager.clone();
        con.del::<_, ()>(key).await.context("redis DEL")?;
        Ok(())
    }
}

#[async_trait]
impl EventStream for RedisStore {
    async fn read(
        &self,
        user_id: i64,
        cursor: &str,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let mut con = self.manager.clone();
        let key = super::keys::stream(user_id);
        let block_ms = usize::try_from(block.as_millis()).unwrap_or(usize::MAX);
        let options = StreamReadOptions::default().block(block_ms);

        let reply: StreamReadReply = con
            .xread_options(&[key.as_str()], &[cursor], &options)
            .await
            .context("redis XREAD")?;

        let mut entries = Vec::new();
        for stream_key in reply.keys {
            for id in stream_key.ids {
                let payload: String = id.get("message").unwrap_or_default();
                entries.push(StreamEntry {
                    id: id.id,
                    payload,
                });
            }
        }
        Ok(entries)
    }

    async fn pending_users(&self) -> Result<Vec<i64>> {
        let mut con = self.manager.clone();
        let stream_keys: Vec<String> = con
            .keys(super::keys::STREAM_PATTERN)
            .await
            .context("redis KEYS")?;
        Ok(stream_keys
            .iter()
            .filter_map(|k| super::keys::user_from_stream(k))
            .collect())
    }
}
