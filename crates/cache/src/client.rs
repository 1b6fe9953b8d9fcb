//! Redis-backed counter store.
//! Conditional operations run as Lua scripts so each is one server-side step.

use async_trait::async_trait;
use flashsale_core::config::RedisConfig;
use flashsale_core::store::{CounterStore, DecrementOutcome, KeyTtl};
use flashsale_core::{StoreError, StoreResult};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ErrorKind, RedisError, Script};
use std::time::Duration;
use tracing::info;

/// Returns `{1, remaining}` on commit, `{0, available}` when short and
/// `{-1, 0}` when the key is missing.
const DECREMENT_SCRIPT: &str = r"
local raw = redis.call('GET', KEYS[1])
if not raw then
    return {-1, 0}
end
local stock = tonumber(raw)
local quantity = tonumber(ARGV[1])
if stock >= quantity then
    return {1, redis.call('DECRBY', KEYS[1], quantity)}
end
return {0, stock}
";

const COMPARE_AND_SET_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'KEEPTTL')
    return 1
end
return 0
";

/// Counter store backed by a single Redis node.
pub struct RedisCounterStore {
    conn: ConnectionManager,
    decrement: Script,
    compare_and_set: Script,
}

impl RedisCounterStore {
    /// Connect to the first configured Redis URL.
    pub async fn new(config: &RedisConfig) -> anyhow::Result<Self> {
        let url = config
            .urls
            .first()
            .cloned()
            .unwrap_or_else(|| "redis://localhost:6379".to_string());

        info!(url = %url, "Connecting to Redis");

        let client = redis::Client::open(url.as_str())?;
        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let mut conn = tokio::time::timeout(timeout, ConnectionManager::new(client)).await??;

        // Verify connectivity
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!(response = %pong, "Redis connection established");

        Ok(Self {
            conn,
            decrement: Script::new(DECREMENT_SCRIPT),
            compare_and_set: Script::new(COMPARE_AND_SET_SCRIPT),
        })
    }
}

fn store_err(key: &str) -> impl FnOnce(RedisError) -> StoreError + '_ {
    move |e| {
        if e.kind() == ErrorKind::TypeError {
            return StoreError::WrongType {
                key: key.to_string(),
            };
        }
        metrics::counter!("cache.redis.errors").increment(1);
        StoreError::Unavailable(e.to_string())
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(store_err(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        cmd.query_async::<_, ()>(&mut conn)
            .await
            .map_err(store_err(key))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await.map_err(store_err(key))?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await.map_err(store_err(key))?;
        Ok(removed > 0)
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        let mut conn = self.conn.clone();
        let millis: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_err(key))?;
        Ok(match millis {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            ms => KeyTtl::Expires(Duration::from_millis(ms.max(0) as u64)),
        })
    }

    async fn increment_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        conn.incr(key, delta).await.map_err(store_err(key))
    }

    async fn compare_and_set(&self, key: &str, expected: &str, new: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let swapped: i64 = self
            .compare_and_set
            .key(key)
            .arg(expected)
            .arg(new)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err(key))?;
        Ok(swapped == 1)
    }

    async fn decrement_if_sufficient(
        &self,
        key: &str,
        quantity: i64,
    ) -> StoreResult<DecrementOutcome> {
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .decrement
            .key(key)
            .arg(quantity)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err(key))?;

        match reply.as_slice() {
            [1, remaining] => Ok(DecrementOutcome::Committed {
                remaining: *remaining,
            }),
            [0, available] => Ok(DecrementOutcome::Insufficient {
                available: *available,
            }),
            [-1, _] => Ok(DecrementOutcome::Missing),
            _ => Err(StoreError::Unavailable(format!(
                "unexpected decrement reply for {key}: {reply:?}"
            ))),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<String> =
            conn.scan_match(&pattern).await.map_err(store_err(prefix))?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn replace_set(
        &self,
        key: &str,
        members: &[String],
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("DEL").arg(key).ignore();
        if !members.is_empty() {
            pipe.cmd("SADD").arg(key).arg(members).ignore();
            if let Some(ttl) = ttl {
                pipe.cmd("PEXPIRE").arg(key).arg(ttl_millis(ttl)).ignore();
            }
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(store_err(key))
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.smembers(key).await.map_err(store_err(key))
    }

    async fn increment_score(&self, key: &str, member: &str, delta: f64) -> StoreResult<f64> {
        let mut conn = self.conn.clone();
        conn.zincr(key, member, delta).await.map_err(store_err(key))
    }

    async fn top_scores(&self, key: &str, limit: usize) -> StoreResult<Vec<(String, f64)>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        redis::cmd("ZREVRANGE")
            .arg(key)
            .arg(0)
            .arg(limit as isize - 1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(store_err(key))
    }

    async fn remove_score(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.zrem(key, member).await.map_err(store_err(key))?;
        Ok(removed > 0)
    }

    async fn trim_scores(&self, key: &str, keep: usize) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        // Ranks are ascending by score; drop everything below the top `keep`.
        let removed: i64 = redis::cmd("ZREMRANGEBYRANK")
            .arg(key)
            .arg(0)
            .arg(-(keep as i64) - 1)
            .query_async(&mut conn)
            .await
            .map_err(store_err(key))?;
        Ok(removed.max(0) as usize)
    }
}
