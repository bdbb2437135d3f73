// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis backend for the [`KvStore`] contract.
//!
//! All keys go through an optional prefix so the engine can share a Redis
//! instance with other applications:
//!
//! ```text
//! {prefix}cdn:buffer:{item_id}            ZSET  position-key|line  (score = position)
//! {prefix}cdn:buffer:{item_id}:lines      ZSET  line numbers present
//! {prefix}cdn:log:job:{job}               LIST  queued fragments
//! {prefix}cdn:log:job:waiting             ZSET  jobs with a backlog
//! {prefix}cdn:log:job:heartbeat:{job}     STRING drain lease (PX ttl)
//! {prefix}cdn:log:size:{job}              STRING accumulated bytes (24h ttl)
//! {prefix}cdn:lru:*                       decoded-content cache
//! ```
//!
//! Pops are polled with `LPOP` rather than `BLPOP`: the connection manager is
//! multiplexed and a blocking pop would stall every other command on it.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, Client, Script};
use std::time::Duration;

use super::KvStore;
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::traits::StorageError;

/// KEYS[1] zset, ARGV[1] score, ARGV[2] prefix, ARGV[3] member.
const ZREPLACE_SCRIPT: &str = r"
local found = redis.call('ZRANGEBYSCORE', KEYS[1], ARGV[1], ARGV[1])
for _, m in ipairs(found) do
  if string.sub(m, 1, string.len(ARGV[2])) == ARGV[2] then
    redis.call('ZREM', KEYS[1], m)
  end
end
return redis.call('ZADD', KEYS[1], ARGV[1], ARGV[3])
";

const POP_POLL_MIN: Duration = Duration::from_millis(10);
const POP_POLL_MAX: Duration = Duration::from_millis(200);

pub struct RedisKv {
    connection: ConnectionManager,
    prefix: String,
}

impl RedisKv {
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let policy = RetryConfig::startup();
        let connection = retry("redis_connect", &policy, || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| {
            StorageError::Backend(format!("redis unreachable after {:?}: {}", policy.total_budget().unwrap_or_default(), e))
        })?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
        })
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

fn backend(e: redis::RedisError) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);
        retry("redis_get", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let value: Option<String> = cmd("GET").arg(&key).query_async(&mut conn).await.map_err(backend)?;
                Ok(value)
            }
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let mut c = cmd("SET");
        c.arg(self.prefixed_key(key)).arg(value);
        if let Some(ttl) = ttl {
            c.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = c.query_async(&mut conn).await.map_err(backend)?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = cmd("SET")
            .arg(self.prefixed_key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(reply.is_some())
    }

    async fn incr_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64, StorageError> {
        let mut conn = self.connection.clone();
        let key = self.prefixed_key(key);
        let mut p = pipe();
        p.atomic().cmd("INCRBY").arg(&key).arg(delta);
        if let Some(ttl) = ttl {
            p.cmd("PEXPIRE").arg(&key).arg(ttl_millis(ttl)).ignore();
        }
        let (value,): (i64,) = p.query_async(&mut conn).await.map_err(backend)?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let updated: i64 = cmd("PEXPIRE")
            .arg(self.prefixed_key(key))
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(updated == 1)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);
        retry("redis_delete", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let _: i64 = cmd("DEL").arg(&key).query_async(&mut conn).await.map_err(backend)?;
                Ok(())
            }
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let count: i64 = cmd("EXISTS").arg(self.prefixed_key(key)).query_async(&mut conn).await.map_err(backend)?;
        Ok(count > 0)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: i64 = cmd("ZADD")
            .arg(self.prefixed_key(key))
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn zreplace(&self, key: &str, score: f64, prefix: &str, member: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: i64 = Script::new(ZREPLACE_SCRIPT)
            .key(self.prefixed_key(key))
            .arg(score)
            .arg(prefix)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: i64 = cmd("ZREM").arg(self.prefixed_key(key)).arg(member).query_async(&mut conn).await.map_err(backend)?;
        Ok(())
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64, StorageError> {
        let mut conn = self.connection.clone();
        let removed: u64 = cmd("ZREMRANGEBYSCORE")
            .arg(self.prefixed_key(key))
            .arg(min)
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> Result<u64, StorageError> {
        let mut conn = self.connection.clone();
        let count: u64 = cmd("ZCARD").arg(self.prefixed_key(key)).query_async(&mut conn).await.map_err(backend)?;
        Ok(count)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StorageError> {
        let mut conn = self.connection.clone();
        let score: Option<f64> = cmd("ZSCORE").arg(self.prefixed_key(key)).arg(member).query_async(&mut conn).await.map_err(backend)?;
        Ok(score)
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64, reverse: bool) -> Result<Vec<(String, f64)>, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);
        let command = if reverse { "ZREVRANGE" } else { "ZRANGE" };
        retry("redis_zrange", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let members: Vec<(String, f64)> = cmd(command)
                    .arg(&key)
                    .arg(start)
                    .arg(stop)
                    .arg("WITHSCORES")
                    .query_async(&mut conn)
                    .await
                    .map_err(backend)?;
                Ok(members)
            }
        })
        .await
    }

    async fn push(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: i64 = cmd("RPUSH").arg(self.prefixed_key(key)).arg(value).query_async(&mut conn).await.map_err(backend)?;
        Ok(())
    }

    async fn pop_timeout(&self, key: &str, timeout: Duration) -> Result<Option<String>, StorageError> {
        let key = self.prefixed_key(key);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = POP_POLL_MIN;
        loop {
            let mut conn = self.connection.clone();
            let value: Option<String> = cmd("LPOP").arg(&key).query_async(&mut conn).await.map_err(backend)?;
            if value.is_some() {
                return Ok(value);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(POP_POLL_MAX);
        }
    }

    async fn llen(&self, key: &str) -> Result<u64, StorageError> {
        let mut conn = self.connection.clone();
        let len: u64 = cmd("LLEN").arg(self.prefixed_key(key)).query_async(&mut conn).await.map_err(backend)?;
        Ok(len)
    }
}
