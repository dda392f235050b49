//! Redis Adapter
//!
//! Implements the `VolatileStore` port on a pooled Redis connection. Every
//! port method is a single Redis command, except the token-checked delete,
//! which runs as a Lua script so the compare and the delete are atomic.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

use crate::domain::ports::VolatileStore;
use crate::error::{Error, Result};

/// Delete KEYS[1] only when it holds ARGV[1].
const DELETE_IF_EQUALS_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Redis-backed volatile store.
pub struct RedisVolatileStore {
    pool: Pool,
    compare_and_delete: Script,
}

impl std::fmt::Debug for RedisVolatileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisVolatileStore").finish_non_exhaustive()
    }
}

impl RedisVolatileStore {
    /// Connect a pool to `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub fn connect(url: &str) -> Result<Self> {
        let pool = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::Config(format!("Invalid Redis configuration: {}", e)))?;
        info!(url = %url, "Created Redis connection pool");
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: Pool) -> Self {
        Self {
            pool,
            compare_and_delete: Script::new(DELETE_IF_EQUALS_SCRIPT),
        }
    }

    async fn connection(&self) -> Result<Connection> {
        self.pool.get().await.map_err(|e| {
            debug!(error = %e, "Redis pool checkout failed");
            Error::StoreUnavailable(format!("Redis connection failed: {}", e))
        })
    }
}

fn command_failed(e: redis::RedisError) -> Error {
    Error::StoreUnavailable(format!("Redis command failed: {}", e))
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl VolatileStore for RedisVolatileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(key).await.map_err(command_failed)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection().await?;
        match ttl {
            Some(ttl) => {
                let _: () = conn
                    .pset_ex(key, value, ttl_millis(ttl))
                    .await
                    .map_err(command_failed)?;
            }
            None => {
                let _: () = conn.set(key, value).await.map_err(command_failed)?;
            }
        }
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut *conn)
            .await
            .map_err(command_failed)?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn.del(key).await.map_err(command_failed)?;
        Ok(removed > 0)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut *conn)
            .await
            .map_err(command_failed)?;
        Ok(removed > 0)
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.connection().await?;
        let value: i64 = conn.incr(key, delta).await.map_err(command_failed)?;
        Ok(value)
    }

    async fn decrement(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.connection().await?;
        let value: i64 = conn.decr(key, delta).await.map_err(command_failed)?;
        Ok(value)
    }

    async fn zincr_by(&self, set: &str, member: &str, delta: f64) -> Result<f64> {
        let mut conn = self.connection().await?;
        let score: f64 = conn.zincr(set, member, delta).await.map_err(command_failed)?;
        Ok(score)
    }

    async fn zrev_range_with_scores(
        &self,
        set: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        let mut conn = self.connection().await?;
        let members: Vec<(String, f64)> = conn
            .zrevrange_withscores(set, start, stop)
            .await
            .map_err(command_failed)?;
        Ok(members)
    }

    async fn zadd(&self, set: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: i64 = conn.zadd(set, member, score).await.map_err(command_failed)?;
        Ok(())
    }

    async fn zscore(&self, set: &str, member: &str) -> Result<Option<f64>> {
        let mut conn = self.connection().await?;
        let score: Option<f64> = conn.zscore(set, member).await.map_err(command_failed)?;
        Ok(score)
    }
}
