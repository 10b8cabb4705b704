//! Redis 键值存储

use std::time::Duration;

use application::kv::{KvError, KvStore};
use async_trait::async_trait;
use redis::aio::ConnectionManager;

fn map_redis_err(err: redis::RedisError) -> KvError {
    KvError::backend(err.to_string())
}

/// 毫秒精度的过期时间，最少 1ms（PX 0 会被 Redis 拒绝）
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// 基于 `ConnectionManager` 的实现，断线后自动重连
#[derive(Clone)]
pub struct RedisKvStore {
    conn: ConnectionManager,
}

impl RedisKvStore {
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url).map_err(map_redis_err)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(map_redis_err)?;
        tracing::info!("Redis 连接已建立");
        Ok(Self { conn })
    }

    fn set_command(key: &str, value: &str, ttl: Option<Duration>) -> redis::Cmd {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        cmd
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let _: () = Self::set_command(key, value, ttl)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    /// MULTI/EXEC 管道，所有键一起写入
    async fn set_many(
        &self,
        keys: &[String],
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in keys {
            pipe.add_command(Self::set_command(key, value, ttl)).ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await.map_err(map_redis_err)?;
        Ok(())
    }

    /// `SET key value NX [PX ms]`，一次往返完成检查和写入
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let mut cmd = Self::set_command(key, value, ttl);
        cmd.arg("NX");

        let mut conn = self.conn.clone();
        let reply: Option<String> = cmd.query_async(&mut conn).await.map_err(map_redis_err)?;
        Ok(reply.is_some())
    }
}
