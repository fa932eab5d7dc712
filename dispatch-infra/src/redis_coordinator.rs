//! Redis 版键值协调器
//!
//! 以多路复用异步连接实现 `Coordinator` 协议：
//! - `try_lock` 使用单条 `SET key token NX EX ttl`，set-if-absent 与过期
//!   为同一原子操作（消除两步序列的崩溃窗口）；
//! - `unlock` 以 Lua 比较令牌后删除，非持有者不可释放；
//! - 其余操作一一映射到对应 Redis 命令，错误统一转换为
//!   `DispatchError::Coordinator`。
//!
use async_trait::async_trait;
use dispatch_domain::coordinator::Coordinator;
use dispatch_domain::error::DispatchResult;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use std::time::Duration;

/// 令牌一致才删除的释放脚本
const UNLOCK_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

pub struct RedisCoordinator {
    conn: MultiplexedConnection,
}

impl RedisCoordinator {
    /// 建立到 `url`（如 `redis://127.0.0.1/`）的多路复用连接
    pub async fn connect(url: &str) -> DispatchResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    fn ttl_secs(ttl: Duration) -> u64 {
        ttl.as_secs().max(1)
    }
}

#[async_trait]
impl Coordinator for RedisCoordinator {
    async fn get(&self, key: &str) -> DispatchResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> DispatchResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> DispatchResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, Self::ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> DispatchResult<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key, delta).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> DispatchResult<bool> {
        let mut conn = self.conn.clone();
        let applied: bool = conn.expire(key, Self::ttl_secs(ttl) as i64).await?;
        Ok(applied)
    }

    async fn exists(&self, key: &str) -> DispatchResult<bool> {
        let mut conn = self.conn.clone();
        let found: bool = conn.exists(key).await?;
        Ok(found)
    }

    async fn del(&self, keys: &[&str]) -> DispatchResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(keys.to_vec()).await?;
        Ok(removed)
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> DispatchResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("EX")
            .arg(Self::ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, key: &str, token: &str) -> DispatchResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::Script::new(UNLOCK_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }
}
