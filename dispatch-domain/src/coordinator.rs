//! 键值协调器（Coordinator）协议
//!
//! 对外部内存存储（如 Redis）的最小封装，提供：
//! - 原子计数（`incr_by`）与 TTL 键；
//! - 非可重入的协作式互斥锁（`try_lock`/`unlock`，带持有者令牌）；
//! - 标识生成与消费端互斥所依赖的存在性检查。
//!
//! 该模块仅定义协议与内存实现，不绑定具体存储；锁为建议性（advisory），
//! 不阻止其他调用方绕过锁键直接修改数据。
//!
use crate::error::{DispatchError, DispatchResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// 键值协调器：原子计数、TTL 键与协作式互斥锁
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn get(&self, key: &str) -> DispatchResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> DispatchResult<()>;

    /// 写入并设置过期时间（单次原子调用）
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> DispatchResult<()>;

    /// 原子自增，返回自增后的值；键不存在时从 0 起算
    async fn incr_by(&self, key: &str, delta: i64) -> DispatchResult<i64>;

    /// 为已有键设置过期时间，键不存在返回 `false`
    async fn expire(&self, key: &str, ttl: Duration) -> DispatchResult<bool>;

    async fn exists(&self, key: &str) -> DispatchResult<bool>;

    /// 删除一批键，返回实际删除数量
    async fn del(&self, keys: &[&str]) -> DispatchResult<u64>;

    /// 尝试获取互斥锁：set-if-absent 与过期时间为同一原子操作。
    /// 返回 `true` 表示本调用方持有锁；锁不可重入。
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> DispatchResult<bool>;

    /// 释放互斥锁：仅当存储的令牌与 `token` 一致时删除，返回是否删除
    async fn unlock(&self, key: &str, token: &str) -> DispatchResult<bool>;
}

/// 锁获取辅助：协调器不可用时暂停片刻后重试一次，仍失败则上抛
#[cfg(feature = "engine")]
pub async fn try_lock_with_retry(
    coordinator: &dyn Coordinator,
    key: &str,
    token: &str,
    ttl: Duration,
) -> DispatchResult<bool> {
    match coordinator.try_lock(key, token, ttl).await {
        Ok(acquired) => Ok(acquired),
        Err(DispatchError::Coordinator { reason }) => {
            tracing::warn!(key, %reason, "coordinator unavailable, retrying lock once");
            tokio::time::sleep(Duration::from_millis(100)).await;
            coordinator.try_lock(key, token, ttl).await
        }
        Err(other) => Err(other),
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// 内存版协调器实现
///
/// 语义与 Redis 适配保持一致（含原子 set-if-absent-with-expiry 的锁），
/// 典型用途：测试环境、示例与本地开发。
#[derive(Debug, Default)]
pub struct InMemoryCoordinator {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 查询键的剩余存活时间；键不存在或无过期时间返回 `None`
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.lock().expect("coordinator mutex poisoned");
        entries
            .get(key)
            .filter(|e| e.live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>, Instant) -> T) -> T {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("coordinator mutex poisoned");
        entries.retain(|_, e| e.live(now));
        f(&mut entries, now)
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    async fn get(&self, key: &str) -> DispatchResult<Option<String>> {
        Ok(self.with_entries(|entries, _| entries.get(key).map(|e| e.value.clone())))
    }

    async fn set(&self, key: &str, value: &str) -> DispatchResult<()> {
        self.with_entries(|entries, _| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: None,
                },
            );
        });
        Ok(())
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> DispatchResult<()> {
        self.with_entries(|entries, now| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Some(now + ttl),
                },
            );
        });
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> DispatchResult<i64> {
        self.with_entries(|entries, _| {
            let current = match entries.get(key) {
                Some(e) => e
                    .value
                    .parse::<i64>()
                    .map_err(|_| DispatchError::coordinator("value is not an integer"))?,
                None => 0,
            };
            let next = current + delta;
            let expires_at = entries.get(key).and_then(|e| e.expires_at);
            entries.insert(
                key.to_string(),
                Entry {
                    value: next.to_string(),
                    expires_at,
                },
            );
            Ok(next)
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> DispatchResult<bool> {
        Ok(self.with_entries(|entries, now| match entries.get_mut(key) {
            Some(e) => {
                e.expires_at = Some(now + ttl);
                true
            }
            None => false,
        }))
    }

    async fn exists(&self, key: &str) -> DispatchResult<bool> {
        Ok(self.with_entries(|entries, _| entries.contains_key(key)))
    }

    async fn del(&self, keys: &[&str]) -> DispatchResult<u64> {
        Ok(self.with_entries(|entries, _| {
            keys.iter()
                .filter(|k| entries.remove(**k).is_some())
                .count() as u64
        }))
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> DispatchResult<bool> {
        Ok(self.with_entries(|entries, now| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: token.to_string(),
                    expires_at: Some(now + ttl),
                },
            );
            true
        }))
    }

    async fn unlock(&self, key: &str, token: &str) -> DispatchResult<bool> {
        Ok(self.with_entries(|entries, _| {
            if entries.get(key).is_some_and(|e| e.value == token) {
                entries.remove(key);
                true
            } else {
                false
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn incr_by_is_cumulative_and_preserves_expiry() {
        let c = InMemoryCoordinator::new();
        assert_eq!(c.incr_by("seq", 1).await.unwrap(), 1);
        assert_eq!(c.incr_by("seq", 5).await.unwrap(), 6);

        c.expire("seq", Duration::from_secs(60)).await.unwrap();
        c.incr_by("seq", 1).await.unwrap();
        assert!(c.ttl("seq").is_some());
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released_or_expired() {
        let c = InMemoryCoordinator::new();
        let ttl = Duration::from_millis(20);

        assert!(c.try_lock("lock:a", "t1", ttl).await.unwrap());
        assert!(!c.try_lock("lock:a", "t2", ttl).await.unwrap());

        // 非持有者的令牌不能释放
        assert!(!c.unlock("lock:a", "t2").await.unwrap());
        assert!(c.unlock("lock:a", "t1").await.unwrap());
        assert!(c.try_lock("lock:a", "t2", ttl).await.unwrap());

        // 过期后可重新获取
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(c.try_lock("lock:a", "t3", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_keys_behave_as_absent() {
        let c = InMemoryCoordinator::new();
        c.set_with_expiry("k", "v", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(c.exists("k").await.unwrap());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!c.exists("k").await.unwrap());
        assert_eq!(c.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn del_returns_removed_count() {
        let c = InMemoryCoordinator::new();
        c.set("a", "1").await.unwrap();
        c.set("b", "2").await.unwrap();
        assert_eq!(c.del(&["a", "b", "missing"]).await.unwrap(), 2);
    }

    #[cfg(feature = "engine")]
    mod lock_retry {
        use super::*;
        use async_trait::async_trait;
        use std::sync::atomic::{AtomicU32, Ordering};

        /// 协调器桩：`try_lock` 先按序弹出预置错误，耗尽后成功
        #[derive(Default)]
        struct FlakyLock {
            failures: Mutex<Vec<DispatchError>>,
            attempts: AtomicU32,
        }

        #[async_trait]
        impl Coordinator for FlakyLock {
            async fn get(&self, _key: &str) -> DispatchResult<Option<String>> {
                Ok(None)
            }
            async fn set(&self, _key: &str, _value: &str) -> DispatchResult<()> {
                Ok(())
            }
            async fn set_with_expiry(
                &self,
                _key: &str,
                _value: &str,
                _ttl: Duration,
            ) -> DispatchResult<()> {
                Ok(())
            }
            async fn incr_by(&self, _key: &str, _delta: i64) -> DispatchResult<i64> {
                Ok(0)
            }
            async fn expire(&self, _key: &str, _ttl: Duration) -> DispatchResult<bool> {
                Ok(false)
            }
            async fn exists(&self, _key: &str) -> DispatchResult<bool> {
                Ok(false)
            }
            async fn del(&self, _keys: &[&str]) -> DispatchResult<u64> {
                Ok(0)
            }
            async fn try_lock(
                &self,
                _key: &str,
                _token: &str,
                _ttl: Duration,
            ) -> DispatchResult<bool> {
                self.attempts.fetch_add(1, Ordering::Relaxed);
                match self.failures.lock().unwrap().pop() {
                    Some(err) => Err(err),
                    None => Ok(true),
                }
            }
            async fn unlock(&self, _key: &str, _token: &str) -> DispatchResult<bool> {
                Ok(true)
            }
        }

        #[tokio::test]
        async fn coordinator_outage_is_retried_once() {
            let c = FlakyLock::default();
            *c.failures.lock().unwrap() = vec![DispatchError::coordinator("connection refused")];

            let acquired = try_lock_with_retry(&c, "lock:a", "t1", Duration::from_secs(5))
                .await
                .unwrap();
            assert!(acquired);
            assert_eq!(c.attempts.load(Ordering::Relaxed), 2);
        }

        #[tokio::test]
        async fn persistent_outage_surfaces_after_the_single_retry() {
            let c = FlakyLock::default();
            *c.failures.lock().unwrap() = vec![
                DispatchError::coordinator("still down"),
                DispatchError::coordinator("connection refused"),
            ];

            let err = try_lock_with_retry(&c, "lock:a", "t1", Duration::from_secs(5))
                .await
                .unwrap_err();
            assert!(matches!(err, DispatchError::Coordinator { .. }));
            assert_eq!(c.attempts.load(Ordering::Relaxed), 2);
        }

        #[tokio::test]
        async fn non_coordinator_errors_are_not_retried() {
            let c = FlakyLock::default();
            *c.failures.lock().unwrap() = vec![DispatchError::configuration("bad key")];

            let err = try_lock_with_retry(&c, "lock:a", "t1", Duration::from_secs(5))
                .await
                .unwrap_err();
            assert!(matches!(err, DispatchError::Configuration { .. }));
            assert_eq!(c.attempts.load(Ordering::Relaxed), 1);
        }
    }
}
