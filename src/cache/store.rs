//! 远程键值缓存抽象与进程内实现
//!
//! 生产环境由外部（Redis 等）实现 `RemoteCache`；`InMemoryCache` 用于单机部署与测试。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::CacheError;

/// 远程缓存接口
#[async_trait]
pub trait RemoteCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// 剩余 TTL（毫秒）；key 不存在或无过期时间返回 None
    async fn ttl_remaining_ms(&self, key: &str) -> Result<Option<i64>, CacheError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// 进程内缓存：读多写少用 RwLock；同 key 并发写入后写者覆盖
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 含未清理过期条目在内的实际条目数
    pub async fn stored_entries(&self) -> usize {
        self.entries.read().await.len()
    }

    /// 直接写入原始值（测试中用于构造损坏条目）
    pub async fn put_raw(&self, key: &str, value: &str, ttl: Duration) {
        if let Err(e) = self.insert(key, value, ttl).await {
            tracing::warn!(key, error = %e, "raw cache write skipped");
        }
    }

    /// 写入时顺带清掉已过期条目
    async fn insert(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl)
            .ok_or_else(|| CacheError::Store(format!("ttl overflow for key {key}")))?;
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| e.expires_at > now);
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl RemoteCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(e) if e.expires_at > now => return Ok(Some(e.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // 过期条目惰性清理
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| e.expires_at <= now) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        if ttl.is_zero() {
            return Err(CacheError::Store(format!("non-positive ttl for key {key}")));
        }
        self.insert(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn ttl_remaining_ms(&self, key: &str) -> Result<Option<i64>, CacheError> {
        let now = Instant::now();
        Ok(self
            .entries
            .read()
            .await
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.expires_at.duration_since(now).as_millis() as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = InMemoryCache::new();
        cache
            .set_with_ttl("k", "v", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
        let ttl = cache.ttl_remaining_ms("k").await.unwrap().unwrap();
        assert!(ttl > 0 && ttl <= 60_000);
        cache.delete("k").await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.ttl_remaining_ms("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let cache = InMemoryCache::new();
        cache.set_with_ttl("k", "a", Duration::from_secs(10)).await.unwrap();
        cache.set_with_ttl("k", "b", Duration::from_secs(20)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("b"));
        assert!(cache.ttl_remaining_ms("k").await.unwrap().unwrap() > 10_000);
    }

    #[tokio::test]
    async fn test_last_writer_ttl_applies() {
        let cache = InMemoryCache::new();
        cache.set_with_ttl("k", "a", Duration::from_secs(60)).await.unwrap();
        cache.set_with_ttl("k", "b", Duration::from_secs(5)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("b"));
        let ttl = cache.ttl_remaining_ms("k").await.unwrap().unwrap();
        assert!(ttl > 0 && ttl <= 5_000);
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent() {
        let cache = InMemoryCache::new();
        cache.put_raw("k", "v", Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_write_sweeps_expired_keys() {
        let cache = InMemoryCache::new();
        for i in 0..5 {
            cache
                .set_with_ttl(&format!("old-{i}"), "v", Duration::from_millis(1))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.stored_entries().await, 5);
        cache.set_with_ttl("new", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.stored_entries().await, 1);
        assert_eq!(cache.get("new").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_overflowing_ttl_rejected_without_panic() {
        let cache = InMemoryCache::new();
        assert!(cache.set_with_ttl("k", "v", Duration::MAX).await.is_err());
        cache.put_raw("k", "v", Duration::MAX).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert_eq!(cache.stored_entries().await, 0);
    }

    #[tokio::test]
    async fn test_zero_ttl_rejected() {
        let cache = InMemoryCache::new();
        assert!(cache.set_with_ttl("k", "v", Duration::ZERO).await.is_err());
    }
}
