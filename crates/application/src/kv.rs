//! 键值存储端口
//!
//! 身份解析和消息去重都构建在这个接口之上。`put_if_absent` 必须是一次原子往返，
//! 不能拆成先读后写。

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("kv backend error: {0}")]
    Backend(String),
}

impl KvError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// 写入单个键，`ttl` 为 `None` 时永久保存
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// 同一个值写入多个键
    async fn set_many(
        &self,
        keys: &[String],
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), KvError>;

    /// 原子的“不存在才写入”，写入成功返回 `true`
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError>;

    async fn save(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.set(key, value, None).await
    }

    async fn save_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        self.set(key, value, Some(ttl)).await
    }

    async fn save_keys(&self, keys: &[String], value: &str) -> Result<(), KvError> {
        self.set_many(keys, value, None).await
    }

    async fn save_keys_with_ttl(
        &self,
        keys: &[String],
        value: &str,
        ttl: Duration,
    ) -> Result<(), KvError> {
        self.set_many(keys, value, Some(ttl)).await
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> Result<bool, KvError> {
        self.set_if_absent(key, value, None).await
    }

    async fn put_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        self.set_if_absent(key, value, Some(ttl)).await
    }
}

/// 多键查找的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLookup {
    pub value: String,
    /// 命中的键下标；`None` 表示全部未命中、值是新计算出来的
    pub hit_index: Option<usize>,
}

impl KeyLookup {
    pub fn is_computed(&self) -> bool {
        self.hit_index.is_none()
    }
}

/// 按顺序探测 `keys`；全部未命中时调用 `compute` 并写入所有键。
///
/// 命中非首个键时把所有键重新指向命中的值，下次主键即可直接命中。
pub async fn get_or_compute(
    store: &dyn KvStore,
    keys: &[String],
    ttl: Option<Duration>,
    compute: impl FnOnce(&[String]) -> String + Send,
) -> Result<KeyLookup, KvError> {
    for (index, key) in keys.iter().enumerate() {
        if let Some(value) = store.get(key).await? {
            if index > 0 {
                store.set_many(keys, &value, ttl).await?;
            }
            return Ok(KeyLookup {
                value,
                hit_index: Some(index),
            });
        }
    }

    let value = compute(keys);
    store.set_many(keys, &value, ttl).await?;
    Ok(KeyLookup {
        value,
        hit_index: None,
    })
}

/// 内存实现，用于测试和无 Redis 的本地运行
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Default)]
    pub struct MemoryKvStore {
        entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
    }

    impl MemoryKvStore {
        pub fn new() -> Self {
            Self::default()
        }

        fn deadline(ttl: Option<Duration>) -> Option<Instant> {
            ttl.map(|ttl| Instant::now() + ttl)
        }

        fn is_live(entry: &(String, Option<Instant>)) -> bool {
            entry.1.map_or(true, |deadline| deadline > Instant::now())
        }
    }

    #[async_trait]
    impl KvStore for MemoryKvStore {
        async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
            let entries = self.entries.lock().await;
            Ok(entries
                .get(key)
                .filter(|entry| Self::is_live(entry))
                .map(|(value, _)| value.clone()))
        }

        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
            let mut entries = self.entries.lock().await;
            entries.insert(key.to_owned(), (value.to_owned(), Self::deadline(ttl)));
            Ok(())
        }

        async fn set_many(
            &self,
            keys: &[String],
            value: &str,
            ttl: Option<Duration>,
        ) -> Result<(), KvError> {
            let mut entries = self.entries.lock().await;
            let deadline = Self::deadline(ttl);
            for key in keys {
                entries.insert(key.clone(), (value.to_owned(), deadline));
            }
            Ok(())
        }

        async fn set_if_absent(
            &self,
            key: &str,
            value: &str,
            ttl: Option<Duration>,
        ) -> Result<bool, KvError> {
            let mut entries = self.entries.lock().await;
            if entries.get(key).is_some_and(Self::is_live) {
                return Ok(false);
            }
            entries.insert(key.to_owned(), (value.to_owned(), Self::deadline(ttl)));
            Ok(true)
        }
    }
}
