//! 消息去重闸门
//!
//! 持久化存储上的原子 check-and-set 是唯一判据；前面的 LRU 只缓存“已经见过”的结果，
//! 用来吸收重连后的批量重投。

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;

use crate::kv::{KvError, KvStore};

/// 默认缓存容量
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Duplicate,
}

pub struct DedupGate {
    store: Arc<dyn KvStore>,
    seen: Mutex<LruCache<String, ()>>,
    ttl: Option<Duration>,
}

impl DedupGate {
    pub fn new(store: Arc<dyn KvStore>, capacity: usize, ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            seen: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn record_key(msg_id: &str) -> String {
        format!("dedup:msg:{msg_id}")
    }

    fn cached(&self, msg_id: &str) -> bool {
        self.seen
            .lock()
            .map(|mut seen| seen.get(msg_id).is_some())
            .unwrap_or(false)
    }

    fn remember(&self, msg_id: &str) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.put(msg_id.to_owned(), ());
        }
    }

    /// 判断消息是否第一次出现。空 ID 的临时通知总是放行且不记录。
    ///
    /// 存储故障直接返回错误，调用方放弃处理这条消息。
    pub async fn admit(&self, msg_id: &str) -> Result<Admission, KvError> {
        if msg_id.is_empty() {
            return Ok(Admission::Admitted);
        }
        if self.cached(msg_id) {
            return Ok(Admission::Duplicate);
        }

        let fresh = self
            .store
            .set_if_absent(&Self::record_key(msg_id), "1", self.ttl)
            .await?;
        self.remember(msg_id);

        Ok(if fresh {
            Admission::Admitted
        } else {
            Admission::Duplicate
        })
    }
}
