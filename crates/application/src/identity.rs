//! 身份解析
//!
//! 把会话级的平台句柄映射成稳定 ID。候选键按特异性从高到低探测，
//! 命中后备键时回写全部键（自愈）；全部未命中时由主键哈希生成新 ID。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use domain::{Identity, IdentityAttributes, RawIdentity, StableId};

use crate::error::ApplicationError;
use crate::kv::{self, KvStore};

#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn resolve(&self, raw: &RawIdentity) -> Result<StableId, ApplicationError>;

    /// 按稳定 ID 查询最近一次见到的身份（包括当前平台句柄）
    async fn lookup(&self, id: &StableId) -> Result<Option<Identity>, ApplicationError>;
}

pub struct KvIdentityResolver {
    store: Arc<dyn KvStore>,
    key_ttl: Duration,
    /// 主键 -> 稳定 ID
    handles: RwLock<HashMap<String, StableId>>,
    /// 稳定 ID -> 最近一次见到的属性
    attributes: RwLock<HashMap<StableId, IdentityAttributes>>,
}

impl KvIdentityResolver {
    pub fn new(store: Arc<dyn KvStore>, key_ttl: Duration) -> Self {
        Self {
            store,
            key_ttl,
            handles: RwLock::new(HashMap::new()),
            attributes: RwLock::new(HashMap::new()),
        }
    }

    fn record_key(id: &StableId) -> String {
        format!("identity:{id}")
    }

    fn cached_id(&self, primary_key: &str) -> Option<StableId> {
        self.handles.read().ok()?.get(primary_key).cloned()
    }

    /// 更新属性缓存，返回属性是否发生变化
    fn remember(&self, primary_key: String, id: &StableId, attributes: IdentityAttributes) -> bool {
        if let Ok(mut handles) = self.handles.write() {
            handles.insert(primary_key, id.clone());
        }
        match self.attributes.write() {
            Ok(mut cache) => cache.insert(id.clone(), attributes.clone()).as_ref() != Some(&attributes),
            Err(_) => true,
        }
    }

    async fn save_record(store: &dyn KvStore, identity: &Identity) -> Result<(), ApplicationError> {
        let encoded = serde_json::to_string(identity)?;
        store.save(&Self::record_key(&identity.id), &encoded).await?;
        Ok(())
    }

    async fn load_record(&self, id: &StableId) -> Result<Option<Identity>, ApplicationError> {
        match self.store.get(&Self::record_key(id)).await? {
            Some(encoded) => Ok(Some(serde_json::from_str(&encoded)?)),
            None => Ok(None),
        }
    }

    /// 属性漂移：后台刷新候选键和身份记录，不阻塞调用方
    fn refresh_in_background(&self, id: StableId, raw: &RawIdentity) {
        let store = self.store.clone();
        let ttl = self.key_ttl;
        let keys = raw.candidate_keys();
        let identity = Identity::from_raw(id.clone(), raw);
        tokio::spawn(async move {
            if let Err(err) = store.save_keys_with_ttl(&keys, id.as_str(), ttl).await {
                tracing::warn!(id = %id, error = %err, "刷新身份索引失败");
                return;
            }
            if let Err(err) = Self::save_record(store.as_ref(), &identity).await {
                tracing::warn!(id = %id, error = %err, "刷新身份记录失败");
            }
        });
    }
}

#[async_trait]
impl IdentityDirectory for KvIdentityResolver {
    async fn resolve(&self, raw: &RawIdentity) -> Result<StableId, ApplicationError> {
        raw.validate()?;
        let primary_key = raw.primary_key();

        if let Some(id) = self.cached_id(&primary_key) {
            if self.remember(primary_key, &id, raw.attributes()) {
                tracing::debug!(id = %id, "身份属性变化，后台刷新索引");
                self.refresh_in_background(id.clone(), raw);
            }
            return Ok(id);
        }

        let keys = raw.candidate_keys();
        let lookup = kv::get_or_compute(self.store.as_ref(), &keys, Some(self.key_ttl), |keys| {
            StableId::derive(&keys[0]).to_string()
        })
        .await?;
        let id = StableId::from(lookup.value);
        if let Some(index) = lookup.hit_index.filter(|index| *index > 0) {
            tracing::info!(id = %id, matched_key = %keys[index], "主键未命中，已通过后备键找回身份");
        }

        let identity = Identity::from_raw(id.clone(), raw);
        if self.load_record(&id).await?.as_ref() != Some(&identity) {
            Self::save_record(self.store.as_ref(), &identity).await?;
        }
        self.remember(primary_key, &id, raw.attributes());
        Ok(id)
    }

    async fn lookup(&self, id: &StableId) -> Result<Option<Identity>, ApplicationError> {
        self.load_record(id).await
    }
}
