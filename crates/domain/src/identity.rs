//! 稳定身份定义
//!
//! 平台句柄（platform handle）在每次登录后都可能变化，而稳定 ID 由规范键
//! 确定性地推导出来，跨会话保持不变。

use std::fmt;

use data_encoding::HEXLOWER;
use ring::digest;
use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};

/// 稳定 ID 的十六进制长度
pub const STABLE_ID_LEN: usize = 16;

/// 与平台无关的稳定标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StableId(String);

impl StableId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// 由规范键推导稳定 ID（SHA-256 的十六进制前缀）
    pub fn derive(canonical_key: &str) -> Self {
        let hashed = digest::digest(&digest::SHA256, canonical_key.as_bytes());
        let mut encoded = HEXLOWER.encode(hashed.as_ref());
        encoded.truncate(STABLE_ID_LEN);
        Self(encoded)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for StableId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for StableId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    User,
    Group,
}

impl IdentityKind {
    fn key_prefix(self) -> &'static str {
        match self {
            IdentityKind::User => "user",
            IdentityKind::Group => "group",
        }
    }
}

/// 平台回调中拿到的原始身份信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawIdentity {
    pub kind: IdentityKind,
    /// 会话级句柄，重新登录后可能变化
    pub platform_handle: String,
    pub nickname: String,
    /// 群内备注名
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub avatar_id: String,
    #[serde(default)]
    pub attr_status: i64,
}

impl RawIdentity {
    pub fn user(platform_handle: impl Into<String>, nickname: impl Into<String>) -> Self {
        Self::new(IdentityKind::User, platform_handle, nickname)
    }

    pub fn group(platform_handle: impl Into<String>, nickname: impl Into<String>) -> Self {
        Self::new(IdentityKind::Group, platform_handle, nickname)
    }

    fn new(
        kind: IdentityKind,
        platform_handle: impl Into<String>,
        nickname: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            platform_handle: platform_handle.into(),
            nickname: nickname.into(),
            display_name: String::new(),
            avatar_id: String::new(),
            attr_status: 0,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn with_avatar_id(mut self, avatar_id: impl Into<String>) -> Self {
        self.avatar_id = avatar_id.into();
        self
    }

    pub fn with_attr_status(mut self, attr_status: i64) -> Self {
        self.attr_status = attr_status;
        self
    }

    /// 群备注名优先，否则昵称
    pub fn name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.nickname
        } else {
            &self.display_name
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.platform_handle.trim().is_empty() {
            return Err(DomainError::invalid_identity("platform handle is empty"));
        }
        Ok(())
    }

    /// 主键：平台句柄
    pub fn primary_key(&self) -> String {
        format!("{}:uid:{}", self.kind.key_prefix(), self.platform_handle)
    }

    /// 候选查找键，按特异性从高到低排列，第一个永远是主键。
    ///
    /// 组成部分为空的键会被跳过。
    pub fn candidate_keys(&self) -> Vec<String> {
        let prefix = self.kind.key_prefix();
        let nick = self.nickname.as_str();
        let avatar = self.avatar_id.as_str();
        let display = self.display_name.as_str();

        let mut keys = vec![self.primary_key()];
        if !nick.is_empty() && !avatar.is_empty() {
            keys.push(format!("{prefix}:nick_avatar:{nick}:{avatar}"));
        }
        if self.kind == IdentityKind::User {
            let attr = self.attr_status;
            if attr != 0 && !nick.is_empty() {
                keys.push(format!("{prefix}:attr_nick:{attr}:{nick}"));
            }
            if attr != 0 && !display.is_empty() {
                keys.push(format!("{prefix}:attr_display:{attr}:{display}"));
            }
            if !nick.is_empty() && !display.is_empty() {
                keys.push(format!("{prefix}:nick_display:{nick}:{display}"));
            }
        }
        if !nick.is_empty() {
            keys.push(format!("{prefix}:nick:{nick}"));
        }
        keys
    }

    pub fn attributes(&self) -> IdentityAttributes {
        IdentityAttributes {
            nickname: self.nickname.clone(),
            display_name: self.display_name.clone(),
            avatar_id: self.avatar_id.clone(),
            attr_status: self.attr_status,
        }
    }
}

/// 用于检测属性漂移的快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityAttributes {
    pub nickname: String,
    pub display_name: String,
    pub avatar_id: String,
    pub attr_status: i64,
}

/// 已解析的身份
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: StableId,
    pub kind: IdentityKind,
    pub display_name: String,
    pub platform_handle: String,
}

impl Identity {
    pub fn from_raw(id: StableId, raw: &RawIdentity) -> Self {
        Self {
            id,
            kind: raw.kind,
            display_name: raw.name().to_owned(),
            platform_handle: raw.platform_handle.clone(),
        }
    }
}
