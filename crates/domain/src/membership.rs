//! 群成员关系实体

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::StableId;

/// 群成员关系
///
/// 每个 (group_id, user_id) 只有一行；重新入群时清空 `left_at` 而不是新增一行。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembership {
    pub group_id: StableId,
    pub user_id: StableId,
    pub nickname: String,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

impl GroupMembership {
    pub fn new(
        group_id: StableId,
        user_id: StableId,
        nickname: impl Into<String>,
        joined_at: DateTime<Utc>,
    ) -> Self {
        Self {
            group_id,
            user_id,
            nickname: nickname.into(),
            joined_at,
            left_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }

    pub fn mark_left(&mut self, at: DateTime<Utc>) {
        self.left_at = Some(at);
    }

    /// 重新入群：清空离开时间并同步昵称
    pub fn rejoin(&mut self, nickname: impl Into<String>) {
        self.left_at = None;
        self.nickname = nickname.into();
    }
}
