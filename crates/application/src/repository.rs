use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{GroupMembership, NormalizedMessage, RepositoryError, StableId};

#[async_trait]
pub trait MembershipRepository: Send + Sync {
    /// 群内所有成员行，包括已离开的
    async fn list_by_group(
        &self,
        group_id: &StableId,
    ) -> Result<Vec<GroupMembership>, RepositoryError>;
    async fn insert(&self, membership: GroupMembership) -> Result<(), RepositoryError>;
    async fn update_nickname(
        &self,
        group_id: &StableId,
        user_id: &StableId,
        nickname: &str,
    ) -> Result<(), RepositoryError>;
    /// 清空离开时间并同步昵称
    async fn rejoin(
        &self,
        group_id: &StableId,
        user_id: &StableId,
        nickname: &str,
    ) -> Result<(), RepositoryError>;
    async fn mark_left(
        &self,
        group_id: &StableId,
        user_id: &StableId,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait MessageLog: Send + Sync {
    // 重复的 msg_id 静默忽略
    async fn append(&self, message: &NormalizedMessage) -> Result<(), RepositoryError>;
}

pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::RwLock;

    #[derive(Default)]
    pub struct MemoryMembershipRepository {
        rows: RwLock<HashMap<(StableId, StableId), GroupMembership>>,
        writes: AtomicUsize,
    }

    impl MemoryMembershipRepository {
        pub fn new() -> Self {
            Self::default()
        }

        /// 写操作次数
        pub fn write_count(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }

        pub async fn find(
            &self,
            group_id: &StableId,
            user_id: &StableId,
        ) -> Option<GroupMembership> {
            self.rows
                .read()
                .await
                .get(&(group_id.clone(), user_id.clone()))
                .cloned()
        }

        async fn modify(
            &self,
            group_id: &StableId,
            user_id: &StableId,
            apply: impl FnOnce(&mut GroupMembership),
        ) -> Result<(), RepositoryError> {
            let mut rows = self.rows.write().await;
            let row = rows
                .get_mut(&(group_id.clone(), user_id.clone()))
                .ok_or(RepositoryError::NotFound)?;
            apply(row);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl MembershipRepository for MemoryMembershipRepository {
        async fn list_by_group(
            &self,
            group_id: &StableId,
        ) -> Result<Vec<GroupMembership>, RepositoryError> {
            let rows = self.rows.read().await;
            let mut members: Vec<_> = rows
                .values()
                .filter(|row| &row.group_id == group_id)
                .cloned()
                .collect();
            members.sort_by(|a, b| a.user_id.cmp(&b.user_id));
            Ok(members)
        }

        async fn insert(&self, membership: GroupMembership) -> Result<(), RepositoryError> {
            let key = (membership.group_id.clone(), membership.user_id.clone());
            self.rows.write().await.insert(key, membership);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn update_nickname(
            &self,
            group_id: &StableId,
            user_id: &StableId,
            nickname: &str,
        ) -> Result<(), RepositoryError> {
            self.modify(group_id, user_id, |row| row.nickname = nickname.to_owned())
                .await
        }

        async fn rejoin(
            &self,
            group_id: &StableId,
            user_id: &StableId,
            nickname: &str,
        ) -> Result<(), RepositoryError> {
            self.modify(group_id, user_id, |row| row.rejoin(nickname))
                .await
        }

        async fn mark_left(
            &self,
            group_id: &StableId,
            user_id: &StableId,
            at: DateTime<Utc>,
        ) -> Result<(), RepositoryError> {
            self.modify(group_id, user_id, |row| row.mark_left(at)).await
        }
    }

    #[derive(Default)]
    pub struct MemoryMessageLog {
        messages: RwLock<Vec<NormalizedMessage>>,
    }

    impl MemoryMessageLog {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn messages(&self) -> Vec<NormalizedMessage> {
            self.messages.read().await.clone()
        }
    }

    #[async_trait]
    impl MessageLog for MemoryMessageLog {
        async fn append(&self, message: &NormalizedMessage) -> Result<(), RepositoryError> {
            let mut messages = self.messages.write().await;
            if messages.iter().all(|m| m.msg_id() != message.msg_id()) {
                messages.push(message.clone());
            }
            Ok(())
        }
    }
}
