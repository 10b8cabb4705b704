//! 群成员对账
//!
//! 平台不会推送“静默退群”事件，只能定期拿当前成员列表和已存的成员行做差。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use domain::{GroupMembership, Identity, IdentityKind, RawIdentity, StableId};

use crate::clock::Clock;
use crate::error::ApplicationError;
use crate::identity::IdentityDirectory;
use crate::repository::MembershipRepository;

pub struct RosterReconciler {
    directory: Arc<dyn IdentityDirectory>,
    memberships: Arc<dyn MembershipRepository>,
    clock: Arc<dyn Clock>,
}

impl RosterReconciler {
    pub fn new(
        directory: Arc<dyn IdentityDirectory>,
        memberships: Arc<dyn MembershipRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            directory,
            memberships,
            clock,
        }
    }

    /// 对账并返回本次发现的离群成员
    ///
    /// 新成员插入，改名的更新昵称，之前标记离开又出现的清空离开时间；
    /// 存储里仍在群但当前列表里没有的成员打上离开时间。
    /// 任一成员解析失败时不判定离群，避免误报。
    pub async fn reconcile(
        &self,
        group_id: &StableId,
        current: &[RawIdentity],
    ) -> Result<Vec<Identity>, ApplicationError> {
        let mut stored: HashMap<StableId, GroupMembership> = self
            .memberships
            .list_by_group(group_id)
            .await?
            .into_iter()
            .map(|row| (row.user_id.clone(), row))
            .collect();
        let now = self.clock.now();
        let mut seen = HashSet::new();
        let mut complete = true;

        for raw in current {
            let user_id = match self.directory.resolve(raw).await {
                Ok(id) => id,
                Err(err) => {
                    tracing::warn!(gid = %group_id, handle = %raw.platform_handle, error = %err, "解析群成员身份失败");
                    complete = false;
                    continue;
                }
            };
            if !seen.insert(user_id.clone()) {
                continue;
            }

            let nickname = raw.name();
            let written = match stored.remove(&user_id) {
                None => {
                    self.memberships
                        .insert(GroupMembership::new(group_id.clone(), user_id.clone(), nickname, now))
                        .await
                }
                Some(row) if !row.is_active() => {
                    self.memberships.rejoin(group_id, &user_id, nickname).await
                }
                Some(row) if row.nickname != nickname => {
                    self.memberships
                        .update_nickname(group_id, &user_id, nickname)
                        .await
                }
                Some(_) => Ok(()),
            };
            if let Err(err) = written {
                tracing::warn!(gid = %group_id, uid = %user_id, error = %err, "更新群成员失败");
            }
        }

        if !complete {
            tracing::warn!(gid = %group_id, "成员列表不完整，跳过离群判定");
            return Ok(Vec::new());
        }

        let mut departed: Vec<GroupMembership> =
            stored.into_values().filter(GroupMembership::is_active).collect();
        departed.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        let mut left = Vec::with_capacity(departed.len());
        for row in departed {
            if let Err(err) = self.memberships.mark_left(group_id, &row.user_id, now).await {
                tracing::warn!(gid = %group_id, uid = %row.user_id, error = %err, "标记离群失败");
                continue;
            }
            let platform_handle = match self.directory.lookup(&row.user_id).await {
                Ok(Some(identity)) => identity.platform_handle,
                _ => String::new(),
            };
            left.push(Identity {
                id: row.user_id,
                kind: IdentityKind::User,
                display_name: row.nickname,
                platform_handle,
            });
        }
        Ok(left)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::identity::KvIdentityResolver;
    use crate::kv::memory::MemoryKvStore;
    use crate::repository::memory::MemoryMembershipRepository;
    use std::time::Duration;

    struct Fixture {
        directory: Arc<KvIdentityResolver>,
        repository: Arc<MemoryMembershipRepository>,
        reconciler: RosterReconciler,
        group: StableId,
    }

    fn fixture() -> Fixture {
        let directory = Arc::new(KvIdentityResolver::new(
            Arc::new(MemoryKvStore::new()),
            Duration::from_secs(3600),
        ));
        let repository = Arc::new(MemoryMembershipRepository::new());
        let reconciler = RosterReconciler::new(
            directory.clone(),
            repository.clone(),
            Arc::new(SystemClock),
        );
        Fixture {
            directory,
            repository,
            reconciler,
            group: StableId::from("group-1"),
        }
    }

    fn member(name: &str) -> RawIdentity {
        RawIdentity::user(format!("@{name}"), name)
    }

    #[tokio::test]
    async fn reports_departures_and_adds_newcomers_without_spurious_writes() {
        let f = fixture();
        let initial = [member("a"), member("b"), member("c")];
        assert!(f.reconciler.reconcile(&f.group, &initial).await.unwrap().is_empty());
        let writes_before = f.repository.write_count();

        let current = [member("a"), member("c"), member("d")];
        let left = f.reconciler.reconcile(&f.group, &current).await.unwrap();

        let b = f.directory.resolve(&member("b")).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, b);
        assert_eq!(left[0].display_name, "b");
        // 一次插入 d，一次标记 b
        assert_eq!(f.repository.write_count() - writes_before, 2);

        let d = f.directory.resolve(&member("d")).await.unwrap();
        assert!(f.repository.find(&f.group, &d).await.unwrap().is_active());
        assert!(!f.repository.find(&f.group, &b).await.unwrap().is_active());
    }

    #[tokio::test]
    async fn departures_are_reported_once() {
        let f = fixture();
        f.reconciler
            .reconcile(&f.group, &[member("a"), member("b")])
            .await
            .unwrap();
        assert_eq!(
            f.reconciler.reconcile(&f.group, &[member("a")]).await.unwrap().len(),
            1
        );
        assert!(f
            .reconciler
            .reconcile(&f.group, &[member("a")])
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn rejoin_clears_left_at_and_renames_update_nickname() {
        let f = fixture();
        f.reconciler
            .reconcile(&f.group, &[member("a"), member("b")])
            .await
            .unwrap();
        f.reconciler.reconcile(&f.group, &[member("a")]).await.unwrap();

        let renamed_a = member("a").with_display_name("Captain A");
        let left = f
            .reconciler
            .reconcile(&f.group, &[renamed_a, member("b")])
            .await
            .unwrap();
        assert!(left.is_empty());

        let a = f.directory.resolve(&member("a")).await.unwrap();
        let b = f.directory.resolve(&member("b")).await.unwrap();
        assert_eq!(f.repository.find(&f.group, &a).await.unwrap().nickname, "Captain A");
        assert!(f.repository.find(&f.group, &b).await.unwrap().is_active());
    }

    #[tokio::test]
    async fn unresolvable_member_suppresses_departure_detection() {
        let f = fixture();
        f.reconciler
            .reconcile(&f.group, &[member("a"), member("b")])
            .await
            .unwrap();

        let broken = RawIdentity::user("", "b");
        let left = f
            .reconciler
            .reconcile(&f.group, &[member("a"), broken])
            .await
            .unwrap();
        assert!(left.is_empty());
    }
}
