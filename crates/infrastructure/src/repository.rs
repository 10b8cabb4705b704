use application::repository::{MembershipRepository, MessageLog};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{GroupMembership, NormalizedMessage, RepositoryError, StableId};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};

pub(crate) fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    RepositoryError::storage(err.to_string())
}

#[derive(Debug, FromRow)]
struct MembershipRecord {
    gid: String,
    uid: String,
    nickname: String,
    joined_at: DateTime<Utc>,
    left_at: Option<DateTime<Utc>>,
}

impl From<MembershipRecord> for GroupMembership {
    fn from(value: MembershipRecord) -> Self {
        GroupMembership {
            group_id: StableId::from(value.gid),
            user_id: StableId::from(value.uid),
            nickname: value.nickname,
            joined_at: value.joined_at,
            left_at: value.left_at,
        }
    }
}

#[derive(Clone)]
pub struct PgMembershipRepository {
    pool: PgPool,
}

impl PgMembershipRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn execute_update(
        &self,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<(), RepositoryError> {
        let result = query.execute(&self.pool).await.map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}

#[async_trait]
impl MembershipRepository for PgMembershipRepository {
    async fn list_by_group(
        &self,
        group_id: &StableId,
    ) -> Result<Vec<GroupMembership>, RepositoryError> {
        let records = sqlx::query_as::<_, MembershipRecord>(
            r#"
            SELECT gid, uid, nickname, joined_at, left_at
            FROM group_members
            WHERE gid = $1
            ORDER BY joined_at
            "#,
        )
        .bind(group_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(records.into_iter().map(GroupMembership::from).collect())
    }

    async fn insert(&self, membership: GroupMembership) -> Result<(), RepositoryError> {
        // 主键冲突说明行已存在（并发对账），按重新入群处理
        sqlx::query(
            r#"
            INSERT INTO group_members (gid, uid, nickname, joined_at, left_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (gid, uid) DO UPDATE
            SET nickname = EXCLUDED.nickname, left_at = EXCLUDED.left_at
            "#,
        )
        .bind(membership.group_id.as_str())
        .bind(membership.user_id.as_str())
        .bind(&membership.nickname)
        .bind(membership.joined_at)
        .bind(membership.left_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn update_nickname(
        &self,
        group_id: &StableId,
        user_id: &StableId,
        nickname: &str,
    ) -> Result<(), RepositoryError> {
        self.execute_update(
            sqlx::query("UPDATE group_members SET nickname = $3 WHERE gid = $1 AND uid = $2")
                .bind(group_id.as_str())
                .bind(user_id.as_str())
                .bind(nickname),
        )
        .await
    }

    async fn rejoin(
        &self,
        group_id: &StableId,
        user_id: &StableId,
        nickname: &str,
    ) -> Result<(), RepositoryError> {
        self.execute_update(
            sqlx::query(
                "UPDATE group_members SET nickname = $3, left_at = NULL WHERE gid = $1 AND uid = $2",
            )
            .bind(group_id.as_str())
            .bind(user_id.as_str())
            .bind(nickname),
        )
        .await
    }

    async fn mark_left(
        &self,
        group_id: &StableId,
        user_id: &StableId,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.execute_update(
            sqlx::query(
                "UPDATE group_members SET left_at = $3 WHERE gid = $1 AND uid = $2 AND left_at IS NULL",
            )
            .bind(group_id.as_str())
            .bind(user_id.as_str())
            .bind(at),
        )
        .await
    }
}

#[derive(Clone)]
pub struct PgMessageLog {
    pool: PgPool,
}

impl PgMessageLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageLog for PgMessageLog {
    async fn append(&self, message: &NormalizedMessage) -> Result<(), RepositoryError> {
        let content = message
            .summary()
            .map_err(|err| RepositoryError::storage(err.to_string()))?;
        let envelope = &message.envelope;

        sqlx::query(
            r#"
            INSERT INTO messages (msg_id, msg_type, time, gid, group_name, uid, username, content)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (msg_id) DO NOTHING
            "#,
        )
        .bind(&envelope.msg_id)
        .bind(envelope.msg_type)
        .bind(envelope.time)
        .bind(envelope.gid.as_ref().map(StableId::as_str))
        .bind(envelope.group_name.as_deref())
        .bind(envelope.uid.as_ref().map(StableId::as_str))
        .bind(envelope.username.as_deref())
        .bind(content)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
