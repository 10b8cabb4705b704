//! 认证账号存储
//!
//! `auth_user` 表保存 bcrypt 哈希。校验失败的任何原因（账号不存在、哈希损坏、数据库故障）
//! 对调用方都只是 `false`。

use application::CredentialCheck;
use async_trait::async_trait;
use bcrypt::{hash, verify, DEFAULT_COST};
use domain::RepositoryError;
use sqlx::PgPool;

use crate::repository::map_sqlx_err;

#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
    cost: u32,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool, cost: Option<u32>) -> Self {
        Self {
            pool,
            cost: cost.unwrap_or(DEFAULT_COST),
        }
    }

    /// 配置了初始账号时写入（已存在则更新密码）
    pub async fn ensure_user(&self, username: &str, password: &str) -> Result<(), RepositoryError> {
        let hashed = hash_password(password.to_owned(), self.cost).await?;
        sqlx::query(
            r#"
            INSERT INTO auth_user (username, password)
            VALUES ($1, $2)
            ON CONFLICT (username) DO UPDATE SET password = EXCLUDED.password
            "#,
        )
        .bind(username)
        .bind(hashed)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        tracing::info!(username, "认证账号已就绪");
        Ok(())
    }

    async fn stored_hash(&self, username: &str) -> Result<Option<String>, RepositoryError> {
        sqlx::query_scalar::<_, String>("SELECT password FROM auth_user WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)
    }
}

#[async_trait]
impl CredentialCheck for PgCredentialStore {
    async fn check_user(&self, username: &str, password: &str) -> bool {
        if username.is_empty() || password.is_empty() {
            return false;
        }
        let hashed = match self.stored_hash(username).await {
            Ok(Some(hashed)) => hashed,
            Ok(None) => return false,
            Err(err) => {
                tracing::warn!(error = %err, "查询认证账号失败");
                return false;
            }
        };
        verify_password(password.to_owned(), hashed).await
    }
}

pub(crate) async fn hash_password(plaintext: String, cost: u32) -> Result<String, RepositoryError> {
    tokio::task::spawn_blocking(move || hash(plaintext, cost))
        .await
        .map_err(|err| RepositoryError::storage(err.to_string()))
        .and_then(|res| res.map_err(|err| RepositoryError::storage(err.to_string())))
}

pub(crate) async fn verify_password(plaintext: String, hashed: String) -> bool {
    tokio::task::spawn_blocking(move || verify(plaintext, &hashed))
        .await
        .ok()
        .and_then(Result::ok)
        .unwrap_or(false)
}
