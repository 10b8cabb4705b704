use async_trait::async_trait;

/// 用户名密码校验
///
/// 任何失败（用户不存在、存储异常、哈希不匹配）都只返回 `false`。
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait CredentialCheck: Send + Sync {
    async fn check_user(&self, username: &str, password: &str) -> bool;
}
