use domain::{DomainError, RepositoryError};
use thiserror::Error;

use crate::{kv::KvError, platform::PlatformError, resource::ResourceError};

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(RepositoryError),
    #[error("kv store error: {0}")]
    Store(#[from] KvError),
    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),
    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("群不存在: {0}")]
    GroupNotFound(String),
}

impl ApplicationError {
    /// 调用方输入错误，不应重试
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ApplicationError::Domain(DomainError::ValidationError { .. })
                | ApplicationError::Domain(DomainError::UnsupportedKind { .. })
                | ApplicationError::Resource(ResourceError::InvalidName(_))
        )
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        ApplicationError::Repository(value)
    }
}
