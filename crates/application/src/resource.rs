//! 资源存储端口
//!
//! 写入时按日期分目录（`YYYY/MM/DD/name`），读取时使用写入返回的相对路径。

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Local};
use data_encoding::HEXLOWER;
use ring::digest;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("invalid resource name: {0}")]
    InvalidName(String),
    #[error("resource io error: {0}")]
    Io(String),
    #[error("resource fetch failed: {0}")]
    Fetch(String),
}

impl From<std::io::Error> for ResourceError {
    fn from(value: std::io::Error) -> Self {
        ResourceError::Io(value.to_string())
    }
}

pub type ResourceWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type ResourceReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// 打开写入句柄，同时返回存储后的相对路径；关闭（shutdown）句柄后内容才算写完
    async fn writer(&self, name: &str) -> Result<(ResourceWriter, String), ResourceError>;

    /// 按相对路径读取，不存在时返回 [`ResourceError::NotFound`]
    async fn reader(&self, path: &str) -> Result<ResourceReader, ResourceError>;
}

/// 远程资源下载
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, ResourceError>;
}

/// 只保留文件名部分，拒绝 `.`、`..` 和空名字
pub fn sanitize_name(name: &str) -> Result<&str, ResourceError> {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() || base == "." || base == ".." {
        return Err(ResourceError::InvalidName(name.to_owned()));
    }
    Ok(base)
}

/// 读取路径必须是相对路径且不能跳出根目录
pub fn validate_path(path: &str) -> Result<(), ResourceError> {
    let invalid = path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if invalid {
        return Err(ResourceError::InvalidName(path.to_owned()));
    }
    Ok(())
}

pub fn dated_path(name: &str, now: DateTime<Local>) -> String {
    format!("{}/{}", now.format("%Y/%m/%d"), name)
}

/// 没有文件名时按内容生成：sha256 前 32 位十六进制加扩展名
pub fn hashed_name(content: &[u8], extension: Option<&str>) -> String {
    let digest = digest::digest(&digest::SHA256, content);
    let mut name = HEXLOWER.encode(digest.as_ref());
    name.truncate(32);
    if let Some(extension) = extension {
        name.push('.');
        name.push_str(extension);
    }
    name
}

pub async fn write_all(
    store: &dyn ResourceStore,
    name: &str,
    content: &[u8],
) -> Result<String, ResourceError> {
    let (mut writer, path) = store.writer(name).await?;
    writer.write_all(content).await?;
    writer.shutdown().await?;
    Ok(path)
}

pub async fn read_all(store: &dyn ResourceStore, path: &str) -> Result<Vec<u8>, ResourceError> {
    let mut reader = store.reader(path).await?;
    let mut content = Vec::new();
    reader.read_to_end(&mut content).await?;
    Ok(content)
}

pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::io;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};

    type Files = Arc<Mutex<HashMap<String, Bytes>>>;

    #[derive(Default)]
    pub struct MemoryResourceStore {
        files: Files,
    }

    impl MemoryResourceStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn paths(&self) -> Vec<String> {
            self.files
                .lock()
                .map(|files| files.keys().cloned().collect())
                .unwrap_or_default()
        }
    }

    struct MemoryWriter {
        path: String,
        buffer: Option<Vec<u8>>,
        files: Files,
    }

    impl AsyncWrite for MemoryWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            match self.get_mut().buffer.as_mut() {
                Some(buffer) => {
                    buffer.extend_from_slice(buf);
                    Poll::Ready(Ok(buf.len()))
                }
                None => Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "writer already closed",
                ))),
            }
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            if let Some(buffer) = this.buffer.take() {
                if let Ok(mut files) = this.files.lock() {
                    files.insert(this.path.clone(), Bytes::from(buffer));
                }
            }
            Poll::Ready(Ok(()))
        }
    }

    #[async_trait]
    impl ResourceStore for MemoryResourceStore {
        async fn writer(&self, name: &str) -> Result<(ResourceWriter, String), ResourceError> {
            let path = dated_path(sanitize_name(name)?, Local::now());
            let writer = MemoryWriter {
                path: path.clone(),
                buffer: Some(Vec::new()),
                files: self.files.clone(),
            };
            Ok((Box::new(writer), path))
        }

        async fn reader(&self, path: &str) -> Result<ResourceReader, ResourceError> {
            validate_path(path)?;
            let content = self
                .files
                .lock()
                .ok()
                .and_then(|files| files.get(path).cloned())
                .ok_or_else(|| ResourceError::NotFound(path.to_owned()))?;
            Ok(Box::new(io::Cursor::new(content)))
        }
    }
}
