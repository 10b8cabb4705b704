//! 本地文件资源存储
//!
//! 文件写在 `<root>/YYYY/MM/DD/name`，对外只暴露相对路径。

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use application::resource::{
    dated_path, sanitize_name, validate_path, ResourceError, ResourceReader, ResourceStore,
    ResourceWriter,
};
use async_trait::async_trait;
use chrono::Local;
use tokio::fs;

#[derive(Debug, Clone)]
pub struct LocalResourceStore {
    root: PathBuf,
}

impl LocalResourceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ResourceStore for LocalResourceStore {
    async fn writer(&self, name: &str) -> Result<(ResourceWriter, String), ResourceError> {
        let relative = dated_path(sanitize_name(name)?, Local::now());
        let full = self.root.join(&relative);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::File::create(&full).await?;
        tracing::debug!(path = %relative, "写入资源文件");
        Ok((Box::new(file), relative))
    }

    async fn reader(&self, path: &str) -> Result<ResourceReader, ResourceError> {
        validate_path(path)?;
        match fs::File::open(self.root.join(path)).await {
            Ok(file) => Ok(Box::new(file)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(ResourceError::NotFound(path.to_owned()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use application::resource::{read_all, write_all};

    #[tokio::test]
    async fn files_land_in_dated_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalResourceStore::new(dir.path());

        let path = write_all(&store, "../escape/photo.jpg", b"jpeg").await.unwrap();
        assert!(path.ends_with("/photo.jpg"));
        assert_eq!(path.split('/').count(), 4);
        assert!(dir.path().join(&path).is_file());

        assert_eq!(read_all(&store, &path).await.unwrap(), b"jpeg");
    }

    #[tokio::test]
    async fn missing_and_escaping_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalResourceStore::new(dir.path());

        assert!(matches!(
            read_all(&store, "2024/01/01/none.bin").await,
            Err(ResourceError::NotFound(_))
        ));
        assert!(matches!(
            read_all(&store, "../secret").await,
            Err(ResourceError::InvalidName(_))
        ));
    }
}
