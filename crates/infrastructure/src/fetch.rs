use std::time::Duration;

use application::resource::{ResourceError, ResourceFetcher};
use async_trait::async_trait;
use bytes::Bytes;

const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// 通过 HTTP 下载远程资源
#[derive(Clone)]
pub struct HttpResourceFetcher {
    client: reqwest::Client,
}

impl HttpResourceFetcher {
    pub fn new() -> Result<Self, ResourceError> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|err| ResourceError::Fetch(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ResourceFetcher for HttpResourceFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, ResourceError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| ResourceError::Fetch(err.to_string()))?;
        let content = response
            .bytes()
            .await
            .map_err(|err| ResourceError::Fetch(err.to_string()))?;
        tracing::debug!(url, size = content.len(), "远程资源已下载");
        Ok(content)
    }
}
