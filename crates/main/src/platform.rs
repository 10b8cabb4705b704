//! 平台会话占位
//!
//! 平台 SDK 的登录和会话同步不在本仓库内。接入前中枢以离线状态运行：
//! 健康检查报告 DOWN，发送返回离线错误，转发器和控制面照常工作。

use application::platform::MediaKind;
use application::{ChatPlatform, PlatformError, PlatformGroup, SentMessage};
use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, Default)]
pub struct DetachedPlatform;

#[async_trait]
impl ChatPlatform for DetachedPlatform {
    fn is_alive(&self) -> bool {
        false
    }

    async fn groups(&self) -> Result<Vec<PlatformGroup>, PlatformError> {
        Ok(Vec::new())
    }

    async fn find_group(&self, _handle: &str) -> Result<Option<PlatformGroup>, PlatformError> {
        Ok(None)
    }

    async fn send_text(&self, _group_handle: &str, _text: &str) -> Result<SentMessage, PlatformError> {
        Err(PlatformError::Offline)
    }

    async fn send_media(
        &self,
        _group_handle: &str,
        _kind: MediaKind,
        _filename: &str,
        _content: Bytes,
    ) -> Result<SentMessage, PlatformError> {
        Err(PlatformError::Offline)
    }

    async fn revoke(&self, _sent: &SentMessage) -> Result<(), PlatformError> {
        Err(PlatformError::Offline)
    }

    async fn mark_read(&self, _msg_id: &str) -> Result<(), PlatformError> {
        Err(PlatformError::Offline)
    }
}
