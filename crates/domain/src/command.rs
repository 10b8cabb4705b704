//! 控制指令
//!
//! 转发器收到的入站负载或 HTTP 请求都会被解析成封闭的 [`Command`] 枚举，
//! 新增指令类型时编译器会检查所有匹配分支。

use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "param", rename_all = "camelCase")]
pub enum Command {
    SendMessage(SendMessageCommand),
}

impl Command {
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// 发送消息类型：1 文本，2 图片，3 视频，4 文件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SendKind {
    Text,
    Image,
    Video,
    File,
}

impl SendKind {
    pub fn is_media(self) -> bool {
        !matches!(self, SendKind::Text)
    }
}

impl TryFrom<u8> for SendKind {
    type Error = DomainError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SendKind::Text),
            2 => Ok(SendKind::Image),
            3 => Ok(SendKind::Video),
            4 => Ok(SendKind::File),
            other => Err(DomainError::UnsupportedKind { kind: other }),
        }
    }
}

impl From<SendKind> for u8 {
    fn from(value: SendKind) -> Self {
        match value {
            SendKind::Text => 1,
            SendKind::Image => 2,
            SendKind::Video => 3,
            SendKind::File => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageCommand {
    /// 目标群的稳定 ID
    pub gid: String,
    #[serde(rename = "type")]
    pub kind: SendKind,
    /// 文本内容，或带 `BASE64:` / `RESOURCE:` 前缀的资源，或 URL
    pub body: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
}

impl SendMessageCommand {
    pub fn text(gid: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            gid: gid.into(),
            kind: SendKind::Text,
            body: body.into(),
            filename: None,
            prompt: None,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.gid.trim().is_empty() {
            return Err(DomainError::validation_error("gid", "群ID不能为空"));
        }
        if self.body.trim().is_empty() {
            return Err(DomainError::validation_error("body", "消息不能为空"));
        }
        Ok(())
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref().filter(|name| !name.is_empty())
    }

    pub fn prompt(&self) -> Option<&str> {
        self.prompt.as_deref().filter(|prompt| !prompt.is_empty())
    }
}
