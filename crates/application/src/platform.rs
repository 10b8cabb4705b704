//! 聊天平台端口
//!
//! 平台 SDK（登录、会话同步、原始事件解码）不在本仓库内，这里只定义中枢消费的
//! 类型化事件和需要调用的发送原语。

use async_trait::async_trait;
use bytes::Bytes;
use domain::{RawIdentity, SendKind};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error("bot已掉线")]
    Offline,
    #[error("platform call failed: {0}")]
    Call(String),
}

impl PlatformError {
    pub fn call(message: impl Into<String>) -> Self {
        Self::Call(message.into())
    }
}

/// 平台上的一个群及其成员快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformGroup {
    pub identity: RawIdentity,
    pub members: Vec<RawIdentity>,
}

impl PlatformGroup {
    pub fn new(identity: RawIdentity, members: Vec<RawIdentity>) -> Self {
        Self { identity, members }
    }

    pub fn handle(&self) -> &str {
        &self.identity.platform_handle
    }

    /// 按群名片或昵称查找
    pub fn search_by_name(&self, name: &str) -> Option<&RawIdentity> {
        self.members
            .iter()
            .find(|member| member.display_name == name || member.nickname == name)
    }

    pub fn find_member(&self, handle: &str) -> Option<&RawIdentity> {
        self.members
            .iter()
            .find(|member| member.platform_handle == handle)
    }
}

/// 已发出的消息，用于撤回
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub msg_id: String,
    pub group_handle: String,
}

/// 出站媒体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    File,
}

impl MediaKind {
    pub fn from_send_kind(kind: SendKind) -> Option<Self> {
        match kind {
            SendKind::Text => None,
            SendKind::Image => Some(MediaKind::Image),
            SendKind::Video => Some(MediaKind::Video),
            SendKind::File => Some(MediaKind::File),
        }
    }
}

/// 入站附件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Picture,
    Emoticon,
    Video,
    Voice,
    File,
}

/// 事件公共上下文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    pub msg_id: String,
    pub msg_type: i32,
    /// unix 秒
    pub create_time: i64,
    /// 实际发送者；群消息时是群内成员
    pub sender: RawIdentity,
    /// 群消息时附带群和成员快照
    pub group: Option<PlatformGroup>,
    pub bot_handle: String,
    /// 是否 @ 了机器人
    pub at_bot: bool,
    pub from_self: bool,
    /// 平台内部通知（同步、状态变更等），不转发
    pub notify: bool,
}

impl EventContext {
    pub fn new(msg_id: impl Into<String>, msg_type: i32, create_time: i64, sender: RawIdentity) -> Self {
        Self {
            msg_id: msg_id.into(),
            msg_type,
            create_time,
            sender,
            group: None,
            bot_handle: String::new(),
            at_bot: false,
            from_self: false,
            notify: false,
        }
    }

    pub fn in_group(mut self, group: PlatformGroup) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_bot(mut self, bot_handle: impl Into<String>) -> Self {
        self.bot_handle = bot_handle.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    Text {
        ctx: EventContext,
        content: String,
    },
    Media {
        ctx: EventContext,
        kind: AttachmentKind,
        filename: Option<String>,
        content: Bytes,
    },
    Recalled {
        ctx: EventContext,
        old_msg_id: String,
        replace_msg: String,
    },
    System {
        ctx: EventContext,
        content: String,
    },
}

impl PlatformEvent {
    pub fn context(&self) -> &EventContext {
        match self {
            PlatformEvent::Text { ctx, .. }
            | PlatformEvent::Media { ctx, .. }
            | PlatformEvent::Recalled { ctx, .. }
            | PlatformEvent::System { ctx, .. } => ctx,
        }
    }
}

#[async_trait]
pub trait ChatPlatform: Send + Sync {
    fn is_alive(&self) -> bool;

    async fn groups(&self) -> Result<Vec<PlatformGroup>, PlatformError>;

    async fn find_group(&self, handle: &str) -> Result<Option<PlatformGroup>, PlatformError>;

    async fn send_text(&self, group_handle: &str, text: &str) -> Result<SentMessage, PlatformError>;

    async fn send_media(
        &self,
        group_handle: &str,
        kind: MediaKind,
        filename: &str,
        content: Bytes,
    ) -> Result<SentMessage, PlatformError>;

    async fn revoke(&self, sent: &SentMessage) -> Result<(), PlatformError>;

    async fn mark_read(&self, msg_id: &str) -> Result<(), PlatformError>;
}

/// 测试用的平台替身，记录所有调用
pub mod memory {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum PlatformCall {
        Text { group: String, text: String },
        Media { group: String, kind: MediaKind, filename: String, size: usize },
        Revoke { msg_id: String },
        MarkRead { msg_id: String },
    }

    pub struct MemoryPlatform {
        alive: AtomicBool,
        groups: Mutex<Vec<PlatformGroup>>,
        calls: Mutex<Vec<PlatformCall>>,
        counter: AtomicUsize,
    }

    impl Default for MemoryPlatform {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MemoryPlatform {
        pub fn new() -> Self {
            Self {
                alive: AtomicBool::new(true),
                groups: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
                counter: AtomicUsize::new(0),
            }
        }

        pub fn set_alive(&self, alive: bool) {
            self.alive.store(alive, Ordering::SeqCst);
        }

        pub fn set_groups(&self, groups: Vec<PlatformGroup>) {
            if let Ok(mut current) = self.groups.lock() {
                *current = groups;
            }
        }

        pub fn calls(&self) -> Vec<PlatformCall> {
            self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
        }

        fn record(&self, call: PlatformCall) {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(call);
            }
        }

        fn sent(&self, group_handle: &str) -> SentMessage {
            let id = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            SentMessage {
                msg_id: format!("sent-{id}"),
                group_handle: group_handle.to_owned(),
            }
        }
    }

    #[async_trait]
    impl ChatPlatform for MemoryPlatform {
        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn groups(&self) -> Result<Vec<PlatformGroup>, PlatformError> {
            Ok(self
                .groups
                .lock()
                .map(|groups| groups.clone())
                .unwrap_or_default())
        }

        async fn find_group(&self, handle: &str) -> Result<Option<PlatformGroup>, PlatformError> {
            Ok(self
                .groups()
                .await?
                .into_iter()
                .find(|group| group.handle() == handle))
        }

        async fn send_text(
            &self,
            group_handle: &str,
            text: &str,
        ) -> Result<SentMessage, PlatformError> {
            self.record(PlatformCall::Text {
                group: group_handle.to_owned(),
                text: text.to_owned(),
            });
            Ok(self.sent(group_handle))
        }

        async fn send_media(
            &self,
            group_handle: &str,
            kind: MediaKind,
            filename: &str,
            content: Bytes,
        ) -> Result<SentMessage, PlatformError> {
            self.record(PlatformCall::Media {
                group: group_handle.to_owned(),
                kind,
                filename: filename.to_owned(),
                size: content.len(),
            });
            Ok(self.sent(group_handle))
        }

        async fn revoke(&self, sent: &SentMessage) -> Result<(), PlatformError> {
            self.record(PlatformCall::Revoke {
                msg_id: sent.msg_id.clone(),
            });
            Ok(())
        }

        async fn mark_read(&self, msg_id: &str) -> Result<(), PlatformError> {
            self.record(PlatformCall::MarkRead {
                msg_id: msg_id.to_owned(),
            });
            Ok(())
        }
    }
}
