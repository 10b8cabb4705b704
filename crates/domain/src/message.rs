//! 标准化消息定义
//!
//! 所有下游转发器收到的都是同一种 JSON 结构：公共信封字段加上各变体的负载。

use serde::{Deserialize, Serialize};

use crate::identity::StableId;

/// 平台原始消息类型
pub mod msg_type {
    pub const TEXT: i32 = 1;
    pub const IMAGE: i32 = 3;
    pub const VOICE: i32 = 34;
    pub const VIDEO: i32 = 43;
    pub const EMOTICON: i32 = 47;
    pub const APP: i32 = 49;
    pub const SYSTEM: i32 = 10000;
    pub const RECALLED: i32 = 10002;
}

/// 公共信封
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "msgType")]
    pub msg_type: i32,
    /// unix 秒
    pub time: i64,
    /// 为空表示无需去重和持久化的临时通知
    #[serde(rename = "msgID", default)]
    pub msg_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<StableId>,
    #[serde(rename = "groupName", default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<StableId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl Envelope {
    pub fn new(msg_type: i32, time: i64, msg_id: impl Into<String>) -> Self {
        Self {
            msg_type,
            time,
            msg_id: msg_id.into(),
            ..Self::default()
        }
    }

    pub fn with_group(mut self, gid: StableId, group_name: impl Into<String>) -> Self {
        self.gid = Some(gid);
        self.group_name = Some(group_name.into());
        self
    }

    pub fn with_sender(mut self, uid: StableId, username: impl Into<String>) -> Self {
        self.uid = Some(uid);
        self.username = Some(username.into());
        self
    }
}

/// 被引用的消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    #[serde(default)]
    pub uid: Option<StableId>,
    pub name: String,
    pub bot: bool,
    pub content: String,
}

/// @提及；offset/length 以字符计，找不到时 offset 为 -1
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mention {
    #[serde(default)]
    pub uid: Option<StableId>,
    pub name: String,
    pub bot: bool,
    pub offset: i32,
    pub length: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextBody {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<Quote>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<Mention>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revoke {
    #[serde(rename = "oldMsgID")]
    pub old_msg_id: String,
    #[serde(rename = "replaceMsg")]
    pub replace_msg: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeBody {
    pub revoke: Revoke,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    pub filename: String,
    /// 资源存储中的相对路径
    pub src: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaBody {
    pub media: Media,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRef {
    pub uid: StableId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRenamed {
    #[serde(default)]
    pub uid: Option<StableId>,
    pub name: String,
    #[serde(rename = "groupName")]
    pub group_name: String,
}

/// 系统事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SystemEvent {
    RenameGroup(GroupRenamed),
    ExitGroup(Vec<MemberRef>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    Text(TextBody),
    Revoke(RevokeBody),
    Media(MediaBody),
    System(SystemEvent),
}

/// 标准化消息：信封 + 变体负载
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    #[serde(flatten)]
    pub envelope: Envelope,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl NormalizedMessage {
    pub fn text(envelope: Envelope, body: TextBody) -> Self {
        Self {
            envelope,
            body: MessageBody::Text(body),
        }
    }

    pub fn revoke(envelope: Envelope, revoke: Revoke) -> Self {
        Self {
            envelope,
            body: MessageBody::Revoke(RevokeBody { revoke }),
        }
    }

    pub fn media(envelope: Envelope, media: Media) -> Self {
        Self {
            envelope,
            body: MessageBody::Media(MediaBody { media }),
        }
    }

    pub fn system(envelope: Envelope, event: SystemEvent) -> Self {
        Self {
            envelope,
            body: MessageBody::System(event),
        }
    }

    pub fn msg_id(&self) -> &str {
        &self.envelope.msg_id
    }

    /// 临时通知不参与去重和持久化
    pub fn is_ephemeral(&self) -> bool {
        self.envelope.msg_id.is_empty()
    }

    /// 消息日志中保存的内容摘要
    pub fn summary(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.body)
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
