//! 出站发送
//!
//! 所有发送共用一个限流器。限流只是礼貌性的延迟：等不到令牌就照常发送，
//! 不会因为限流丢消息。

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use data_encoding::BASE64_NOPAD;
use domain::{DomainError, IdentityKind, SendMessageCommand, StableId};

use crate::error::ApplicationError;
use crate::identity::IdentityDirectory;
use crate::platform::{ChatPlatform, MediaKind, PlatformError, PlatformGroup, SentMessage};
use crate::rate_limiter::{SendRateLimiter, Throttle};
use crate::resource::{self, ResourceFetcher, ResourceStore};

/// 内联内容
pub const BASE64_PREFIX: &str = "BASE64:";
/// 已上传到本地存储的资源
pub const RESOURCE_PREFIX: &str = "RESOURCE:";

const TEXT_WAIT: Duration = Duration::from_secs(3);
/// 媒体上传比文本贵得多
const MEDIA_COST: u32 = 5;
const MEDIA_WAIT: Duration = Duration::from_secs(20);

pub struct SenderDependencies {
    pub platform: Arc<dyn ChatPlatform>,
    pub directory: Arc<dyn IdentityDirectory>,
    pub resources: Arc<dyn ResourceStore>,
    pub fetcher: Arc<dyn ResourceFetcher>,
    pub limiter: Arc<SendRateLimiter>,
}

pub struct OutboundSender {
    platform: Arc<dyn ChatPlatform>,
    directory: Arc<dyn IdentityDirectory>,
    resources: Arc<dyn ResourceStore>,
    fetcher: Arc<dyn ResourceFetcher>,
    limiter: Arc<SendRateLimiter>,
}

impl OutboundSender {
    pub fn new(deps: SenderDependencies) -> Self {
        Self {
            platform: deps.platform,
            directory: deps.directory,
            resources: deps.resources,
            fetcher: deps.fetcher,
            limiter: deps.limiter,
        }
    }

    pub async fn send(&self, command: &SendMessageCommand) -> Result<SentMessage, ApplicationError> {
        command.validate()?;
        if !self.platform.is_alive() {
            return Err(PlatformError::Offline.into());
        }
        let group = self.find_group(&command.gid).await?;

        match MediaKind::from_send_kind(command.kind) {
            None => {
                self.throttle(1, TEXT_WAIT).await;
                let sent = self.platform.send_text(group.handle(), &command.body).await?;
                tracing::debug!(gid = %command.gid, msg_id = %sent.msg_id, "文本消息已发送");
                Ok(sent)
            }
            Some(kind) => self.send_media(&group, kind, command).await,
        }
    }

    /// 稳定群 ID -> 当前会话里的群
    ///
    /// 优先使用最近一次记录的句柄；句柄已经失效时遍历当前群列表重新解析。
    async fn find_group(&self, gid: &str) -> Result<PlatformGroup, ApplicationError> {
        let id = StableId::from(gid);
        let recorded = self
            .directory
            .lookup(&id)
            .await?
            .filter(|identity| identity.kind == IdentityKind::Group);
        if let Some(identity) = recorded {
            if let Some(group) = self.platform.find_group(&identity.platform_handle).await? {
                return Ok(group);
            }
        }

        for group in self.platform.groups().await? {
            match self.directory.resolve(&group.identity).await {
                Ok(resolved) if resolved == id => return Ok(group),
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(handle = %group.handle(), error = %err, "解析群身份失败");
                }
            }
        }
        Err(ApplicationError::GroupNotFound(gid.to_owned()))
    }

    async fn throttle(&self, cost: u32, max_wait: Duration) {
        if self.limiter.wait_n(cost, max_wait).await == Throttle::TimedOut {
            tracing::debug!(cost, "限流等待超时，继续发送");
        }
    }

    /// 先发提示语，上传结束后（无论成败）撤回
    async fn send_media(
        &self,
        group: &PlatformGroup,
        kind: MediaKind,
        command: &SendMessageCommand,
    ) -> Result<SentMessage, ApplicationError> {
        let prompt = match command.prompt() {
            Some(prompt) => self.send_prompt(group, prompt).await,
            None => None,
        };

        let result = self.upload(group, kind, command).await;

        if let Some(prompt) = prompt {
            if let Err(err) = self.platform.revoke(&prompt).await {
                tracing::warn!(msg_id = %prompt.msg_id, error = %err, "撤回提示语失败");
            }
        }
        result
    }

    async fn send_prompt(&self, group: &PlatformGroup, prompt: &str) -> Option<SentMessage> {
        self.throttle(1, TEXT_WAIT).await;
        match self.platform.send_text(group.handle(), prompt).await {
            Ok(sent) => Some(sent),
            Err(err) => {
                tracing::warn!(error = %err, "发送提示语失败");
                None
            }
        }
    }

    async fn upload(
        &self,
        group: &PlatformGroup,
        kind: MediaKind,
        command: &SendMessageCommand,
    ) -> Result<SentMessage, ApplicationError> {
        let (filename, content) = self.resolve_resource(kind, command).await?;
        self.throttle(MEDIA_COST, MEDIA_WAIT).await;
        let size = content.len();
        let sent = self
            .platform
            .send_media(group.handle(), kind, &filename, content)
            .await?;
        tracing::info!(gid = %command.gid, filename = %filename, size, "媒体消息已发送");
        Ok(sent)
    }

    /// 按 body 前缀选择资源来源，返回 (文件名, 内容)
    ///
    /// `BASE64:` 内联内容，`RESOURCE:` 已上传的资源，其他一律视为远程地址；
    /// 远程地址限定为 http/https，其余协议返回校验错误。
    async fn resolve_resource(
        &self,
        kind: MediaKind,
        command: &SendMessageCommand,
    ) -> Result<(String, Bytes), ApplicationError> {
        let body = command.body.trim();

        if let Some(encoded) = body.strip_prefix(BASE64_PREFIX) {
            let content = BASE64_NOPAD
                .decode(encoded.trim().trim_end_matches('=').as_bytes())
                .map_err(|err| DomainError::validation_error("body", format!("BASE64内容无效: {err}")))?;
            let filename = default_filename(kind, command, &content);
            resource::write_all(self.resources.as_ref(), &filename, &content).await?;
            return Ok((filename, Bytes::from(content)));
        }

        if let Some(path) = body.strip_prefix(RESOURCE_PREFIX) {
            let content = resource::read_all(self.resources.as_ref(), path).await?;
            let filename = match command.filename() {
                Some(name) => name.to_owned(),
                None => resource::sanitize_name(path)?.to_owned(),
            };
            return Ok((filename, Bytes::from(content)));
        }

        // 其余内容都当作远程地址，但只下载 http(s)；`file://` 之类的地址会读到本机文件，
        // 按不支持的资源格式拒绝
        if body.starts_with("http://") || body.starts_with("https://") {
            let content = self.fetcher.fetch(body).await?;
            let filename = default_filename(kind, command, &content);
            resource::write_all(self.resources.as_ref(), &filename, &content).await?;
            return Ok((filename, content));
        }

        Err(DomainError::validation_error("body", "不支持的资源格式").into())
    }
}

fn default_filename(kind: MediaKind, command: &SendMessageCommand, content: &[u8]) -> String {
    if let Some(name) = command.filename() {
        return name.to_owned();
    }
    let extension = match kind {
        MediaKind::Image => Some("jpg"),
        MediaKind::Video => Some("mp4"),
        MediaKind::File => None,
    };
    resource::hashed_name(content, extension)
}
