//! 平台事件 -> 标准化消息
//!
//! 身份解析失败会让整条消息失败（由中枢记录并丢弃）；引用和 @ 的结构化字段只是尽力而为，
//! 解析不到就省略，不影响消息本身。

use std::sync::Arc;

use bytes::Bytes;
use domain::text_rules::{self, MentionTarget};
use domain::{
    Envelope, GroupRenamed, Media, Mention, NormalizedMessage, Quote, RawIdentity, Revoke,
    StableId, SystemEvent, TextBody,
};

use crate::error::ApplicationError;
use crate::identity::IdentityDirectory;
use crate::platform::{AttachmentKind, EventContext, PlatformEvent, PlatformGroup};
use crate::resource::{self, ResourceStore};

/// 标准化结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub message: NormalizedMessage,
    /// 群成员或群信息可能发生了变化，需要触发一次对账
    pub roster_changed: bool,
}

impl Normalized {
    fn plain(message: NormalizedMessage) -> Self {
        Self {
            message,
            roster_changed: false,
        }
    }
}

pub struct Normalizer {
    directory: Arc<dyn IdentityDirectory>,
    resources: Arc<dyn ResourceStore>,
}

impl Normalizer {
    pub fn new(directory: Arc<dyn IdentityDirectory>, resources: Arc<dyn ResourceStore>) -> Self {
        Self {
            directory,
            resources,
        }
    }

    /// 不需要转发的系统消息返回 `None`
    pub async fn normalize(
        &self,
        event: &PlatformEvent,
    ) -> Result<Option<Normalized>, ApplicationError> {
        let ctx = event.context();
        let envelope = self.envelope(ctx).await?;

        let normalized = match event {
            PlatformEvent::Text { content, .. } => Normalized::plain(NormalizedMessage::text(
                envelope,
                self.text_body(ctx, content).await,
            )),
            PlatformEvent::Media {
                kind,
                filename,
                content,
                ..
            } => {
                let media = self.store_media(*kind, filename.as_deref(), content).await?;
                Normalized::plain(NormalizedMessage::media(envelope, media))
            }
            PlatformEvent::Recalled {
                old_msg_id,
                replace_msg,
                ..
            } => Normalized::plain(NormalizedMessage::revoke(
                envelope,
                Revoke {
                    old_msg_id: old_msg_id.clone(),
                    replace_msg: replace_msg.clone(),
                },
            )),
            PlatformEvent::System { content, .. } => {
                let Some(system) = self.system_event(ctx, content).await else {
                    return Ok(None);
                };
                Normalized {
                    message: NormalizedMessage::system(envelope, system),
                    roster_changed: true,
                }
            }
        };
        Ok(Some(normalized))
    }

    async fn envelope(&self, ctx: &EventContext) -> Result<Envelope, ApplicationError> {
        let envelope = Envelope::new(ctx.msg_type, ctx.create_time, ctx.msg_id.clone());
        let uid = self.directory.resolve(&ctx.sender).await?;
        match &ctx.group {
            Some(group) => {
                let gid = self.directory.resolve(&group.identity).await?;
                Ok(envelope
                    .with_group(gid, group.identity.nickname.clone())
                    .with_sender(uid, ctx.sender.name()))
            }
            None => Ok(envelope.with_sender(uid, ctx.sender.nickname.clone())),
        }
    }

    async fn resolve_quietly(&self, raw: &RawIdentity) -> Option<StableId> {
        match self.directory.resolve(raw).await {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::warn!(handle = %raw.platform_handle, error = %err, "解析身份失败，省略该字段");
                None
            }
        }
    }

    /// 引用和 @ 只在群消息里解析
    async fn text_body(&self, ctx: &EventContext, content: &str) -> TextBody {
        let content = content.trim();
        let Some(group) = &ctx.group else {
            return TextBody {
                content: content.to_owned(),
                quote: None,
                at: None,
            };
        };

        let mut body = content;
        let mut quote = None;
        if let Some(quoted) = text_rules::extract_quote(content) {
            body = quoted.body;
            quote = self.quote(ctx, group, &quoted).await;
        }

        // 找到被 @ 的成员才去掉分隔符
        let Some((name, member)) = self.mention_target(ctx, group, body) else {
            return TextBody {
                content: body.to_owned(),
                quote,
                at: None,
            };
        };
        let content = text_rules::strip_mention_marker(body);
        let (offset, length) = text_rules::mention_span(&content, &name);
        let at = self.resolve_quietly(member).await.map(|uid| Mention {
            uid: Some(uid),
            bot: is_bot(ctx, member),
            name,
            offset,
            length,
        });

        TextBody { content, quote, at }
    }

    /// 作者不在群里或解析不到身份时不带引用
    async fn quote(
        &self,
        ctx: &EventContext,
        group: &PlatformGroup,
        quoted: &text_rules::QuotedText<'_>,
    ) -> Option<Quote> {
        let (name, text, member) = quoted.split_author(|name| group.search_by_name(name))?;
        let uid = self.resolve_quietly(member).await?;
        Some(Quote {
            uid: Some(uid),
            bot: is_bot(ctx, member),
            name,
            content: text.to_owned(),
        })
    }

    /// 返回文本里实际 @ 的名字和对应成员；@ 机器人时用机器人的群名片
    fn mention_target<'g>(
        &self,
        ctx: &EventContext,
        group: &'g PlatformGroup,
        raw: &str,
    ) -> Option<(String, &'g RawIdentity)> {
        let (name, member) = if ctx.at_bot {
            let member = group.find_member(&ctx.bot_handle)?;
            (member.name().to_owned(), member)
        } else {
            match text_rules::locate_mention(raw)? {
                MentionTarget::Marked(name) => (name.to_owned(), group.search_by_name(name)?),
                MentionTarget::Unmarked(rest) => {
                    text_rules::match_name_prefix(rest, " ", |name| group.search_by_name(name))?
                }
            }
        };
        (!name.is_empty()).then_some((name, member))
    }

    async fn store_media(
        &self,
        kind: AttachmentKind,
        filename: Option<&str>,
        content: &Bytes,
    ) -> Result<Media, ApplicationError> {
        let filename = match filename.filter(|name| !name.is_empty()) {
            Some(name) => name.to_owned(),
            None => resource::hashed_name(content, attachment_extension(kind, content)),
        };
        let src = resource::write_all(self.resources.as_ref(), &filename, content).await?;
        Ok(Media {
            filename,
            src,
            size: content.len() as u64,
        })
    }

    async fn system_event(&self, ctx: &EventContext, content: &str) -> Option<SystemEvent> {
        let (operator, group_name) = text_rules::parse_rename_group(content)?;
        let member = ctx
            .group
            .as_ref()
            .and_then(|group| group.search_by_name(operator));
        let uid = match member {
            Some(member) => self.resolve_quietly(member).await,
            None => None,
        };
        Some(SystemEvent::RenameGroup(GroupRenamed {
            uid,
            name: operator.to_owned(),
            group_name: group_name.to_owned(),
        }))
    }
}

fn is_bot(ctx: &EventContext, member: &RawIdentity) -> bool {
    !ctx.bot_handle.is_empty() && member.platform_handle == ctx.bot_handle
}

fn attachment_extension(kind: AttachmentKind, content: &[u8]) -> Option<&'static str> {
    match kind {
        AttachmentKind::Video => Some("mp4"),
        AttachmentKind::Voice => Some("mp3"),
        AttachmentKind::Picture | AttachmentKind::Emoticon => Some(sniff_image(content)),
        AttachmentKind::File => None,
    }
}

fn sniff_image(content: &[u8]) -> &'static str {
    if content.starts_with(b"\x89PNG") {
        "png"
    } else if content.starts_with(b"GIF8") {
        "gif"
    } else if content.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "jpeg"
    } else if content.len() >= 12 && &content[..4] == b"RIFF" && &content[8..12] == b"WEBP" {
        "webp"
    } else if content.starts_with(b"BM") {
        "bmp"
    } else {
        "jpg"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KvIdentityResolver;
    use crate::kv::memory::MemoryKvStore;
    use crate::resource::memory::MemoryResourceStore;
    use domain::{msg_type, MessageBody};
    use std::time::Duration;

    fn normalizer() -> (Normalizer, Arc<KvIdentityResolver>, Arc<MemoryResourceStore>) {
        let directory = Arc::new(KvIdentityResolver::new(
            Arc::new(MemoryKvStore::new()),
            Duration::from_secs(60),
        ));
        let resources = Arc::new(MemoryResourceStore::new());
        (
            Normalizer::new(directory.clone(), resources.clone()),
            directory,
            resources,
        )
    }

    fn group() -> PlatformGroup {
        PlatformGroup::new(
            RawIdentity::group("@@g1", "team"),
            vec![
                RawIdentity::user("@alice", "alice"),
                RawIdentity::user("@bob", "bob"),
                RawIdentity::user("@bot", "helper").with_display_name("Bot Helper"),
                RawIdentity::user("@ann", "Ann"),
                RawIdentity::user("@annlee", "Ann Lee"),
                RawIdentity::user("@carol", "carol").with_display_name("Carrie"),
            ],
        )
    }

    fn text_event(content: &str) -> PlatformEvent {
        PlatformEvent::Text {
            ctx: EventContext::new("m1", msg_type::TEXT, 1_700_000_000, RawIdentity::user("@alice", "alice"))
                .in_group(group())
                .with_bot("@bot"),
            content: content.into(),
        }
    }

    async fn text_of(normalizer: &Normalizer, event: PlatformEvent) -> TextBody {
        let normalized = normalizer.normalize(&event).await.unwrap().unwrap();
        match normalized.message.body {
            MessageBody::Text(body) => body,
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[tokio::test]
    async fn envelope_carries_stable_group_and_sender() {
        let (normalizer, directory, _) = normalizer();
        let normalized = normalizer.normalize(&text_event("hi")).await.unwrap().unwrap();
        let envelope = normalized.message.envelope;

        assert_eq!(envelope.msg_id, "m1");
        assert_eq!(envelope.group_name.as_deref(), Some("team"));
        assert_eq!(envelope.username.as_deref(), Some("alice"));
        assert_eq!(
            envelope.gid,
            Some(directory.resolve(&RawIdentity::group("@@g1", "team")).await.unwrap())
        );
        assert!(!normalized.roster_changed);
    }

    #[tokio::test]
    async fn quote_author_is_split_from_quoted_text() {
        let (normalizer, directory, _) = normalizer();
        let body = text_of(
            &normalizer,
            text_event("「bob：earlier words」\n- - - - - - - - - - - - - - -\nhello"),
        )
        .await;

        assert_eq!(body.content, "hello");
        let quote = body.quote.unwrap();
        assert_eq!(quote.name, "bob");
        assert_eq!(quote.content, "earlier words");
        assert_eq!(
            quote.uid,
            Some(directory.resolve(&RawIdentity::user("@bob", "bob")).await.unwrap())
        );
    }

    #[tokio::test]
    async fn unrecognized_quote_leaves_text_unchanged() {
        let (normalizer, _, _) = normalizer();
        let body = text_of(&normalizer, text_event("「not a quote")).await;
        assert_eq!(body.content, "「not a quote");
        assert!(body.quote.is_none());
    }

    #[tokio::test]
    async fn marked_mention_is_resolved() {
        let (normalizer, _, _) = normalizer();
        let body = text_of(&normalizer, text_event("hey @bob\u{2005}look")).await;
        assert_eq!(body.content, "hey @boblook");
        let at = body.at.unwrap();
        assert_eq!(at.name, "bob");
        assert_eq!((at.offset, at.length), (4, 4));
        assert!(!at.bot);
    }

    #[tokio::test]
    async fn unmarked_mention_prefers_the_longest_name() {
        let (normalizer, _, _) = normalizer();
        let body = text_of(&normalizer, text_event("@Ann Lee are you there")).await;
        let at = body.at.unwrap();
        assert_eq!(at.name, "Ann Lee");
        assert_eq!((at.offset, at.length), (0, 9));
    }

    #[tokio::test]
    async fn mention_of_the_bot_uses_its_display_name() {
        let (normalizer, _, _) = normalizer();
        let mut event = text_event("@Bot Helper\u{2005}ping");
        if let PlatformEvent::Text { ctx, .. } = &mut event {
            ctx.at_bot = true;
        }
        let at = text_of(&normalizer, event).await.at.unwrap();
        assert!(at.bot);
        assert_eq!(at.name, "Bot Helper");
    }

    #[tokio::test]
    async fn mention_by_nickname_keeps_the_written_name() {
        let (normalizer, directory, _) = normalizer();
        let body = text_of(&normalizer, text_event("hey @carol\u{2005}look")).await;
        assert_eq!(body.content, "hey @carollook");
        let at = body.at.unwrap();
        assert_eq!(at.name, "carol");
        assert_eq!((at.offset, at.length), (4, 6));
        assert_eq!(
            at.uid,
            Some(
                directory
                    .resolve(&RawIdentity::user("@carol", "carol").with_display_name("Carrie"))
                    .await
                    .unwrap()
            )
        );
    }

    #[tokio::test]
    async fn marker_without_member_keeps_the_text() {
        let (normalizer, _, _) = normalizer();
        let body = text_of(&normalizer, text_event("hi @nobody\u{2005}there")).await;
        assert!(body.at.is_none());
        assert_eq!(body.content, "hi @nobody\u{2005}there");
    }

    #[tokio::test]
    async fn quote_from_unknown_author_is_dropped() {
        let (normalizer, _, _) = normalizer();
        let body = text_of(
            &normalizer,
            text_event("「zed：old words」\n- - - - - - - - - - - - - - -\nhello"),
        )
        .await;
        assert_eq!(body.content, "hello");
        assert!(body.quote.is_none());
    }

    #[tokio::test]
    async fn direct_messages_are_not_parsed() {
        let (normalizer, _, _) = normalizer();
        let event = PlatformEvent::Text {
            ctx: EventContext::new("m5", msg_type::TEXT, 0, RawIdentity::user("@alice", "alice")),
            content: "hi @bob\u{2005}there".into(),
        };
        let body = text_of(&normalizer, event).await;
        assert!(body.at.is_none());
        assert_eq!(body.content, "hi @bob\u{2005}there");
    }

    #[tokio::test]
    async fn unknown_mention_is_omitted() {
        let (normalizer, _, _) = normalizer();
        let body = text_of(&normalizer, text_event("mail me @ home")).await;
        assert!(body.at.is_none());
        assert_eq!(body.content, "mail me @ home");
    }

    #[tokio::test]
    async fn media_without_name_gets_a_hashed_name() {
        let (normalizer, _, resources) = normalizer();
        let event = PlatformEvent::Media {
            ctx: EventContext::new("m2", msg_type::IMAGE, 0, RawIdentity::user("@alice", "alice")),
            kind: AttachmentKind::Picture,
            filename: None,
            content: Bytes::from_static(b"\x89PNG\r\n\x1a\nrest"),
        };
        let normalized = normalizer.normalize(&event).await.unwrap().unwrap();
        let MessageBody::Media(body) = normalized.message.body else {
            panic!("expected media");
        };
        assert!(body.media.filename.ends_with(".png"));
        assert_eq!(body.media.size, 12);
        assert_eq!(resources.paths(), vec![body.media.src]);
    }

    #[tokio::test]
    async fn rename_notice_becomes_a_system_event() {
        let (normalizer, directory, _) = normalizer();
        let event = PlatformEvent::System {
            ctx: EventContext::new("m3", msg_type::SYSTEM, 0, RawIdentity::group("@@g1", "team"))
                .in_group(group()),
            content: "\"alice\"修改群名为“new team”".into(),
        };
        let normalized = normalizer.normalize(&event).await.unwrap().unwrap();
        assert!(normalized.roster_changed);
        assert_eq!(
            normalized.message.body,
            MessageBody::System(SystemEvent::RenameGroup(GroupRenamed {
                uid: Some(directory.resolve(&RawIdentity::user("@alice", "alice")).await.unwrap()),
                name: "alice".into(),
                group_name: "new team".into(),
            }))
        );
    }

    #[tokio::test]
    async fn other_system_notices_are_dropped() {
        let (normalizer, _, _) = normalizer();
        let event = PlatformEvent::System {
            ctx: EventContext::new("m4", msg_type::SYSTEM, 0, RawIdentity::group("@@g1", "team")),
            content: "alice joined".into(),
        };
        assert!(normalizer.normalize(&event).await.unwrap().is_none());
    }
}
