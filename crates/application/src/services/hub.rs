//! 消息中枢：去重 -> 标准化 -> 并发分发
//!
//! 每个转发器在独立任务里投递，一个转发器出错或 panic 不影响其他转发器；
//! 分发本身从不失败，所有错误只记日志。

use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use domain::{msg_type, Envelope, MemberRef, NormalizedMessage, SystemEvent};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::dedup::{Admission, DedupGate};
use crate::error::ApplicationError;
use crate::identity::IdentityDirectory;
use crate::platform::{ChatPlatform, PlatformEvent};
use crate::rate_limiter::SendRateLimiter;
use crate::redirect::{RedirectError, Redirector};
use crate::repository::MessageLog;
use crate::resource::ResourceStore;

use super::normalize::Normalizer;
use super::roster::RosterReconciler;

/// 已读回执的最小间隔
const READ_RECEIPT_INTERVAL: Duration = Duration::from_secs(10);

pub struct HubDependencies {
    pub directory: Arc<dyn IdentityDirectory>,
    pub roster: Arc<RosterReconciler>,
    pub dedup: Arc<DedupGate>,
    pub message_log: Arc<dyn MessageLog>,
    pub resources: Arc<dyn ResourceStore>,
    pub platform: Arc<dyn ChatPlatform>,
    pub clock: Arc<dyn Clock>,
}

/// 一次分发的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    /// 投递失败（出错或 panic）的转发器名字
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// 平台通知、自己发出的消息或无需转发的系统消息
    Ignored,
    Duplicate,
    Dispatched(DispatchReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// 上一轮对账还没结束
    Skipped,
    Completed { groups: usize, departures: usize },
}

struct HubInner {
    normalizer: Normalizer,
    directory: Arc<dyn IdentityDirectory>,
    roster: Arc<RosterReconciler>,
    dedup: Arc<DedupGate>,
    message_log: Arc<dyn MessageLog>,
    platform: Arc<dyn ChatPlatform>,
    clock: Arc<dyn Clock>,
    redirectors: RwLock<Vec<Arc<dyn Redirector>>>,
    receipts: SendRateLimiter,
    member_watch: Mutex<()>,
}

#[derive(Clone)]
pub struct MessageHub {
    inner: Arc<HubInner>,
}

impl MessageHub {
    pub fn new(deps: HubDependencies) -> Self {
        let normalizer = Normalizer::new(deps.directory.clone(), deps.resources);
        Self {
            inner: Arc::new(HubInner {
                normalizer,
                directory: deps.directory,
                roster: deps.roster,
                dedup: deps.dedup,
                message_log: deps.message_log,
                platform: deps.platform,
                clock: deps.clock,
                redirectors: RwLock::new(Vec::new()),
                receipts: SendRateLimiter::every(READ_RECEIPT_INTERVAL, 1),
                member_watch: Mutex::new(()),
            }),
        }
    }

    /// 启动阶段注册转发器，按注册顺序分发
    pub fn register(&self, redirector: Arc<dyn Redirector>) {
        tracing::info!(redirector = redirector.name(), "注册转发器");
        if let Ok(mut redirectors) = self.inner.redirectors.write() {
            redirectors.push(redirector);
        }
    }

    pub fn redirectors(&self) -> Vec<Arc<dyn Redirector>> {
        self.inner
            .redirectors
            .read()
            .map(|redirectors| redirectors.clone())
            .unwrap_or_default()
    }

    /// 处理一个平台事件
    ///
    /// 同一个 msg_id 只会分发一次，重复投递返回 [`HandleOutcome::Duplicate`]。
    /// 去重存储或身份解析失败时返回错误，这条消息不再处理。
    pub async fn handle(&self, event: PlatformEvent) -> Result<HandleOutcome, ApplicationError> {
        let ctx = event.context();
        if ctx.notify || ctx.from_self {
            return Ok(HandleOutcome::Ignored);
        }

        if self.inner.dedup.admit(&ctx.msg_id).await? == Admission::Duplicate {
            tracing::debug!(msg_id = %ctx.msg_id, "重复消息，跳过");
            return Ok(HandleOutcome::Duplicate);
        }

        let Some(normalized) = self.inner.normalizer.normalize(&event).await? else {
            return Ok(HandleOutcome::Ignored);
        };
        let report = self.dispatch(&normalized.message).await;

        if normalized.roster_changed {
            let hub = self.clone();
            tokio::spawn(async move {
                if let Err(err) = hub.watch_members().await {
                    tracing::warn!(error = %err, "群成员对账失败");
                }
            });
        }

        if !ctx.msg_id.is_empty() && self.inner.receipts.allow() {
            if let Err(err) = self.inner.platform.mark_read(&ctx.msg_id).await {
                tracing::debug!(msg_id = %ctx.msg_id, error = %err, "标记已读失败");
            }
        }

        Ok(HandleOutcome::Dispatched(report))
    }

    /// 持久化后并发投递给所有转发器，等待全部完成
    pub async fn dispatch(&self, message: &NormalizedMessage) -> DispatchReport {
        let msg_id = message.msg_id();
        if !message.is_ephemeral() {
            if let Err(err) = self.inner.message_log.append(message).await {
                tracing::warn!(msg_id, error = %err, "保存消息失败");
            }
        }

        let payload = match message.to_json_bytes() {
            Ok(encoded) => Bytes::from(encoded),
            Err(err) => {
                tracing::error!(msg_id, error = %err, "序列化消息失败");
                return DispatchReport::default();
            }
        };

        let tasks: Vec<(String, JoinHandle<Result<(), RedirectError>>)> = self
            .redirectors()
            .into_iter()
            .map(|redirector| {
                let name = redirector.name().to_owned();
                let payload = payload.clone();
                let task = tokio::spawn(async move { redirector.send_message(payload).await });
                (name, task)
            })
            .collect();

        let mut report = DispatchReport::default();
        for (name, task) in tasks {
            match task.await {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(err)) => {
                    tracing::warn!(msg_id, redirector = %name, error = %err, "转发失败");
                    report.failed.push(name);
                }
                Err(err) => {
                    tracing::error!(msg_id, redirector = %name, error = %err, "转发任务异常退出");
                    report.failed.push(name);
                }
            }
        }
        report
    }

    /// 对所有群做一次成员对账，把离群成员作为系统消息分发
    ///
    /// 上一轮还在进行时直接跳过。
    pub async fn watch_members(&self) -> Result<WatchOutcome, ApplicationError> {
        let Ok(_guard) = self.inner.member_watch.try_lock() else {
            tracing::debug!("上一轮成员对账未结束，跳过");
            return Ok(WatchOutcome::Skipped);
        };

        let groups = self.inner.platform.groups().await?;
        let mut departures = 0;
        for group in &groups {
            let gid = match self.inner.directory.resolve(&group.identity).await {
                Ok(gid) => gid,
                Err(err) => {
                    tracing::warn!(handle = %group.handle(), error = %err, "解析群身份失败");
                    continue;
                }
            };
            let left = match self.inner.roster.reconcile(&gid, &group.members).await {
                Ok(left) => left,
                Err(err) => {
                    tracing::warn!(gid = %gid, error = %err, "群成员对账失败");
                    continue;
                }
            };
            if left.is_empty() {
                continue;
            }

            departures += left.len();
            tracing::info!(gid = %gid, count = left.len(), "检测到成员离群");
            let envelope = Envelope::new(msg_type::SYSTEM, self.inner.clock.now().timestamp(), "")
                .with_group(gid, group.identity.nickname.clone());
            let members = left
                .into_iter()
                .map(|identity| MemberRef {
                    uid: identity.id,
                    name: identity.display_name,
                })
                .collect();
            self.dispatch(&NormalizedMessage::system(
                envelope,
                SystemEvent::ExitGroup(members),
            ))
            .await;
        }

        Ok(WatchOutcome::Completed {
            groups: groups.len(),
            departures,
        })
    }

    /// 事件循环：每个事件在独立任务中处理，直到取消或发送端关闭
    pub async fn run(&self, mut events: mpsc::Receiver<PlatformEvent>, cancel: CancellationToken) {
        tracing::info!("消息中枢已启动");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let hub = self.clone();
                    tokio::spawn(async move {
                        let msg_id = event.context().msg_id.clone();
                        if let Err(err) = hub.handle(event).await {
                            tracing::warn!(msg_id = %msg_id, error = %err, "处理平台事件失败");
                        }
                    });
                }
            }
        }
        tracing::info!("消息中枢已停止");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::identity::KvIdentityResolver;
    use crate::kv::memory::MemoryKvStore;
    use crate::kv::{KvError, KvStore};
    use crate::platform::memory::{MemoryPlatform, PlatformCall};
    use crate::platform::{EventContext, PlatformGroup};
    use crate::repository::memory::{MemoryMembershipRepository, MemoryMessageLog};
    use crate::resource::memory::MemoryResourceStore;
    use async_trait::async_trait;
    use domain::RawIdentity;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingRedirector {
        name: String,
        payloads: StdMutex<Vec<Bytes>>,
    }

    impl RecordingRedirector {
        fn named(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                ..Self::default()
            })
        }

        fn messages(&self) -> Vec<serde_json::Value> {
            self.payloads
                .lock()
                .unwrap()
                .iter()
                .map(|payload| serde_json::from_slice(payload).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl Redirector for RecordingRedirector {
        fn name(&self) -> &str {
            &self.name
        }

        async fn send_message(&self, payload: Bytes) -> Result<(), RedirectError> {
            self.payloads.lock().unwrap().push(payload);
            Ok(())
        }
    }

    struct FailingRedirector;

    #[async_trait]
    impl Redirector for FailingRedirector {
        fn name(&self) -> &str {
            "failing"
        }

        async fn send_message(&self, _payload: Bytes) -> Result<(), RedirectError> {
            Err(RedirectError::transport("connection refused"))
        }
    }

    struct PanickingRedirector;

    #[async_trait]
    impl Redirector for PanickingRedirector {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn send_message(&self, _payload: Bytes) -> Result<(), RedirectError> {
            panic!("boom");
        }
    }

    struct Fixture {
        hub: MessageHub,
        platform: Arc<MemoryPlatform>,
        log: Arc<MemoryMessageLog>,
    }

    fn fixture_with_store(store: Arc<dyn KvStore>) -> Fixture {
        let directory: Arc<dyn IdentityDirectory> =
            Arc::new(KvIdentityResolver::new(store.clone(), Duration::from_secs(60)));
        let platform = Arc::new(MemoryPlatform::new());
        let log = Arc::new(MemoryMessageLog::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let hub = MessageHub::new(HubDependencies {
            directory: directory.clone(),
            roster: Arc::new(RosterReconciler::new(
                directory,
                Arc::new(MemoryMembershipRepository::new()),
                clock.clone(),
            )),
            dedup: Arc::new(DedupGate::new(store, 100, None)),
            message_log: log.clone(),
            resources: Arc::new(MemoryResourceStore::new()),
            platform: platform.clone(),
            clock,
        });
        Fixture { hub, platform, log }
    }

    fn fixture() -> Fixture {
        fixture_with_store(Arc::new(MemoryKvStore::new()))
    }

    fn text(msg_id: &str, content: &str) -> PlatformEvent {
        PlatformEvent::Text {
            ctx: EventContext::new(msg_id, msg_type::TEXT, 1, RawIdentity::user("@alice", "alice")),
            content: content.into(),
        }
    }

    fn team(members: &[&str]) -> PlatformGroup {
        PlatformGroup::new(
            RawIdentity::group("@@team", "team"),
            members
                .iter()
                .map(|name| RawIdentity::user(format!("@{name}"), *name))
                .collect(),
        )
    }

    #[tokio::test]
    async fn redelivered_message_is_dispatched_once() {
        let f = fixture();
        let recorder = RecordingRedirector::named("recorder");
        f.hub.register(recorder.clone());

        let first = f.hub.handle(text("m1", "hello")).await.unwrap();
        assert!(matches!(first, HandleOutcome::Dispatched(_)));
        let second = f.hub.handle(text("m1", "hello")).await.unwrap();
        assert_eq!(second, HandleOutcome::Duplicate);

        assert_eq!(recorder.messages().len(), 1);
        assert_eq!(f.log.messages().await.len(), 1);
    }

    #[tokio::test]
    async fn failing_redirectors_do_not_affect_the_others() {
        let f = fixture();
        let first = RecordingRedirector::named("first");
        let last = RecordingRedirector::named("last");
        f.hub.register(first.clone());
        f.hub.register(Arc::new(FailingRedirector));
        f.hub.register(Arc::new(PanickingRedirector));
        f.hub.register(last.clone());

        let outcome = f.hub.handle(text("m1", "hello")).await.unwrap();
        let HandleOutcome::Dispatched(report) = outcome else {
            panic!("expected dispatch");
        };
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, vec!["failing".to_string(), "panicking".to_string()]);
        assert_eq!(first.messages().len(), 1);
        assert_eq!(last.messages().len(), 1);
    }

    #[tokio::test]
    async fn notify_and_own_messages_are_ignored() {
        let f = fixture();
        let recorder = RecordingRedirector::named("recorder");
        f.hub.register(recorder.clone());

        let mut own = text("m1", "mine");
        if let PlatformEvent::Text { ctx, .. } = &mut own {
            ctx.from_self = true;
        }
        let mut notify = text("m2", "sync");
        if let PlatformEvent::Text { ctx, .. } = &mut notify {
            ctx.notify = true;
        }

        assert_eq!(f.hub.handle(own).await.unwrap(), HandleOutcome::Ignored);
        assert_eq!(f.hub.handle(notify).await.unwrap(), HandleOutcome::Ignored);
        assert!(recorder.messages().is_empty());
    }

    #[tokio::test]
    async fn dedup_store_failure_aborts_the_message() {
        struct DownStore;

        #[async_trait]
        impl KvStore for DownStore {
            async fn get(&self, _: &str) -> Result<Option<String>, KvError> {
                Err(KvError::backend("down"))
            }
            async fn set(&self, _: &str, _: &str, _: Option<Duration>) -> Result<(), KvError> {
                Err(KvError::backend("down"))
            }
            async fn set_many(&self, _: &[String], _: &str, _: Option<Duration>) -> Result<(), KvError> {
                Err(KvError::backend("down"))
            }
            async fn set_if_absent(&self, _: &str, _: &str, _: Option<Duration>) -> Result<bool, KvError> {
                Err(KvError::backend("down"))
            }
        }

        let f = fixture_with_store(Arc::new(DownStore));
        let recorder = RecordingRedirector::named("recorder");
        f.hub.register(recorder.clone());

        let err = f.hub.handle(text("m1", "hello")).await.unwrap_err();
        assert!(matches!(err, ApplicationError::Store(_)));
        assert!(recorder.messages().is_empty());
    }

    #[tokio::test]
    async fn read_receipts_are_throttled() {
        let f = fixture();
        f.hub.handle(text("m1", "a")).await.unwrap();
        f.hub.handle(text("m2", "b")).await.unwrap();

        let receipts: Vec<_> = f
            .platform
            .calls()
            .into_iter()
            .filter(|call| matches!(call, PlatformCall::MarkRead { .. }))
            .collect();
        assert_eq!(receipts, vec![PlatformCall::MarkRead { msg_id: "m1".into() }]);
    }

    #[tokio::test]
    async fn departures_are_dispatched_as_exit_group_notices() {
        let f = fixture();
        let recorder = RecordingRedirector::named("recorder");
        f.hub.register(recorder.clone());

        f.platform.set_groups(vec![team(&["alice", "bob"])]);
        assert_eq!(
            f.hub.watch_members().await.unwrap(),
            WatchOutcome::Completed { groups: 1, departures: 0 }
        );
        assert!(recorder.messages().is_empty());

        f.platform.set_groups(vec![team(&["alice"])]);
        assert_eq!(
            f.hub.watch_members().await.unwrap(),
            WatchOutcome::Completed { groups: 1, departures: 1 }
        );

        let messages = recorder.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["msgID"], "");
        assert_eq!(messages[0]["msgType"], msg_type::SYSTEM);
        assert_eq!(messages[0]["groupName"], "team");
        assert_eq!(messages[0]["event"], "ExitGroup");
        assert_eq!(messages[0]["data"].as_array().map(Vec::len), Some(1));
        assert_eq!(messages[0]["data"][0]["name"], "bob");
        // 临时通知不进消息日志
        assert!(f.log.messages().await.is_empty());
    }

    #[tokio::test]
    async fn overlapping_watch_is_skipped() {
        let f = fixture();
        let _running = f.hub.inner.member_watch.lock().await;
        assert_eq!(f.hub.watch_members().await.unwrap(), WatchOutcome::Skipped);
    }

    #[tokio::test]
    async fn run_drains_events_until_cancelled() {
        let f = fixture();
        let recorder = RecordingRedirector::named("recorder");
        f.hub.register(recorder.clone());

        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let hub = f.hub.clone();
        let pump = tokio::spawn({
            let cancel = cancel.clone();
            async move { hub.run(rx, cancel).await }
        });

        tx.send(text("m1", "one")).await.unwrap();
        tx.send(text("m2", "two")).await.unwrap();
        for _ in 0..100 {
            if recorder.messages().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorder.messages().len(), 2);

        cancel.cancel();
        pump.await.unwrap();
    }
}
