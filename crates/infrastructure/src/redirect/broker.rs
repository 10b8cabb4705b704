//! 内嵌 MQTT 发布订阅代理
//!
//! 代理在 TCP 上提供 MQTT 3.1.1（QoS 0/1），任何标准客户端都可以接入。
//! 带保留标志的发布按主题保留最近 N 条，新订阅者先收到匹配的保留消息再收到实时消息；
//! 保留标志加空负载会清掉该主题的保留消息。连接认证交给 [`ConnectAuthHook`]。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use application::{CredentialCheck, InboundSink, InboundSlot, RedirectError, Redirector};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::mqtt::{serve_connection, topic_matches};

pub const CHANNEL: &str = "BROKER";

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// 每个主题保留的发布条数，0 表示不保留
    pub retain: usize,
    pub channel_capacity: usize,
    pub max_packet_size: usize,
    /// 建立 TCP 连接后等待 CONNECT 的时间
    pub connect_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            retain: 100,
            channel_capacity: 256,
            max_packet_size: 10 * 1024 * 1024,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// 发布来源：中枢自身，或者以认证身份标记的客户端
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Hub,
    Client(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    /// 代理内单调递增的发布序号
    pub seq: u64,
    pub topic: String,
    pub payload: Bytes,
    pub origin: Origin,
}

/// 连接认证钩子
#[async_trait]
pub trait ConnectAuthHook: Send + Sync {
    async fn on_connect(&self, username: &str, password: &str) -> bool;
}

/// 未配置认证时放行所有连接
pub struct AllowAll;

#[async_trait]
impl ConnectAuthHook for AllowAll {
    async fn on_connect(&self, _username: &str, _password: &str) -> bool {
        true
    }
}

pub struct CredentialAuthHook {
    check: Arc<dyn CredentialCheck>,
}

impl CredentialAuthHook {
    pub fn new(check: Arc<dyn CredentialCheck>) -> Self {
        Self { check }
    }
}

#[async_trait]
impl ConnectAuthHook for CredentialAuthHook {
    async fn on_connect(&self, username: &str, password: &str) -> bool {
        self.check.check_user(username, password).await
    }
}

#[derive(Default)]
struct Store {
    seq: u64,
    /// 只存有保留消息的主题，清空即删除
    retained: HashMap<String, VecDeque<Publication>>,
}

struct BrokerInner {
    store: Mutex<Store>,
    live: broadcast::Sender<Publication>,
    config: BrokerConfig,
    auth: Arc<dyn ConnectAuthHook>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct EmbeddedBroker {
    inner: Arc<BrokerInner>,
}

impl EmbeddedBroker {
    pub fn new(
        config: BrokerConfig,
        auth: Arc<dyn ConnectAuthHook>,
        cancel: CancellationToken,
    ) -> Self {
        let (live, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            inner: Arc::new(BrokerInner {
                store: Mutex::new(Store::default()),
                live,
                config,
                auth,
                cancel,
            }),
        }
    }

    /// 锁中毒时沿用内部数据，保留消息只是缓存
    fn store(&self) -> MutexGuard<'_, Store> {
        self.inner
            .store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// 发布到主题，返回收到实时推送的会话数量
    pub fn publish(&self, topic: &str, payload: Bytes, retain: bool, origin: Origin) -> usize {
        let mut store = self.store();
        store.seq += 1;
        let publication = Publication {
            seq: store.seq,
            topic: topic.to_owned(),
            payload,
            origin,
        };

        let limit = self.inner.config.retain;
        if retain && publication.payload.is_empty() {
            store.retained.remove(topic);
        } else if retain && limit > 0 {
            let queue = store.retained.entry(topic.to_owned()).or_default();
            while queue.len() >= limit {
                queue.pop_front();
            }
            queue.push_back(publication.clone());
        }
        // 持锁发送，实时流和保留快照按序号衔接
        self.inner.live.send(publication).unwrap_or(0)
    }

    pub fn retained(&self, topic: &str) -> Vec<Publication> {
        self.store()
            .retained
            .get(topic)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 保留消息的主题数
    pub fn retained_topics(&self) -> usize {
        self.store().retained.len()
    }

    /// 匹配过滤器的保留消息（按发布顺序）和当前序号，之后的发布从实时流里取
    pub(crate) fn retained_matching(&self, filter: &str) -> (Vec<Publication>, u64) {
        let store = self.store();
        let mut retained: Vec<Publication> = store
            .retained
            .iter()
            .filter(|(topic, _)| topic_matches(filter, topic))
            .flat_map(|(_, queue)| queue.iter().cloned())
            .collect();
        retained.sort_by_key(|p| p.seq);
        (retained, store.seq)
    }

    pub(crate) fn live(&self) -> broadcast::Receiver<Publication> {
        self.inner.live.subscribe()
    }

    pub(crate) fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub(crate) async fn authenticate(&self, username: &str, password: &str) -> bool {
        self.inner.auth.on_connect(username, password).await
    }

    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "内嵌 MQTT 代理已启动");
        }
        let cancel = self.inner.cancel.clone();
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    tracing::debug!(%addr, "代理收到新连接");
                    tokio::spawn(serve_connection(self.clone(), stream));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "代理接受连接失败");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// 把中枢消息发布到代理，并把命令主题上客户端的发布转交给入站回调
pub struct BrokerRedirector {
    broker: EmbeddedBroker,
    publish_topic: String,
    inbound: Arc<InboundSlot>,
}

impl BrokerRedirector {
    pub fn new(
        broker: EmbeddedBroker,
        publish_topic: impl Into<String>,
        command_topic: Option<String>,
    ) -> Self {
        let inbound = Arc::new(InboundSlot::new());
        if let Some(topic) = command_topic {
            // 保留的旧命令不重放
            tokio::spawn(listen_commands(
                broker.live(),
                topic,
                inbound.clone(),
                broker.cancel_token(),
            ));
        }
        Self {
            broker,
            publish_topic: publish_topic.into(),
            inbound,
        }
    }
}

async fn listen_commands(
    mut rx: broadcast::Receiver<Publication>,
    filter: String,
    inbound: Arc<InboundSlot>,
    cancel: CancellationToken,
) {
    loop {
        let publication = tokio::select! {
            _ = cancel.cancelled() => return,
            received = rx.recv() => match received {
                Ok(publication) => publication,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "命令主题积压，跳过部分命令");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        };
        let Origin::Client(identity) = &publication.origin else {
            continue;
        };
        if topic_matches(&filter, &publication.topic) {
            inbound
                .deliver(publication.payload.clone(), CHANNEL, identity)
                .await;
        }
    }
}

#[async_trait]
impl Redirector for BrokerRedirector {
    fn name(&self) -> &str {
        CHANNEL
    }

    async fn send_message(&self, payload: Bytes) -> Result<(), RedirectError> {
        if self.broker.inner.cancel.is_cancelled() {
            return Err(RedirectError::Closed);
        }
        self.broker
            .publish(&self.publish_topic, payload, true, Origin::Hub);
        Ok(())
    }

    fn on_receive(&self, sink: Arc<dyn InboundSink>) {
        self.inbound.set(sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use application::ApplicationError;

    fn broker(retain: usize) -> EmbeddedBroker {
        EmbeddedBroker::new(
            BrokerConfig {
                retain,
                ..BrokerConfig::default()
            },
            Arc::new(AllowAll),
            CancellationToken::new(),
        )
    }

    fn payloads(publications: Vec<Publication>) -> Vec<Bytes> {
        publications.into_iter().map(|p| p.payload).collect()
    }

    #[tokio::test]
    async fn retains_only_the_latest_publications() {
        let broker = broker(2);
        let mut rx = broker.live();
        for n in ["1", "2", "3"] {
            broker.publish("message", Bytes::from(n), true, Origin::Hub);
        }
        assert_eq!(
            payloads(broker.retained("message")),
            vec![Bytes::from("2"), Bytes::from("3")]
        );
        assert_eq!(rx.recv().await.unwrap().seq, 1);

        // 不带保留标志的发布只走实时流
        broker.publish("message", Bytes::from("4"), false, Origin::Hub);
        assert_eq!(broker.retained("message").len(), 2);
    }

    #[tokio::test]
    async fn zero_retain_keeps_nothing() {
        let broker = broker(0);
        assert_eq!(broker.publish("message", Bytes::from("x"), true, Origin::Hub), 0);
        assert!(broker.retained("message").is_empty());
        assert_eq!(broker.retained_topics(), 0);
    }

    #[tokio::test]
    async fn empty_retained_payload_clears_the_topic() {
        let broker = broker(5);
        broker.publish("a", Bytes::from("1"), true, Origin::Hub);
        broker.publish("b", Bytes::from("2"), true, Origin::Hub);
        assert_eq!(broker.retained_topics(), 2);

        broker.publish("a", Bytes::new(), true, Origin::Hub);
        assert_eq!(broker.retained_topics(), 1);
        assert!(broker.retained("a").is_empty());
    }

    #[tokio::test]
    async fn retained_snapshot_matches_wildcards_in_publish_order() {
        let broker = broker(5);
        broker.publish("hub/b", Bytes::from("1"), true, Origin::Hub);
        broker.publish("hub/a", Bytes::from("2"), true, Origin::Hub);
        broker.publish("other", Bytes::from("3"), true, Origin::Hub);

        let (retained, since) = broker.retained_matching("hub/+");
        assert_eq!(payloads(retained), vec![Bytes::from("1"), Bytes::from("2")]);
        assert_eq!(since, 3);
    }

    #[tokio::test]
    async fn poisoned_store_keeps_working() {
        let broker = broker(5);
        let poisoner = broker.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.inner.store.lock().unwrap();
            panic!("poison the store");
        })
        .join();
        assert!(broker.inner.store.is_poisoned());

        let mut rx = broker.live();
        assert_eq!(broker.publish("message", Bytes::from("x"), true, Origin::Hub), 1);
        assert_eq!(rx.recv().await.unwrap().payload, Bytes::from("x"));
        assert_eq!(broker.retained("message").len(), 1);
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<(Bytes, String, String)>>);

    #[async_trait]
    impl InboundSink for Collect {
        async fn receive(&self, payload: Bytes, from: &str, id: &str) -> Result<(), ApplicationError> {
            self.0
                .lock()
                .unwrap()
                .push((payload, from.to_owned(), id.to_owned()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn redirector_publishes_and_forwards_client_commands() {
        let broker = broker(10);
        let redirector = BrokerRedirector::new(broker.clone(), "message", Some("command".into()));
        let collect = Arc::new(Collect::default());
        redirector.on_receive(collect.clone());

        redirector
            .send_message(Bytes::from_static(br#"{"msgId":"1"}"#))
            .await
            .unwrap();
        assert_eq!(
            broker.retained("message")[0].payload,
            Bytes::from_static(br#"{"msgId":"1"}"#)
        );

        // 中枢自己的发布不回流；名为 hub 的客户端照常转交
        broker.publish("command", Bytes::from("from-hub"), false, Origin::Hub);
        broker.publish("other", Bytes::from("elsewhere"), false, Origin::Client("alice".into()));
        broker.publish("command", Bytes::from("from-client"), false, Origin::Client("hub".into()));
        tokio::time::timeout(Duration::from_secs(1), async {
            while collect.0.lock().unwrap().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let seen = collect.0.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![(Bytes::from("from-client"), CHANNEL.to_owned(), "hub".to_owned())]
        );
    }

    #[tokio::test]
    async fn cancelled_broker_rejects_sends() {
        let cancel = CancellationToken::new();
        let broker = EmbeddedBroker::new(BrokerConfig::default(), Arc::new(AllowAll), cancel.clone());
        let redirector = BrokerRedirector::new(broker, "message", None);
        cancel.cancel();
        assert!(matches!(
            redirector.send_message(Bytes::from("x")).await,
            Err(RedirectError::Closed)
        ));
    }
}
