//! 内嵌代理的 MQTT 3.1.1 接入：报文编解码、主题匹配和单连接会话

use std::time::Duration;

use bytes::{BufMut, BytesMut};
use futures_util::{SinkExt, StreamExt};
use rumqttc::mqttbytes::Error as PacketError;
use rumqttc::{
    ConnAck, ConnectReturnCode, Packet, PubAck, Publish, QoS, SubAck, SubscribeReasonCode,
    UnsubAck,
};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::codec::{Decoder, Encoder, Framed};
use uuid::Uuid;

use super::broker::{EmbeddedBroker, Origin, Publication};

#[derive(Debug, Error)]
pub(crate) enum CodecError {
    #[error("连接读写失败: {0}")]
    Io(#[from] std::io::Error),
    #[error("MQTT 报文错误: {0:?}")]
    Packet(PacketError),
}

/// 服务端下行报文；PINGRESP 只有两个字节，直接写出
pub(crate) enum Outbound {
    Packet(Packet),
    PingResp,
}

pub(crate) struct MqttCodec {
    max_packet_size: usize,
}

impl MqttCodec {
    pub(crate) fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }
}

impl Decoder for MqttCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        match Packet::read(src, self.max_packet_size) {
            Ok(packet) => Ok(Some(packet)),
            Err(PacketError::InsufficientBytes(required)) => {
                src.reserve(required);
                Ok(None)
            }
            Err(err) => Err(CodecError::Packet(err)),
        }
    }
}

impl Encoder<Outbound> for MqttCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<(), CodecError> {
        match item {
            Outbound::Packet(packet) => {
                packet
                    .write(dst, self.max_packet_size)
                    .map_err(CodecError::Packet)?;
            }
            Outbound::PingResp => dst.put_slice(&[0xD0, 0x00]),
        }
        Ok(())
    }
}

/// 主题过滤器是否合法：`#` 只能是最后一级，通配符必须独占一级
pub(crate) fn valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    levels.iter().enumerate().all(|(index, level)| match *level {
        "#" => index == last,
        "+" => true,
        level => !level.contains(['#', '+']),
    })
}

/// 发布用的主题名不能为空，也不能带通配符
pub(crate) fn valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['#', '+'])
}

/// 主题名是否匹配过滤器；`$` 开头的主题不被首级通配符匹配
pub(crate) fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(level)) if expected == level => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct Subscription {
    filter: String,
    qos: QoS,
    /// 订阅时的发布序号，之前的发布由保留消息补发
    since: u64,
}

/// 单个客户端会话的结束原因
#[derive(Debug)]
enum SessionEnd {
    Disconnected,
    Closed,
    Idle,
    Shutdown,
    Protocol(&'static str),
    Codec(CodecError),
}

enum Event {
    Packet(Option<Option<Result<Packet, CodecError>>>),
    Live(Result<Publication, broadcast::error::RecvError>),
}

struct Session {
    broker: EmbeddedBroker,
    identity: String,
    framed: Framed<TcpStream, MqttCodec>,
    subscriptions: Vec<Subscription>,
    next_pkid: u16,
}

/// 完成 CONNECT 握手后进入会话循环，直到客户端断开或代理停止
pub(crate) async fn serve_connection(broker: EmbeddedBroker, stream: TcpStream) {
    let config = broker.config().clone();
    let mut framed = Framed::new(stream, MqttCodec::new(config.max_packet_size));

    let connect = match tokio::time::timeout(config.connect_timeout, framed.next()).await {
        Ok(Some(Ok(Packet::Connect(connect)))) => connect,
        Ok(Some(Err(err))) => {
            tracing::debug!(error = %err, "代理连接握手失败");
            return;
        }
        _ => return,
    };

    let (username, password) = connect
        .login
        .as_ref()
        .map(|login| (login.username.as_str(), login.password.as_str()))
        .unwrap_or(("", ""));
    if !broker.authenticate(username, password).await {
        tracing::warn!(username, client_id = %connect.client_id, "代理连接认证失败");
        let refused = ConnAck::new(ConnectReturnCode::NotAuthorized, false);
        let _ = framed.send(Outbound::Packet(Packet::ConnAck(refused))).await;
        return;
    }

    // 有账号时以账号为身份，否则用客户端标识
    let identity = if !username.is_empty() {
        username.to_owned()
    } else if !connect.client_id.is_empty() {
        connect.client_id.clone()
    } else {
        Uuid::new_v4().to_string()
    };
    let accepted = ConnAck::new(ConnectReturnCode::Success, false);
    if framed
        .send(Outbound::Packet(Packet::ConnAck(accepted)))
        .await
        .is_err()
    {
        return;
    }

    // 客户端超过 1.5 倍保活时间没有任何报文视为掉线
    let idle = (connect.keep_alive > 0)
        .then(|| Duration::from_millis(u64::from(connect.keep_alive) * 1500));
    tracing::info!(identity = %identity, keep_alive = connect.keep_alive, "代理客户端已连接");

    let mut session = Session {
        broker,
        identity,
        framed,
        subscriptions: Vec::new(),
        next_pkid: 0,
    };
    let end = session.run(idle).await;
    tracing::info!(identity = %session.identity, end = ?end, "代理客户端已断开");
}

impl Session {
    async fn run(&mut self, idle: Option<Duration>) -> SessionEnd {
        let cancel = self.broker.cancel_token();
        let mut live = self.broker.live();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Shutdown,
                packet = read_packet(&mut self.framed, idle) => Event::Packet(packet),
                received = live.recv() => Event::Live(received),
            };

            let step = match event {
                Event::Packet(None) => Err(SessionEnd::Idle),
                Event::Packet(Some(None)) => Err(SessionEnd::Closed),
                Event::Packet(Some(Some(Err(err)))) => Err(SessionEnd::Codec(err)),
                Event::Packet(Some(Some(Ok(packet)))) => self.handle(packet).await,
                Event::Live(Ok(publication)) => self.forward(publication).await,
                Event::Live(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    tracing::warn!(identity = %self.identity, skipped, "订阅者消费过慢，跳过部分发布");
                    Ok(())
                }
                Event::Live(Err(broadcast::error::RecvError::Closed)) => Err(SessionEnd::Shutdown),
            };
            if let Err(end) = step {
                return end;
            }
        }
    }

    async fn handle(&mut self, packet: Packet) -> Result<(), SessionEnd> {
        match packet {
            Packet::Publish(publish) => {
                if !valid_topic(&publish.topic) {
                    return Err(SessionEnd::Protocol("非法的发布主题"));
                }
                match publish.qos {
                    QoS::AtMostOnce => {}
                    QoS::AtLeastOnce => {
                        self.send(Packet::PubAck(PubAck::new(publish.pkid))).await?;
                    }
                    QoS::ExactlyOnce => return Err(SessionEnd::Protocol("不支持 QoS 2")),
                }
                self.broker.publish(
                    &publish.topic,
                    publish.payload,
                    publish.retain,
                    Origin::Client(self.identity.clone()),
                );
                Ok(())
            }
            Packet::Subscribe(subscribe) => {
                let mut codes = Vec::with_capacity(subscribe.filters.len());
                let mut replay = Vec::new();
                for filter in subscribe.filters {
                    if !valid_filter(&filter.path) {
                        codes.push(SubscribeReasonCode::Failure);
                        continue;
                    }
                    let qos = granted(filter.qos);
                    let (retained, since) = self.broker.retained_matching(&filter.path);
                    tracing::debug!(identity = %self.identity, filter = %filter.path, retained = retained.len(), "客户端订阅主题");
                    self.subscriptions.retain(|s| s.filter != filter.path);
                    self.subscriptions.push(Subscription {
                        filter: filter.path,
                        qos,
                        since,
                    });
                    replay.extend(retained.into_iter().map(|p| (p, qos)));
                    codes.push(SubscribeReasonCode::Success(qos));
                }
                self.send(Packet::SubAck(SubAck::new(subscribe.pkid, codes)))
                    .await?;
                for (publication, qos) in replay {
                    self.deliver(&publication, qos, true).await?;
                }
                Ok(())
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.subscriptions
                    .retain(|s| !unsubscribe.topics.contains(&s.filter));
                self.send(Packet::UnsubAck(UnsubAck::new(unsubscribe.pkid)))
                    .await
            }
            Packet::PingReq { .. } => self
                .framed
                .send(Outbound::PingResp)
                .await
                .map_err(SessionEnd::Codec),
            Packet::Disconnect { .. } => Err(SessionEnd::Disconnected),
            Packet::Connect(_) => Err(SessionEnd::Protocol("重复的 CONNECT")),
            // 下行只做一次投递，客户端的确认不需要处理
            _ => Ok(()),
        }
    }

    /// 实时发布：订阅建立之后的才投递，同一发布只投递一次
    async fn forward(&mut self, publication: Publication) -> Result<(), SessionEnd> {
        let qos = self
            .subscriptions
            .iter()
            .filter(|s| publication.seq > s.since && topic_matches(&s.filter, &publication.topic))
            .map(|s| s.qos)
            .max_by_key(|qos| *qos as u8);
        match qos {
            Some(qos) => self.deliver(&publication, qos, false).await,
            None => Ok(()),
        }
    }

    async fn deliver(
        &mut self,
        publication: &Publication,
        qos: QoS,
        retain: bool,
    ) -> Result<(), SessionEnd> {
        let mut publish = Publish::new(
            publication.topic.as_str(),
            qos,
            publication.payload.to_vec(),
        );
        publish.retain = retain;
        if qos != QoS::AtMostOnce {
            publish.pkid = self.pkid();
        }
        self.send(Packet::Publish(publish)).await
    }

    async fn send(&mut self, packet: Packet) -> Result<(), SessionEnd> {
        self.framed
            .send(Outbound::Packet(packet))
            .await
            .map_err(SessionEnd::Codec)
    }

    /// 报文标识 1..=65535 循环使用
    fn pkid(&mut self) -> u16 {
        self.next_pkid = self.next_pkid.checked_add(1).unwrap_or(1);
        self.next_pkid
    }
}

/// 代理只做到 QoS 1
fn granted(requested: QoS) -> QoS {
    match requested {
        QoS::AtMostOnce => QoS::AtMostOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// 外层 `None` 表示超过保活时间，内层 `None` 表示连接关闭
async fn read_packet(
    framed: &mut Framed<TcpStream, MqttCodec>,
    idle: Option<Duration>,
) -> Option<Option<Result<Packet, CodecError>>> {
    match idle {
        Some(limit) => tokio::time::timeout(limit, framed.next()).await.ok(),
        None => Some(framed.next().await),
    }
}
