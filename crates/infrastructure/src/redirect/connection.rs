//! WebSocket 连接循环
//!
//! 客户端、广播服务端和内嵌代理的每条连接都用同一个循环：读循环回 pong 并把其余帧交给入站回调，
//! 写循环负责出站队列和心跳，两者共享一个可取消的生命周期，任一方结束都会拆掉整条连接。

use std::fmt::Display;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use application::InboundSink;
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// 心跳间隔下限
pub const MIN_HEARTBEAT: Duration = Duration::from_secs(5);

/// 超过这么多个心跳周期没有收到任何帧视为断线
const HEARTBEAT_TIMEOUT_FACTOR: u32 = 3;

pub fn heartbeat_interval(configured: Duration) -> Duration {
    configured.max(MIN_HEARTBEAT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closing,
    Errored,
    Closed,
}

/// 与具体 WebSocket 库无关的帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

impl Frame {
    /// 负载是 UTF-8 时按文本帧发送
    pub(crate) fn payload(payload: Bytes) -> Self {
        match String::from_utf8(payload.to_vec()) {
            Ok(text) => Frame::Text(text),
            Err(_) => Frame::Binary(payload),
        }
    }
}

pub(crate) trait WireMessage: Sized + Send + 'static {
    fn from_frame(frame: Frame) -> Self;

    /// 库内部的原始帧返回 `None`
    fn into_frame(self) -> Option<Frame>;
}

impl WireMessage for tokio_tungstenite::tungstenite::Message {
    fn from_frame(frame: Frame) -> Self {
        use tokio_tungstenite::tungstenite::Message;
        match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close => Message::Close(None),
        }
    }

    fn into_frame(self) -> Option<Frame> {
        use tokio_tungstenite::tungstenite::Message;
        match self {
            Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
            Message::Binary(data) => Some(Frame::Binary(data)),
            Message::Ping(data) => Some(Frame::Ping(data)),
            Message::Pong(data) => Some(Frame::Pong(data)),
            Message::Close(_) => Some(Frame::Close),
            Message::Frame(_) => None,
        }
    }
}

impl WireMessage for axum::extract::ws::Message {
    fn from_frame(frame: Frame) -> Self {
        use axum::extract::ws::Message;
        match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close => Message::Close(None),
        }
    }

    fn into_frame(self) -> Option<Frame> {
        use axum::extract::ws::Message;
        match self {
            Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
            Message::Binary(data) => Some(Frame::Binary(data)),
            Message::Ping(data) => Some(Frame::Ping(data)),
            Message::Pong(data) => Some(Frame::Pong(data)),
            Message::Close(_) => Some(Frame::Close),
        }
    }
}

/// 连接的对端信息和入站去向
pub(crate) struct Peer {
    pub channel: &'static str,
    pub id: String,
    pub inbound: Arc<dyn InboundSink>,
}

/// 连接结束的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConnectionEnd {
    /// 外部取消
    Cancelled,
    /// 对端正常关闭
    Closed,
    /// 出站队列的发送端全部关闭，不再需要这条连接
    QueueClosed,
    Failed(String),
}

/// 读循环发给写循环的命令
enum WsCommand {
    SendPong(Bytes),
}

/// 驱动一条连接直到结束
///
/// `pending` 保存写失败的负载，下一条连接会先重发它，保证跨重连的顺序。
pub(crate) async fn run_connection<S, M, E>(
    socket: S,
    outbound: &mut mpsc::Receiver<Bytes>,
    pending: &mut Option<Bytes>,
    peer: &Peer,
    heartbeat: Duration,
    cancel: &CancellationToken,
) -> ConnectionEnd
where
    S: Stream<Item = Result<M, E>> + Sink<M> + Send + Unpin,
    <S as Sink<M>>::Error: Display,
    E: Display,
    M: WireMessage,
{
    let (mut sink, mut stream) = socket.split();
    let lifetime = cancel.child_token();
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(8);
    let last_seen = Mutex::new(Instant::now());
    let heartbeat = heartbeat_interval(heartbeat);

    let read = async {
        let end = loop {
            let next = tokio::select! {
                _ = lifetime.cancelled() => break ConnectionEnd::Cancelled,
                next = stream.next() => next,
            };
            let message = match next {
                None => break ConnectionEnd::Closed,
                Some(Err(err)) => break ConnectionEnd::Failed(err.to_string()),
                Some(Ok(message)) => message,
            };
            if let Ok(mut seen) = last_seen.lock() {
                *seen = Instant::now();
            }

            let payload = match message.into_frame() {
                Some(Frame::Ping(data)) => {
                    if cmd_tx.send(WsCommand::SendPong(data)).await.is_err() {
                        break ConnectionEnd::Cancelled;
                    }
                    continue;
                }
                Some(Frame::Close) => break ConnectionEnd::Closed,
                Some(Frame::Text(text)) => Bytes::from(text),
                Some(Frame::Binary(data)) => data,
                Some(Frame::Pong(_)) | None => continue,
            };
            if let Err(err) = peer.inbound.receive(payload, peer.channel, &peer.id).await {
                tracing::warn!(channel = peer.channel, peer = %peer.id, error = %err, "处理入站消息失败");
            }
        };
        lifetime.cancel();
        end
    };

    let write = async {
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let end = loop {
            if let Some(payload) = pending.take() {
                if let Err(err) = sink.send(M::from_frame(Frame::payload(payload.clone()))).await {
                    *pending = Some(payload);
                    break ConnectionEnd::Failed(err.to_string());
                }
                continue;
            }

            tokio::select! {
                _ = lifetime.cancelled() => break ConnectionEnd::Cancelled,
                Some(command) = cmd_rx.recv() => match command {
                    WsCommand::SendPong(data) => {
                        if let Err(err) = sink.send(M::from_frame(Frame::Pong(data))).await {
                            break ConnectionEnd::Failed(err.to_string());
                        }
                    }
                },
                payload = outbound.recv() => match payload {
                    Some(payload) => *pending = Some(payload),
                    None => break ConnectionEnd::QueueClosed,
                },
                _ = ticker.tick() => {
                    let silent = last_seen
                        .lock()
                        .map(|seen| seen.elapsed())
                        .unwrap_or_default();
                    if silent > heartbeat * HEARTBEAT_TIMEOUT_FACTOR {
                        break ConnectionEnd::Failed(format!("心跳超时: {}s 未收到数据", silent.as_secs()));
                    }
                    if let Err(err) = sink.send(M::from_frame(Frame::Ping(Bytes::new()))).await {
                        break ConnectionEnd::Failed(err.to_string());
                    }
                }
            }
        };
        lifetime.cancel();
        if !matches!(end, ConnectionEnd::Failed(_)) {
            let _ = sink.close().await;
        }
        end
    };

    let (read_end, write_end) = tokio::join!(read, write);
    if cancel.is_cancelled() {
        return ConnectionEnd::Cancelled;
    }
    match (read_end, write_end) {
        (ConnectionEnd::Failed(reason), _) | (_, ConnectionEnd::Failed(reason)) => {
            ConnectionEnd::Failed(reason)
        }
        (_, ConnectionEnd::QueueClosed) => ConnectionEnd::QueueClosed,
        _ => ConnectionEnd::Closed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::Message;

    #[test]
    fn heartbeat_has_a_floor() {
        assert_eq!(heartbeat_interval(Duration::from_secs(1)), MIN_HEARTBEAT);
        assert_eq!(
            heartbeat_interval(Duration::from_secs(30)),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn utf8_payloads_become_text_frames() {
        assert_eq!(
            Frame::payload(Bytes::from_static(b"{\"a\":1}")),
            Frame::Text("{\"a\":1}".into())
        );
        assert_eq!(
            Frame::payload(Bytes::from_static(&[0xff, 0xfe])),
            Frame::Binary(Bytes::from_static(&[0xff, 0xfe]))
        );
        assert_eq!(
            Message::from_frame(Frame::Text("hi".into())).into_frame(),
            Some(Frame::Text("hi".into()))
        );
    }
}
