//! 断线重连的 WebSocket 客户端转发器
//!
//! 监督循环持有出站队列：拨号成功后交给连接循环，连接结束就等待固定退避再重拨，直到根取消。

use std::sync::Arc;
use std::time::Duration;

use application::{InboundSink, InboundSlot, RedirectError, Redirector};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connection::{run_connection, ConnectionEnd, ConnectionState, Peer, MIN_HEARTBEAT};

pub const CHANNEL: &str = "WS_CLIENT";

pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct WsClientConfig {
    pub url: String,
    pub heartbeat: Duration,
    pub backoff: Duration,
    pub queue_capacity: usize,
}

impl WsClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat: MIN_HEARTBEAT,
            backoff: DEFAULT_BACKOFF,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

pub struct WsClientRedirector {
    outbound: mpsc::Sender<Bytes>,
    inbound: Arc<InboundSlot>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl WsClientRedirector {
    /// 启动监督循环；`cancel` 触发后不再重连
    pub fn spawn(config: WsClientConfig, cancel: CancellationToken) -> Self {
        let (outbound, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);
        let inbound = Arc::new(InboundSlot::new());

        let task = tokio::spawn(supervise(config, rx, inbound.clone(), state_tx, cancel));
        Self {
            outbound,
            inbound,
            state,
            task,
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn supervise(
    config: WsClientConfig,
    mut outbound: mpsc::Receiver<Bytes>,
    inbound: Arc<InboundSlot>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
) {
    let peer = Peer {
        channel: CHANNEL,
        id: config.url.clone(),
        inbound,
    };
    let mut pending: Option<Bytes> = None;

    while !cancel.is_cancelled() {
        state.send_replace(ConnectionState::Connecting);
        let dialed = tokio::select! {
            _ = cancel.cancelled() => break,
            dialed = tokio_tungstenite::connect_async(config.url.as_str()) => dialed,
        };

        match dialed {
            Ok((socket, _response)) => {
                tracing::info!(url = %config.url, "已连接远程 WebSocket");
                state.send_replace(ConnectionState::Connected);
                let end = run_connection(
                    socket,
                    &mut outbound,
                    &mut pending,
                    &peer,
                    config.heartbeat,
                    &cancel,
                )
                .await;
                match end {
                    ConnectionEnd::Cancelled => break,
                    ConnectionEnd::QueueClosed => {
                        tracing::info!(url = %config.url, "出站队列已关闭，停止重连");
                        break;
                    }
                    ConnectionEnd::Closed => {
                        state.send_replace(ConnectionState::Closing);
                        tracing::info!(url = %config.url, "远程 WebSocket 已关闭连接");
                    }
                    ConnectionEnd::Failed(reason) => {
                        state.send_replace(ConnectionState::Errored);
                        tracing::warn!(url = %config.url, reason = %reason, "WebSocket 连接异常断开");
                    }
                }
            }
            Err(err) => {
                state.send_replace(ConnectionState::Errored);
                tracing::warn!(url = %config.url, error = %err, "连接远程 WebSocket 失败");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.backoff) => {}
        }
    }

    state.send_replace(ConnectionState::Closing);
    if pending.is_some() || !outbound.is_empty() {
        tracing::warn!(url = %config.url, queued = outbound.len() + usize::from(pending.is_some()), "转发器停止，丢弃未发送的消息");
    }
    state.send_replace(ConnectionState::Closed);
}

#[async_trait]
impl Redirector for WsClientRedirector {
    fn name(&self) -> &str {
        CHANNEL
    }

    async fn send_message(&self, payload: Bytes) -> Result<(), RedirectError> {
        self.outbound.try_send(payload).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => RedirectError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => RedirectError::Closed,
        })
    }

    fn on_receive(&self, sink: Arc<dyn InboundSink>) {
        self.inbound.set(sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_fails_fast_after_cancellation() {
        let cancel = CancellationToken::new();
        let mut config = WsClientConfig::new("ws://127.0.0.1:9/unreachable");
        config.backoff = Duration::from_millis(10);
        let client = WsClientRedirector::spawn(config, cancel.clone());

        cancel.cancel();
        let mut state = client.state();
        state
            .wait_for(|s| *s == ConnectionState::Closed)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !client.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            client.send_message(Bytes::from_static(b"late")).await,
            Err(RedirectError::Closed)
        );
    }

    #[tokio::test]
    async fn full_queue_is_reported() {
        let cancel = CancellationToken::new();
        let mut config = WsClientConfig::new("ws://127.0.0.1:9/unreachable");
        config.queue_capacity = 1;
        config.backoff = Duration::from_secs(60);
        let client = WsClientRedirector::spawn(config, cancel.clone());

        client.send_message(Bytes::from_static(b"1")).await.unwrap();
        assert_eq!(
            client.send_message(Bytes::from_static(b"2")).await,
            Err(RedirectError::QueueFull)
        );
        cancel.cancel();
    }
}
