//! 广播 WebSocket 服务端转发器
//!
//! 连接通过注册通道加入，由唯一的扇出循环持有连接表并写入每条连接的队列；
//! 某条连接写入失败只会注销并关闭它自己。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use application::{CredentialCheck, InboundSink, InboundSlot, RedirectError, Redirector};
use async_trait::async_trait;
use axum::{
    extract::{ws::WebSocket, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::connection::{run_connection, ConnectionEnd, ConnectionState, Peer, MIN_HEARTBEAT};
use super::ConnectParams;

pub const CHANNEL: &str = "WS_SERVER";

#[derive(Debug, Clone)]
pub struct WsServerConfig {
    pub heartbeat: Duration,
    /// 出站总队列长度
    pub queue_capacity: usize,
    /// 每条连接的发送队列长度，写满即视为该连接失效
    pub connection_capacity: usize,
}

impl Default for WsServerConfig {
    fn default() -> Self {
        Self {
            heartbeat: MIN_HEARTBEAT,
            queue_capacity: 1024,
            connection_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub peer: String,
    pub state: ConnectionState,
}

struct Registration {
    id: Uuid,
    peer: String,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    state: watch::Receiver<ConnectionState>,
}

type ConnectionTable = RwLock<HashMap<Uuid, (String, watch::Receiver<ConnectionState>)>>;

struct ServerShared {
    outbound: mpsc::Sender<Bytes>,
    register: mpsc::Sender<Registration>,
    unregister: mpsc::Sender<Uuid>,
    inbound: Arc<InboundSlot>,
    auth: Option<Arc<dyn CredentialCheck>>,
    /// 只由扇出循环写入的快照
    connections: Arc<ConnectionTable>,
    config: WsServerConfig,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct WsServerRedirector {
    shared: Arc<ServerShared>,
}

impl WsServerRedirector {
    /// 启动扇出循环；`auth` 为 `None` 时不校验连接
    pub fn spawn(
        config: WsServerConfig,
        auth: Option<Arc<dyn CredentialCheck>>,
        cancel: CancellationToken,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (register, register_rx) = mpsc::channel(16);
        let (unregister, unregister_rx) = mpsc::channel(16);
        let connections = Arc::new(ConnectionTable::default());

        tokio::spawn(fan_out(
            outbound_rx,
            register_rx,
            unregister_rx,
            connections.clone(),
            cancel.clone(),
        ));

        Self {
            shared: Arc::new(ServerShared {
                outbound,
                register,
                unregister,
                inbound: Arc::new(InboundSlot::new()),
                auth,
                connections,
                config,
                cancel,
            }),
        }
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let Ok(table) = self.shared.connections.read() else {
            return Vec::new();
        };
        table
            .iter()
            .map(|(id, (peer, state))| ConnectionInfo {
                id: *id,
                peer: peer.clone(),
                state: *state.borrow(),
            })
            .collect()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(upgrade))
            .with_state(self.shared.clone())
    }

    /// 在 `listener` 上提供服务，取消后优雅退出
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "WebSocket 广播服务已启动");
        }
        let cancel = self.shared.cancel.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { cancel.cancelled_owned().await })
            .await
    }
}

async fn fan_out(
    mut outbound: mpsc::Receiver<Bytes>,
    mut register: mpsc::Receiver<Registration>,
    mut unregister: mpsc::Receiver<Uuid>,
    snapshot: Arc<ConnectionTable>,
    cancel: CancellationToken,
) {
    let mut connections: HashMap<Uuid, Registration> = HashMap::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(registration) = register.recv() => {
                tracing::info!(conn_id = %registration.id, peer = %registration.peer, "WebSocket 连接已注册");
                connections.insert(registration.id, registration);
            }
            Some(id) = unregister.recv() => {
                if connections.remove(&id).is_some() {
                    tracing::info!(conn_id = %id, "WebSocket 连接已注销");
                }
            }
            payload = outbound.recv() => {
                let Some(payload) = payload else { break };
                connections.retain(|id, conn| match conn.tx.try_send(payload.clone()) {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::warn!(conn_id = %id, peer = %conn.peer, error = %err, "写入连接失败，关闭该连接");
                        conn.cancel.cancel();
                        false
                    }
                });
            }
        }

        if let Ok(mut table) = snapshot.write() {
            *table = connections
                .values()
                .map(|conn| (conn.id, (conn.peer.clone(), conn.state.clone())))
                .collect();
        }
    }

    for conn in connections.values() {
        conn.cancel.cancel();
    }
    if let Ok(mut table) = snapshot.write() {
        table.clear();
    }
}

async fn upgrade(
    State(shared): State<Arc<ServerShared>>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    if shared.cancel.is_cancelled() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if let Some(auth) = &shared.auth {
        if !auth.check_user(&params.username, &params.password).await {
            tracing::warn!(username = %params.username, "WebSocket 连接认证失败");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    ws.on_upgrade(move |socket| serve_connection(shared, socket, params.username))
}

async fn serve_connection(shared: Arc<ServerShared>, socket: WebSocket, username: String) {
    let id = Uuid::new_v4();
    let peer_id = if username.is_empty() {
        id.to_string()
    } else {
        username
    };
    let (tx, mut rx) = mpsc::channel(shared.config.connection_capacity.max(1));
    let cancel = shared.cancel.child_token();
    let (state_tx, state) = watch::channel(ConnectionState::Connected);

    let registration = Registration {
        id,
        peer: peer_id.clone(),
        tx,
        cancel: cancel.clone(),
        state,
    };
    if shared.register.send(registration).await.is_err() {
        tracing::warn!(conn_id = %id, "广播服务已停止，拒绝连接");
        return;
    }

    let peer = Peer {
        channel: CHANNEL,
        id: peer_id,
        inbound: shared.inbound.clone(),
    };
    let mut pending = None;
    let end = run_connection(
        socket,
        &mut rx,
        &mut pending,
        &peer,
        shared.config.heartbeat,
        &cancel,
    )
    .await;

    match &end {
        ConnectionEnd::Failed(reason) => {
            state_tx.send_replace(ConnectionState::Errored);
            tracing::warn!(conn_id = %id, reason = %reason, "WebSocket 连接异常断开");
        }
        _ => {
            state_tx.send_replace(ConnectionState::Closing);
            tracing::debug!(conn_id = %id, end = ?end, "WebSocket 连接结束");
        }
    }
    let _ = shared.unregister.send(id).await;
    state_tx.send_replace(ConnectionState::Closed);
}

#[async_trait]
impl Redirector for WsServerRedirector {
    fn name(&self) -> &str {
        CHANNEL
    }

    async fn send_message(&self, payload: Bytes) -> Result<(), RedirectError> {
        self.shared.outbound.try_send(payload).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => RedirectError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => RedirectError::Closed,
        })
    }

    fn on_receive(&self, sink: Arc<dyn InboundSink>) {
        self.shared.inbound.set(sink);
    }
}
