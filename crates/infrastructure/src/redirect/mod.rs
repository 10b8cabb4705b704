//! 转发器实现：WebSocket 客户端、广播服务端、内嵌 MQTT 代理

pub mod broker;
pub mod client;
mod connection;
mod mqtt;
pub mod server;

use serde::Deserialize;

pub use broker::{
    AllowAll, BrokerConfig, BrokerRedirector, ConnectAuthHook, CredentialAuthHook, EmbeddedBroker,
    Origin, Publication,
};
pub use client::{WsClientConfig, WsClientRedirector};
pub use connection::{heartbeat_interval, ConnectionState, MIN_HEARTBEAT};
pub use server::{ConnectionInfo, WsServerConfig, WsServerRedirector};

/// 升级请求里携带的账号
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ConnectParams {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}
