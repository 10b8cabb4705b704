//! 基础设施层实现。
//!
//! 提供 Redis 键值存储、Postgres 仓储、本地资源存储、远程下载和三种转发器，
//! 实现应用层定义的接口。

pub mod builder;
pub mod fetch;
pub mod kv;
pub mod migrations;
pub mod password;
pub mod redirect;
pub mod repository;
pub mod storage;

pub use builder::{Infrastructure, InfrastructureConfig, InfrastructureError};
pub use fetch::HttpResourceFetcher;
pub use kv::RedisKvStore;
pub use migrations::MIGRATOR;
pub use password::PgCredentialStore;
pub use redirect::{
    AllowAll, BrokerConfig, BrokerRedirector, ConnectAuthHook, ConnectionInfo, ConnectionState,
    CredentialAuthHook, EmbeddedBroker, Origin, Publication, WsClientConfig, WsClientRedirector,
    WsServerConfig, WsServerRedirector,
};
pub use repository::{create_pg_pool, PgMembershipRepository, PgMessageLog};
pub use storage::LocalResourceStore;
