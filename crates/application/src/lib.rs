//! 应用层实现。
//!
//! 这里定义中枢依赖的端口（键值存储、平台、资源、凭证、转发器），
//! 以及围绕领域模型的用例服务：身份解析、成员对账、消息分发和出站发送。

pub mod clock;
pub mod credential;
pub mod dedup;
pub mod error;
pub mod identity;
pub mod kv;
pub mod platform;
pub mod rate_limiter;
pub mod redirect;
pub mod repository;
pub mod resource;
pub mod services;

pub use clock::{Clock, SystemClock};
pub use credential::CredentialCheck;
pub use dedup::{Admission, DedupGate, DEFAULT_CACHE_CAPACITY};
pub use error::ApplicationError;
pub use identity::{IdentityDirectory, KvIdentityResolver};
pub use kv::{KvError, KvStore};
pub use platform::{ChatPlatform, PlatformError, PlatformEvent, PlatformGroup, SentMessage};
pub use rate_limiter::{SendRateLimiter, Throttle};
pub use redirect::{InboundSink, InboundSlot, RedirectError, Redirector};
pub use repository::{MembershipRepository, MessageLog};
pub use resource::{ResourceError, ResourceFetcher, ResourceStore};
pub use services::{
    CommandRouter, DispatchReport, HandleOutcome, HubDependencies, MessageHub, OutboundSender,
    RosterReconciler, SenderDependencies, WatchOutcome, BASE64_PREFIX, RESOURCE_PREFIX,
};
