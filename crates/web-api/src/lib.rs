//! Web API 层。
//!
//! HTTP 控制面：健康检查、资源上传下载、发送消息、群成员查询。
//! 所有 JSON 响应都是 `{code, msg, data}` 信封。

mod auth;
mod error;
mod routes;
mod state;

pub use error::{ApiError, ApiResponse};
pub use routes::router;
pub use state::AppState;
