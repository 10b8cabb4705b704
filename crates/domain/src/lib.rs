//! 消息中枢核心领域模型
//!
//! 包含稳定身份、群成员关系、标准化消息、控制指令等核心类型，
//! 以及引用/@提及/改群名等文本规则。本 crate 不做任何 I/O。

pub mod command;
pub mod errors;
pub mod identity;
pub mod membership;
pub mod message;
pub mod text_rules;

// 重新导出常用类型
pub use command::*;
pub use errors::*;
pub use identity::*;
pub use membership::*;
pub use message::*;
