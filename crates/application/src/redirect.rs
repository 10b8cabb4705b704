//! 转发器抽象
//!
//! 每个转发器负责自己的传输层重试和存活检测；中枢只做一次投递尝试。

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::error::ApplicationError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RedirectError {
    #[error("redirector closed")]
    Closed,
    #[error("redirector queue full")]
    QueueFull,
    #[error("transport error: {0}")]
    Transport(String),
}

impl RedirectError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }
}

/// 入站负载的接收方
#[async_trait]
pub trait InboundSink: Send + Sync {
    /// `from` 是来源通道名，`id` 是通道内的对端标识（连接 ID 或认证用户名）
    async fn receive(&self, payload: Bytes, from: &str, id: &str) -> Result<(), ApplicationError>;
}

#[async_trait]
pub trait Redirector: Send + Sync {
    fn name(&self) -> &str;

    async fn send_message(&self, payload: Bytes) -> Result<(), RedirectError>;

    /// 注册入站回调；只出不进的实现可以忽略
    fn on_receive(&self, _sink: Arc<dyn InboundSink>) {}
}

/// 转发器内部保存入站回调的槽位
#[derive(Default)]
pub struct InboundSlot {
    sink: RwLock<Option<Arc<dyn InboundSink>>>,
}

impl InboundSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, sink: Arc<dyn InboundSink>) {
        if let Ok(mut slot) = self.sink.write() {
            *slot = Some(sink);
        }
    }

    pub fn get(&self) -> Option<Arc<dyn InboundSink>> {
        self.sink.read().ok().and_then(|slot| slot.clone())
    }

    /// 转交给已注册的回调；未注册时丢弃
    pub async fn deliver(&self, payload: Bytes, from: &str, id: &str) {
        let Some(sink) = self.get() else {
            tracing::debug!(from, id, "未注册入站回调，丢弃入站消息");
            return;
        };
        if let Err(err) = sink.receive(payload, from, id).await {
            tracing::warn!(from, id, error = %err, "处理入站消息失败");
        }
    }
}

/// 槽位本身也可以作为回调传给连接循环，未注册时静默丢弃
#[async_trait]
impl InboundSink for InboundSlot {
    async fn receive(&self, payload: Bytes, from: &str, id: &str) -> Result<(), ApplicationError> {
        match self.get() {
            Some(sink) => sink.receive(payload, from, id).await,
            None => {
                tracing::debug!(from, id, "未注册入站回调，丢弃入站消息");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

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
    async fn slot_forwards_once_registered() {
        let slot = InboundSlot::new();
        slot.deliver(Bytes::from_static(b"early"), "WS_CLIENT", "").await;

        let collect = Arc::new(Collect::default());
        slot.set(collect.clone());
        slot.receive(Bytes::from_static(b"late"), "BROKER", "alice")
            .await
            .unwrap();

        let seen = collect.0.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![(Bytes::from_static(b"late"), "BROKER".to_string(), "alice".to_string())]
        );
    }
}
