//! 入站控制指令路由
//!
//! 任何转发器收到的负载都交给这里解析。每个来源一条发送队列和一个后台任务，
//! 同一来源的指令按到达顺序执行，限流等待也不会阻塞转发器的读循环。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use domain::{Command, SendMessageCommand};
use tokio::sync::mpsc;

use crate::error::ApplicationError;
use crate::redirect::InboundSink;

use super::sender::OutboundSender;

const QUEUE_CAPACITY: usize = 256;

pub struct CommandRouter {
    sender: Arc<OutboundSender>,
    queues: Mutex<HashMap<String, mpsc::Sender<SendMessageCommand>>>,
}

impl CommandRouter {
    pub fn new(sender: Arc<OutboundSender>) -> Self {
        Self {
            sender,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// 取出来源对应的队列，不存在或后台任务已退出时重新创建
    fn queue(&self, from: &str) -> mpsc::Sender<SendMessageCommand> {
        let mut queues = match self.queues.lock() {
            Ok(queues) => queues,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(queue) = queues.get(from).filter(|queue| !queue.is_closed()) {
            return queue.clone();
        }
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(drain(self.sender.clone(), from.to_owned(), rx));
        queues.insert(from.to_owned(), tx.clone());
        tx
    }
}

async fn drain(
    sender: Arc<OutboundSender>,
    from: String,
    mut rx: mpsc::Receiver<SendMessageCommand>,
) {
    while let Some(command) = rx.recv().await {
        if let Err(err) = sender.send(&command).await {
            tracing::warn!(from = %from, gid = %command.gid, error = %err, "执行发送指令失败");
        }
    }
}

#[async_trait]
impl InboundSink for CommandRouter {
    async fn receive(&self, payload: Bytes, from: &str, id: &str) -> Result<(), ApplicationError> {
        let command = Command::parse(&payload)?;
        match command {
            Command::SendMessage(command) => {
                command.validate()?;
                tracing::info!(from, id, gid = %command.gid, kind = ?command.kind, "收到发送指令");
                // 队列满时在这里等待，背压传回转发器
                if self.queue(from).send(command).await.is_err() {
                    tracing::warn!(from, "发送队列已关闭，丢弃指令");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityDirectory, KvIdentityResolver};
    use crate::kv::memory::MemoryKvStore;
    use crate::platform::memory::{MemoryPlatform, PlatformCall};
    use crate::platform::PlatformGroup;
    use crate::rate_limiter::SendRateLimiter;
    use crate::resource::memory::MemoryResourceStore;
    use crate::resource::{ResourceError, ResourceFetcher};
    use crate::services::sender::SenderDependencies;
    use domain::RawIdentity;
    use std::time::Duration;

    struct NoFetch;

    #[async_trait]
    impl ResourceFetcher for NoFetch {
        async fn fetch(&self, url: &str) -> Result<Bytes, ResourceError> {
            Err(ResourceError::Fetch(url.to_owned()))
        }
    }

    async fn router() -> (CommandRouter, Arc<MemoryPlatform>, String) {
        let directory = Arc::new(KvIdentityResolver::new(
            Arc::new(MemoryKvStore::new()),
            Duration::from_secs(60),
        ));
        let group = RawIdentity::group("@@team", "team");
        let gid = directory.resolve(&group).await.unwrap().to_string();
        let platform = Arc::new(MemoryPlatform::new());
        platform.set_groups(vec![PlatformGroup::new(group, Vec::new())]);

        let sender = OutboundSender::new(SenderDependencies {
            platform: platform.clone(),
            directory,
            resources: Arc::new(MemoryResourceStore::new()),
            fetcher: Arc::new(NoFetch),
            limiter: Arc::new(SendRateLimiter::new(100.0, 10)),
        });
        (CommandRouter::new(Arc::new(sender)), platform, gid)
    }

    #[tokio::test]
    async fn send_command_reaches_the_platform() {
        let (router, platform, gid) = router().await;
        let payload = serde_json::json!({
            "command": "sendMessage",
            "param": {"gid": gid, "type": 1, "body": "hello"}
        });
        router
            .receive(Bytes::from(payload.to_string()), "WS_CLIENT", "")
            .await
            .unwrap();

        for _ in 0..100 {
            if !platform.calls().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            platform.calls(),
            vec![PlatformCall::Text {
                group: "@@team".into(),
                text: "hello".into()
            }]
        );
    }

    #[tokio::test]
    async fn commands_from_one_source_keep_their_order() {
        let (router, platform, gid) = router().await;
        for n in 0..20 {
            let payload = serde_json::json!({
                "command": "sendMessage",
                "param": {"gid": gid, "type": 1, "body": format!("m{n}")}
            });
            router
                .receive(Bytes::from(payload.to_string()), "BROKER", "alice")
                .await
                .unwrap();
        }

        for _ in 0..400 {
            if platform.calls().len() == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let texts: Vec<String> = platform
            .calls()
            .into_iter()
            .map(|call| match call {
                PlatformCall::Text { text, .. } => text,
                other => panic!("unexpected call {other:?}"),
            })
            .collect();
        let expected: Vec<String> = (0..20).map(|n| format!("m{n}")).collect();
        assert_eq!(texts, expected);
    }

    #[tokio::test]
    async fn malformed_payloads_are_rejected() {
        let (router, _, _) = router().await;
        let err = router
            .receive(Bytes::from_static(b"not json"), "BROKER", "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::Serialization(_)));

        let unknown_kind = br#"{"command":"sendMessage","param":{"gid":"g","type":9,"body":"x"}}"#;
        assert!(router
            .receive(Bytes::from_static(unknown_kind), "BROKER", "alice")
            .await
            .is_err());

        let empty_body = br#"{"command":"sendMessage","param":{"gid":"g","type":1,"body":""}}"#;
        let err = router
            .receive(Bytes::from_static(empty_body), "BROKER", "alice")
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }
}
