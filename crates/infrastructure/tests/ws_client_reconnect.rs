use std::sync::{Arc, Mutex};
use std::time::Duration;

use application::{ApplicationError, InboundSink, Redirector};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use infrastructure::{ConnectionState, WsClientConfig, WsClientRedirector};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Collect(Mutex<Vec<(String, String)>>);

#[async_trait]
impl InboundSink for Collect {
    async fn receive(&self, payload: Bytes, from: &str, _id: &str) -> Result<(), ApplicationError> {
        self.0.lock().unwrap().push((
            String::from_utf8_lossy(&payload).into_owned(),
            from.to_owned(),
        ));
        Ok(())
    }
}

/// 远端：每条连接先问候一次，收到 "drop" 后主动断开
async fn remote(listener: TcpListener, received: mpsc::UnboundedSender<(usize, String)>) {
    let mut connection = 0;
    while let Ok((stream, _)) = listener.accept().await {
        connection += 1;
        let received = received.clone();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        tokio::spawn(async move {
            ws.send(Message::text(format!("hello-{connection}")))
                .await
                .unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Text(text) = message {
                    let text = text.as_str().to_owned();
                    let dropping = text == "drop";
                    received.send((connection, text)).unwrap();
                    if dropping {
                        let _ = ws.close(None).await;
                        break;
                    }
                }
            }
        });
    }
}

#[tokio::test]
async fn reconnects_and_resumes_in_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(remote(listener, tx));

    let cancel = CancellationToken::new();
    let mut config = WsClientConfig::new(format!("ws://{addr}"));
    config.backoff = Duration::from_millis(200);
    let client = WsClientRedirector::spawn(config, cancel.clone());
    let collect = Arc::new(Collect::default());
    client.on_receive(collect.clone());

    let mut state = client.state();
    state
        .wait_for(|s| *s == ConnectionState::Connected)
        .await
        .unwrap();

    client.send_message(Bytes::from_static(b"drop")).await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, (1, "drop".to_string()));

    let _ = tokio::time::timeout(
        Duration::from_secs(1),
        state.wait_for(|s| *s != ConnectionState::Connected),
    )
    .await;
    for n in 1..=3 {
        client
            .send_message(Bytes::from(format!("after-{n}")))
            .await
            .unwrap();
    }

    let mut resumed = Vec::new();
    while resumed.len() < 3 {
        let item = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("reconnect within backoff")
            .unwrap();
        resumed.push(item);
    }
    assert_eq!(
        resumed,
        vec![
            (2, "after-1".to_string()),
            (2, "after-2".to_string()),
            (2, "after-3".to_string()),
        ]
    );

    let greetings: Vec<_> = collect.0.lock().unwrap().clone();
    assert!(greetings.contains(&("hello-1".to_string(), "WS_CLIENT".to_string())));
    assert!(greetings.contains(&("hello-2".to_string(), "WS_CLIENT".to_string())));

    cancel.cancel();
    state
        .wait_for(|s| *s == ConnectionState::Closed)
        .await
        .unwrap();
}
