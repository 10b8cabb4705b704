//! 中枢进程入口
//!
//! 加载配置，连接外部依赖，组装身份解析、成员对账、消息中枢、转发器和出站发送，
//! 然后启动控制面 HTTP 服务和成员对账定时任务，直到收到停止信号。

mod platform;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use application::{
    ChatPlatform, Clock, CommandRouter, CredentialCheck, DedupGate, HubDependencies,
    IdentityDirectory, InboundSink, KvIdentityResolver, MessageHub, OutboundSender, Redirector,
    RosterReconciler, SendRateLimiter, SenderDependencies, SystemClock, WatchOutcome,
};
use config::AppConfig;
use infrastructure::{
    AllowAll, BrokerConfig, BrokerRedirector, ConnectAuthHook, CredentialAuthHook, EmbeddedBroker,
    Infrastructure, InfrastructureConfig, WsClientConfig, WsClientRedirector, WsServerConfig,
    WsServerRedirector,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState};

use crate::platform::DetachedPlatform;

const EVENT_QUEUE_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = AppConfig::load().context("加载配置失败")?;
    tracing::info!(config = %config.sanitized(), "配置已加载");

    let infra = Infrastructure::connect(InfrastructureConfig {
        database_url: config.database.url.clone(),
        max_connections: config.database.max_connections,
        redis_url: config.redis.url.clone(),
        bcrypt_cost: config.auth.bcrypt_cost,
        resource_root: config.storage.files_dir(),
    })
    .await
    .context("连接外部依赖失败")?;

    let credentials: Option<Arc<dyn CredentialCheck>> = match config.auth.account() {
        Some((username, password)) => {
            infra.credentials.ensure_user(username, password).await?;
            tracing::info!(username, "已启用账号认证");
            Some(infra.credentials.clone() as Arc<dyn CredentialCheck>)
        }
        None => {
            tracing::warn!("未配置账号，控制面和转发器不做认证");
            None
        }
    };

    let cancel = CancellationToken::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let platform: Arc<dyn ChatPlatform> = Arc::new(DetachedPlatform);
    let directory: Arc<dyn IdentityDirectory> = Arc::new(KvIdentityResolver::new(
        infra.kv.clone(),
        config.identity.key_ttl(),
    ));

    let roster = Arc::new(RosterReconciler::new(
        directory.clone(),
        infra.memberships.clone(),
        clock.clone(),
    ));
    let dedup = Arc::new(DedupGate::new(
        infra.kv.clone(),
        config.dedup.cache_capacity,
        Some(config.dedup.ttl()),
    ));
    let hub = MessageHub::new(HubDependencies {
        directory: directory.clone(),
        roster,
        dedup,
        message_log: infra.message_log.clone(),
        resources: infra.resources.clone(),
        platform: platform.clone(),
        clock,
    });

    let sender = Arc::new(OutboundSender::new(SenderDependencies {
        platform: platform.clone(),
        directory,
        resources: infra.resources.clone(),
        fetcher: infra.fetcher.clone(),
        limiter: Arc::new(SendRateLimiter::new(
            config.sender.rate_per_second,
            config.sender.burst,
        )),
    }));
    let commands: Arc<dyn InboundSink> = Arc::new(CommandRouter::new(sender.clone()));

    let mut servers: Vec<JoinHandle<()>> = Vec::new();
    start_redirectors(&config, &hub, &commands, credentials.clone(), &cancel, &mut servers).await?;

    // 控制面
    let mut state = AppState::new(
        sender,
        platform,
        infra.memberships.clone(),
        infra.resources.clone(),
    )
    .with_max_upload_size(config.server.max_upload_size);
    if let Some(credentials) = credentials {
        state = state.with_credentials(credentials);
    }
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("绑定控制面地址 {addr} 失败"))?;
    tracing::info!(addr = %addr, "控制面服务已启动");
    let api = router(state);
    let api_cancel = cancel.clone();
    servers.push(tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, api)
            .with_graceful_shutdown(async move { api_cancel.cancelled_owned().await })
            .await
        {
            tracing::error!(error = %err, "控制面服务异常退出");
        }
    }));

    // 平台会话接入后由会话推送事件
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let hub_task = {
        let hub = hub.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { hub.run(event_rx, cancel).await })
    };

    // 成员对账：白天密、夜间疏
    let mut scheduler = JobScheduler::new().await?;
    for cron in [&config.roster.day_cron, &config.roster.night_cron] {
        let hub = hub.clone();
        scheduler
            .add(Job::new_async(cron.as_str(), move |_uuid, _l| {
                let hub = hub.clone();
                Box::pin(async move {
                    match hub.watch_members().await {
                        Ok(WatchOutcome::Completed { groups, departures }) => {
                            tracing::debug!(groups, departures, "成员对账完成");
                        }
                        Ok(WatchOutcome::Skipped) => {}
                        Err(err) => tracing::warn!(error = %err, "成员对账失败"),
                    }
                })
            })?)
            .await?;
    }
    scheduler.start().await?;
    tracing::info!(
        day = %config.roster.day_cron,
        night = %config.roster.night_cron,
        "成员对账定时任务已设置"
    );

    // 等待关闭信号
    let mut sig_term = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("接收到 Ctrl+C 信号，开始优雅停机...");
        }
        _ = sig_term.recv() => {
            tracing::info!("接收到终止信号，开始优雅停机...");
        }
    }

    cancel.cancel();
    drop(event_tx);
    scheduler.shutdown().await?;
    let _ = hub_task.await;
    for server in servers {
        let _ = server.await;
    }
    tracing::info!("中枢已停止");
    Ok(())
}

/// 按配置创建转发器，注册到中枢并把入站负载交给指令路由
async fn start_redirectors(
    config: &AppConfig,
    hub: &MessageHub,
    commands: &Arc<dyn InboundSink>,
    credentials: Option<Arc<dyn CredentialCheck>>,
    cancel: &CancellationToken,
    servers: &mut Vec<JoinHandle<()>>,
) -> anyhow::Result<()> {
    if let Some(section) = &config.redirect.ws_client {
        let mut client = WsClientConfig::new(section.url.clone());
        client.heartbeat = Duration::from_secs(section.heartbeat_secs);
        client.backoff = Duration::from_secs(section.backoff_secs);
        let redirector = Arc::new(WsClientRedirector::spawn(client, cancel.clone()));
        register(hub, redirector, commands);
    }

    if let Some(section) = &config.redirect.ws_server {
        let server = WsServerRedirector::spawn(
            WsServerConfig {
                heartbeat: Duration::from_secs(section.heartbeat_secs),
                ..WsServerConfig::default()
            },
            credentials.clone(),
            cancel.clone(),
        );
        let addr = format!("{}:{}", section.host, section.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("绑定 WebSocket 服务地址 {addr} 失败"))?;
        let serving = server.clone();
        servers.push(tokio::spawn(async move {
            if let Err(err) = serving.serve(listener).await {
                tracing::error!(error = %err, "WebSocket 广播服务异常退出");
            }
        }));
        register(hub, Arc::new(server), commands);
    }

    if let Some(section) = &config.redirect.broker {
        let auth: Arc<dyn ConnectAuthHook> = match credentials {
            Some(check) => Arc::new(CredentialAuthHook::new(check)),
            None => Arc::new(AllowAll),
        };
        let broker = EmbeddedBroker::new(
            BrokerConfig {
                retain: section.retain,
                ..BrokerConfig::default()
            },
            auth,
            cancel.clone(),
        );
        let addr = format!("{}:{}", section.host, section.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("绑定代理地址 {addr} 失败"))?;
        let serving = broker.clone();
        servers.push(tokio::spawn(async move {
            if let Err(err) = serving.serve(listener).await {
                tracing::error!(error = %err, "发布订阅代理异常退出");
            }
        }));
        let command_topic =
            (!section.command_topic.is_empty()).then(|| section.command_topic.clone());
        let redirector = Arc::new(BrokerRedirector::new(
            broker,
            section.publish_topic.clone(),
            command_topic,
        ));
        register(hub, redirector, commands);
    }

    if hub.redirectors().is_empty() {
        tracing::warn!("未配置任何转发器，消息只会入库");
    }
    Ok(())
}

fn register(hub: &MessageHub, redirector: Arc<dyn Redirector>, commands: &Arc<dyn InboundSink>) {
    redirector.on_receive(commands.clone());
    hub.register(redirector);
}
