//! 主应用程序入口
//!
//! 组装实时层：进程内注册表、Redis pub/sub 桥、票据与令牌校验、
//! 限流器，然后启动 Axum 服务。REDIS_URL 未设置时退化为单实例
//! 模式（无跨实例扇出，票据与限流走内存实现）。

use std::sync::Arc;

use application::{ChatHub, Hub};
use config::AppConfig;
use infrastructure::{
    InMemoryBlacklist, InMemoryBlockList, InMemoryMembership, InMemoryMessageStore,
    InMemoryRateCounterStore, InMemoryTicketStore, InMemoryUserDirectory, Notifier,
    RateCounterStore, RateLimiter, RedisBlacklist, RedisRateCounterStore, RedisTicketStore,
    TicketStore, TokenVerifier,
};
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, RealtimeWiring};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let app_config = AppConfig::from_env_with_defaults();

    // 进程内注册表
    let hub = Arc::new(Hub::new());
    let chat_hub = Arc::new(ChatHub::new());

    // Redis 承载的共享介质；未配置时使用内存实现（单实例模式）
    let (notifier, tickets, blacklist, counters, wiring): (
        Option<Notifier>,
        Arc<dyn TicketStore>,
        Arc<dyn infrastructure::BlacklistStore>,
        Arc<dyn RateCounterStore>,
        Option<RealtimeWiring>,
    ) = match &app_config.redis.url {
        Some(url) => {
            let client = redis::Client::open(url.as_str())?;
            let conn = client.get_connection_manager().await?;

            let wiring = RealtimeWiring::start(
                url,
                &app_config.redis,
                Arc::clone(&hub),
                Arc::clone(&chat_hub),
            )?;

            (
                Some(Notifier::connect(url).await?),
                Arc::new(RedisTicketStore::new(conn.clone())),
                Arc::new(RedisBlacklist::new(conn.clone())),
                Arc::new(RedisRateCounterStore::new(conn)),
                Some(wiring),
            )
        }
        None => {
            tracing::warn!("REDIS_URL 未设置，以单实例模式启动（无跨实例扇出）");
            (
                None,
                Arc::new(InMemoryTicketStore::new()),
                Arc::new(InMemoryBlacklist::new()),
                Arc::new(InMemoryRateCounterStore::new()),
                None,
            )
        }
    };

    let token_verifier = Arc::new(TokenVerifier::new(&app_config.jwt, blacklist));
    let rate_limiter = Arc::new(RateLimiter::new(counters, app_config.rate_limit.enforce));

    // 关系型子系统经窄契约消费；这里装配内存实现
    let state = AppState {
        hub: Arc::clone(&hub),
        chat_hub: Arc::clone(&chat_hub),
        notifier,
        tickets,
        token_verifier,
        rate_limiter,
        messages: Arc::new(InMemoryMessageStore::new()),
        blocks: Arc::new(InMemoryBlockList::new()),
        membership: Arc::new(InMemoryMembership::permissive()),
        users: Arc::new(InMemoryUserDirectory::new()),
        ticket_ttl_seconds: app_config.ticket.ttl_seconds,
    };

    let app = router(state);
    let addr = format!("{}:{}", app_config.server.host, app_config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("实时层服务启动在 http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("收到关闭信号");
        })
        .await?;

    // 关闭顺序：先停订阅（不再有新扇出），再通知并释放注册表，
    // 每条连接都收到关闭帧后进程才退出
    if let Some(wiring) = wiring {
        wiring.shutdown().await;
    }
    chat_hub.shutdown().await;
    hub.shutdown().await;

    tracing::info!("实时层已退出");
    Ok(())
}
