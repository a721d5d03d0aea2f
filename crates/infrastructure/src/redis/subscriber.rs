//! Redis 模式订阅者
//!
//! 每个事件族每个进程恰好一条长连接订阅。回调逐条投递，且每次
//! 调用都在独立任务中执行：单条消息处理再慢、再异常，都不能拖住
//! 或杀死订阅循环。连接断开按指数退避重连。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use redis::Client;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::redis::{RedisError, RedisResult};

/// 订阅回调
///
/// 实现方拿到频道名和原始负载，自行解析分发。
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, channel: String, payload: String);
}

/// Redis 模式订阅者
pub struct PatternSubscriber {
    client: Client,
    patterns: Vec<String>,
    shutdown_signal: Arc<AtomicBool>,
    reconnect_interval: Duration,
    max_reconnect_attempts: u32,
}

impl PatternSubscriber {
    /// 创建订阅者
    pub fn new(
        url: &str,
        patterns: &[&str],
        reconnect_interval: Duration,
        max_reconnect_attempts: u32,
    ) -> RedisResult<Self> {
        let client = Client::open(url).map_err(|e| RedisError::ConfigError {
            message: format!("创建 Redis 客户端失败: {}", e),
        })?;

        Ok(Self {
            client,
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            shutdown_signal: Arc::new(AtomicBool::new(false)),
            reconnect_interval,
            max_reconnect_attempts,
        })
    }

    /// 启动监听循环，返回后台任务句柄
    pub fn start(&self, handler: Arc<dyn EventHandler>) -> JoinHandle<()> {
        let client = self.client.clone();
        let patterns = self.patterns.clone();
        let shutdown_signal = Arc::clone(&self.shutdown_signal);
        let reconnect_interval = self.reconnect_interval;
        let max_reconnect_attempts = self.max_reconnect_attempts;

        tokio::spawn(async move {
            Self::listen_loop(
                client,
                patterns,
                handler,
                shutdown_signal,
                reconnect_interval,
                max_reconnect_attempts,
            )
            .await;
        })
    }

    /// 监听循环：断线按指数退避重连，达到最大次数后放弃
    async fn listen_loop(
        client: Client,
        patterns: Vec<String>,
        handler: Arc<dyn EventHandler>,
        shutdown_signal: Arc<AtomicBool>,
        reconnect_interval: Duration,
        max_reconnect_attempts: u32,
    ) {
        let mut retry_count = 0u32;

        while !shutdown_signal.load(Ordering::Relaxed) {
            match Self::subscribe_and_listen(&client, &patterns, &handler, &shutdown_signal).await {
                Ok(()) => {
                    info!(patterns = ?patterns, "订阅循环正常退出");
                    break;
                }
                Err(e) => {
                    error!(patterns = ?patterns, error = %e, "订阅循环错误");
                    retry_count += 1;

                    if retry_count >= max_reconnect_attempts {
                        error!(patterns = ?patterns, "连接失败，已达最大重试次数");
                        break;
                    }

                    let delay = reconnect_interval * 2u32.saturating_pow(retry_count - 1);
                    sleep(delay).await;
                }
            }
        }

        info!(patterns = ?patterns, "订阅者已停止");
    }

    /// 建立订阅并消费消息，直到出错或收到关闭信号
    async fn subscribe_and_listen(
        client: &Client,
        patterns: &[String],
        handler: &Arc<dyn EventHandler>,
        shutdown_signal: &Arc<AtomicBool>,
    ) -> RedisResult<()> {
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| RedisError::ConnectionError {
                message: format!("获取 PubSub 连接失败: {}", e),
            })?;

        for pattern in patterns {
            pubsub
                .psubscribe(pattern)
                .await
                .map_err(|e| RedisError::SubscribeError {
                    message: format!("订阅模式 {} 失败: {}", pattern, e),
                })?;
        }

        info!(patterns = ?patterns, "模式订阅已建立");

        loop {
            if shutdown_signal.load(Ordering::Relaxed) {
                return Ok(());
            }

            // 带超时轮询，避免关闭信号被无限阻塞吞掉
            match tokio::time::timeout(Duration::from_millis(1000), async {
                pubsub.on_message().next().await
            })
            .await
            {
                Ok(Some(msg)) => {
                    let channel = msg.get_channel_name().to_string();
                    let payload: String = match msg.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(channel, error = %e, "获取消息负载失败，消息丢弃");
                            continue;
                        }
                    };

                    debug!(channel, "收到订阅消息");

                    // 每条消息独立任务执行，故障与慢处理都被隔离在
                    // 本条消息之内，不会传播回订阅循环
                    let handler = Arc::clone(handler);
                    tokio::spawn(async move {
                        handler.handle(channel, payload).await;
                    });
                }
                Ok(None) => {
                    return Err(RedisError::SubscribeError {
                        message: "订阅流意外结束".to_string(),
                    });
                }
                Err(_) => {
                    // 超时，回到循环顶部检查关闭信号
                    continue;
                }
            }
        }
    }

    /// 优雅关闭：监听循环在下一个轮询点退出
    pub fn shutdown(&self) {
        info!("开始关闭 Redis 订阅者");
        self.shutdown_signal.store(true, Ordering::Relaxed);
    }

    /// 是否仍在运行
    pub fn is_running(&self) -> bool {
        !self.shutdown_signal.load(Ordering::Relaxed)
    }
}

impl Drop for PatternSubscriber {
    fn drop(&mut self) {
        self.shutdown_signal.store(true, Ordering::Relaxed);
    }
}
