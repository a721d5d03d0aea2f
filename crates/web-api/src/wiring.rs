//! 订阅接线
//!
//! 每个事件族在本进程恰好运行一条长订阅，把共享介质上的消息
//! 交给对应的注册表扇出。这是其他实例持有的连接能收到本实例
//! 广播的唯一通路。

use std::sync::Arc;
use std::time::Duration;

use application::{ChatHub, Hub};
use async_trait::async_trait;
use domain::{CHAT_PATTERNS, NOTIFICATION_PATTERNS};
use infrastructure::{EventHandler, PatternSubscriber, RedisResult};
use tokio::task::JoinHandle;
use tracing::info;

/// 通知族 → 用户级 Hub
struct HubFanIn {
    hub: Arc<Hub>,
}

#[async_trait]
impl EventHandler for HubFanIn {
    async fn handle(&self, channel: String, payload: String) {
        self.hub.dispatch(&channel, &payload).await;
    }
}

/// 聊天族 → 房间级 ChatHub
struct ChatHubFanIn {
    chat_hub: Arc<ChatHub>,
}

#[async_trait]
impl EventHandler for ChatHubFanIn {
    async fn handle(&self, channel: String, payload: String) {
        self.chat_hub.dispatch(&channel, &payload).await;
    }
}

/// 已接线的订阅者集合
pub struct RealtimeWiring {
    subscribers: Vec<PatternSubscriber>,
    tasks: Vec<JoinHandle<()>>,
}

impl RealtimeWiring {
    /// 建立两条模式订阅并启动监听循环
    pub fn start(
        redis_url: &str,
        redis_config: &config::RedisConfig,
        hub: Arc<Hub>,
        chat_hub: Arc<ChatHub>,
    ) -> RedisResult<Self> {
        let reconnect_interval = Duration::from_millis(redis_config.reconnect_interval_ms);
        let max_attempts = redis_config.max_reconnect_attempts;

        let notification_subscriber = PatternSubscriber::new(
            redis_url,
            NOTIFICATION_PATTERNS,
            reconnect_interval,
            max_attempts,
        )?;
        let chat_subscriber =
            PatternSubscriber::new(redis_url, CHAT_PATTERNS, reconnect_interval, max_attempts)?;

        let notification_task = notification_subscriber.start(Arc::new(HubFanIn { hub }));
        let chat_task = chat_subscriber.start(Arc::new(ChatHubFanIn { chat_hub }));

        info!("实时订阅接线完成");

        Ok(Self {
            subscribers: vec![notification_subscriber, chat_subscriber],
            tasks: vec![notification_task, chat_task],
        })
    }

    /// 关闭全部订阅并等待监听循环退出
    pub async fn shutdown(self) {
        for subscriber in &self.subscribers {
            subscriber.shutdown();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        info!("实时订阅已全部关闭");
    }
}
