//! Redis 消息发布者
//!
//! 按事件族提供类型化的发布入口。发布相对调用方是 fire-and-forget：
//! 状态变更在发布前已经落库，共享介质不可达只会延迟实时推送，
//! 绝不影响已持久化状态的正确性。

use domain::{Channel, Envelope, EventKind, PresenceStatus, PresencePayload, RoomId, TypingPayload, UserId};
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::{debug, info, warn};

use crate::redis::{RedisError, RedisResult};

/// 输入中指示在客户端的有效期
const TYPING_EXPIRES_IN_MS: u64 = 5000;

/// Redis 发布者
#[derive(Clone)]
pub struct Notifier {
    conn: ConnectionManager,
}

impl Notifier {
    /// 连接到 Redis 并创建发布者
    ///
    /// ConnectionManager 自带断线重连，发布端不自己维护连接池。
    pub async fn connect(url: &str) -> RedisResult<Self> {
        let client = Client::open(url).map_err(|e| RedisError::ConfigError {
            message: format!("创建 Redis 客户端失败: {}", e),
        })?;

        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| RedisError::ConnectionError {
                message: format!("连接 Redis 失败: {}", e),
            })?;

        info!("Redis 发布者创建成功");
        Ok(Self { conn })
    }

    /// 发布原始负载到指定频道，返回订阅者数量
    pub async fn publish(&self, channel: &Channel, payload: &str) -> RedisResult<u32> {
        let name = channel.to_string();
        let mut conn = self.conn.clone();

        let subscriber_count: u32 = redis::cmd("PUBLISH")
            .arg(&name)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisError::PublishError {
                message: format!("发布到频道 {} 失败: {}", name, e),
            })?;

        debug!(channel = %name, subscriber_count, "消息已发布");
        Ok(subscriber_count)
    }

    /// 发布信封到指定频道
    pub async fn publish_envelope(&self, channel: &Channel, envelope: &Envelope) -> RedisResult<u32> {
        let payload = envelope.encode().map_err(|e| RedisError::SerializationError {
            message: e.to_string(),
        })?;
        self.publish(channel, &payload).await
    }

    /// 发布定向通知到用户频道
    pub async fn publish_user(&self, user_id: UserId, payload: &str) -> RedisResult<u32> {
        self.publish(&Channel::UserNotifications(user_id), payload).await
    }

    /// 发布全局广播
    pub async fn publish_broadcast(&self, payload: &str) -> RedisResult<u32> {
        self.publish(&Channel::Broadcast, payload).await
    }

    /// 发布聊天消息到房间频道
    pub async fn publish_room_message(&self, room_id: RoomId, envelope: &Envelope) -> RedisResult<u32> {
        self.publish_envelope(&Channel::RoomMessages(room_id), envelope).await
    }

    /// 发布输入中指示
    pub async fn publish_typing(
        &self,
        room_id: RoomId,
        user_id: UserId,
        username: &str,
        is_typing: bool,
    ) -> RedisResult<u32> {
        let payload = TypingPayload {
            user_id,
            username: username.to_string(),
            is_typing,
            expires_in_ms: TYPING_EXPIRES_IN_MS,
        };
        let envelope = Envelope::new(EventKind::Typing)
            .with_room(room_id)
            .with_user(user_id)
            .with_username(username)
            .with_payload(&payload)
            .map_err(|e| RedisError::SerializationError {
                message: e.to_string(),
            })?;

        self.publish_envelope(&Channel::Typing(room_id), &envelope).await
    }

    /// 发布用户在房间内的在线状态
    pub async fn publish_presence(
        &self,
        room_id: RoomId,
        user_id: UserId,
        username: &str,
        status: PresenceStatus,
    ) -> RedisResult<u32> {
        let payload = PresencePayload {
            user_id,
            username: username.to_string(),
            status,
        };
        let envelope = Envelope::new(EventKind::Presence)
            .with_room(room_id)
            .with_user(user_id)
            .with_username(username)
            .with_payload(&payload)
            .map_err(|e| RedisError::SerializationError {
                message: e.to_string(),
            })?;

        self.publish_envelope(&Channel::Presence(room_id), &envelope).await
    }

    /// fire-and-forget 发布：失败只记日志，不向调用方传播
    pub async fn publish_best_effort(&self, channel: &Channel, payload: &str) {
        if let Err(err) = self.publish(channel, payload).await {
            warn!(channel = %channel, error = %err, "发布失败，实时推送降级");
        }
    }

    /// 健康检查
    pub async fn ping(&self) -> RedisResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisError::ConnectionError {
                message: e.to_string(),
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis_url() -> Option<String> {
        std::env::var("REDIS_INTEGRATION_TEST").ok()?;
        Some(std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()))
    }

    #[tokio::test]
    async fn test_publisher_creation() {
        // 注意：这个测试需要运行 Redis 实例才能通过
        if let Some(url) = redis_url() {
            let notifier = Notifier::connect(&url).await;
            assert!(notifier.is_ok());
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        if let Some(url) = redis_url() {
            let notifier = Notifier::connect(&url).await.unwrap();
            let count = notifier
                .publish_user(UserId(1), r#"{"type":"message","payload":null}"#)
                .await
                .unwrap();
            assert_eq!(count, 0);
        }
    }

    #[tokio::test]
    async fn test_typing_envelope_shape() {
        if let Some(url) = redis_url() {
            let notifier = Notifier::connect(&url).await.unwrap();
            let result = notifier
                .publish_typing(RoomId(7), UserId(3), "ada", true)
                .await;
            assert!(result.is_ok());
        }
    }
}
