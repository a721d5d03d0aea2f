//! WebSocket 单次票据
//!
//! 流式握手不复用长效令牌：客户端先经认证请求换取一张短 TTL、
//! 单次使用的随机票据，再把票据放进连接 URL。兑换是原子的
//! 读取-删除（GETDEL）——任何一次兑换成功后，同一票据的后续
//! 出示一律失败，即使仍在 TTL 内。单次使用是硬不变量。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use domain::UserId;
use rand::RngCore;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Redis 键前缀
const TICKET_KEY_PREFIX: &str = "ws_ticket:";
/// 票据随机材料长度（字节）
const TICKET_TOKEN_BYTES: usize = 32;

/// 一张已签发的票据
#[derive(Debug, Clone, serde::Serialize)]
pub struct Ticket {
    pub ticket: String,
    /// 剩余有效期（秒）
    pub ttl: u64,
}

/// 票据存储错误
#[derive(Debug, Error)]
pub enum TicketError {
    #[error("ticket store unavailable: {message}")]
    StoreUnavailable { message: String },
}

impl TicketError {
    fn unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }
}

/// 票据存储契约
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// 为用户签发一张新票据
    async fn issue(&self, user_id: UserId, ttl_seconds: u64) -> Result<Ticket, TicketError>;

    /// 原子兑换：第一次出示返回绑定的用户，之后永远返回 None
    async fn redeem(&self, token: &str) -> Result<Option<UserId>, TicketError>;
}

/// 生成 URL 安全的随机票据串
fn generate_token() -> String {
    let mut bytes = [0u8; TICKET_TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    data_encoding::BASE64URL_NOPAD.encode(&bytes)
}

fn ticket_key(token: &str) -> String {
    format!("{}{}", TICKET_KEY_PREFIX, token)
}

/// Redis 票据存储
#[derive(Clone)]
pub struct RedisTicketStore {
    conn: ConnectionManager,
}

impl RedisTicketStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(url: &str) -> Result<Self, TicketError> {
        let client = redis::Client::open(url)
            .map_err(|e| TicketError::unavailable(format!("创建 Redis 客户端失败: {}", e)))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| TicketError::unavailable(format!("连接 Redis 失败: {}", e)))?;

        info!("Redis 票据存储创建成功");
        Ok(Self { conn })
    }
}

#[async_trait]
impl TicketStore for RedisTicketStore {
    async fn issue(&self, user_id: UserId, ttl_seconds: u64) -> Result<Ticket, TicketError> {
        let token = generate_token();
        let mut conn = self.conn.clone();

        let _: () = redis::cmd("SET")
            .arg(ticket_key(&token))
            .arg(user_id.0)
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await
            .map_err(|e| TicketError::unavailable(format!("写入票据失败: {}", e)))?;

        debug!(user_id = %user_id, ttl_seconds, "票据已签发");
        Ok(Ticket {
            ticket: token,
            ttl: ttl_seconds,
        })
    }

    async fn redeem(&self, token: &str) -> Result<Option<UserId>, TicketError> {
        let mut conn = self.conn.clone();

        // GETDEL 保证读取与删除原子完成，重放竞争不可能两次通过认证
        let value: Option<String> = redis::cmd("GETDEL")
            .arg(ticket_key(token))
            .query_async(&mut conn)
            .await
            .map_err(|e| TicketError::unavailable(format!("兑换票据失败: {}", e)))?;

        Ok(value.and_then(|raw| raw.parse::<u64>().ok()).map(UserId))
    }
}

/// 内存票据存储（测试与无 Redis 的开发运行）
#[derive(Default)]
pub struct InMemoryTicketStore {
    entries: Mutex<HashMap<String, (UserId, DateTime<Utc>)>>,
}

impl InMemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TicketStore for InMemoryTicketStore {
    async fn issue(&self, user_id: UserId, ttl_seconds: u64) -> Result<Ticket, TicketError> {
        let token = generate_token();
        let expires_at = Utc::now() + ChronoDuration::seconds(ttl_seconds as i64);

        let mut entries = self.entries.lock().await;
        entries.insert(token.clone(), (user_id, expires_at));

        Ok(Ticket {
            ticket: token,
            ttl: ttl_seconds,
        })
    }

    async fn redeem(&self, token: &str) -> Result<Option<UserId>, TicketError> {
        let mut entries = self.entries.lock().await;

        // remove 即"读取并删除"，在同一把锁内完成
        match entries.remove(token) {
            Some((user_id, expires_at)) if expires_at > Utc::now() => Ok(Some(user_id)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ticket_is_single_use() {
        let store = InMemoryTicketStore::new();
        let ticket = store.issue(UserId(42), 60).await.unwrap();

        // 第一次兑换成功
        assert_eq!(store.redeem(&ticket.ticket).await.unwrap(), Some(UserId(42)));
        // 第二次一定失败，即使远在 TTL 内
        assert_eq!(store.redeem(&ticket.ticket).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_ticket_fails() {
        let store = InMemoryTicketStore::new();
        let ticket = store.issue(UserId(1), 0).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(store.redeem(&ticket.ticket).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_ticket_fails() {
        let store = InMemoryTicketStore::new();
        assert_eq!(store.redeem("never-issued").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_redeem_succeeds_exactly_once() {
        use std::sync::Arc;

        let store = Arc::new(InMemoryTicketStore::new());
        let ticket = store.issue(UserId(9), 60).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let token = ticket.ticket.clone();
            tasks.push(tokio::spawn(async move {
                store.redeem(&token).await.unwrap()
            }));
        }

        let mut successes = 0;
        for task in tasks {
            if task.await.unwrap().is_some() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn test_tokens_are_unique_and_urlsafe() {
        let store = InMemoryTicketStore::new();
        let a = store.issue(UserId(1), 60).await.unwrap();
        let b = store.issue(UserId(1), 60).await.unwrap();

        assert_ne!(a.ticket, b.ticket);
        assert!(a
            .ticket
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    // Redis 路径的单次使用语义依赖 GETDEL，需要真实实例验证
    #[tokio::test]
    async fn test_redis_ticket_single_use() {
        if std::env::var("REDIS_INTEGRATION_TEST").is_err() {
            return;
        }
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let store = RedisTicketStore::connect(&url).await.unwrap();

        let ticket = store.issue(UserId(7), 60).await.unwrap();
        assert_eq!(store.redeem(&ticket.ticket).await.unwrap(), Some(UserId(7)));
        assert_eq!(store.redeem(&ticket.ticket).await.unwrap(), None);
    }
}
