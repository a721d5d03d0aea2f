//! 跨实例限流
//!
//! 计数键 `rl:<resource>:<identity>`，窗口内首次自增时设置过期。
//! 自增与设过期必须是同一个原子步骤：拆成 INCR 再 EXPIRE 两次
//! 往返的实现，在两步之间崩溃或竞争时会留下一个永不过期的计数，
//! 把该身份永久限死——这是正确性要求，不是风格偏好。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// 共享存储不可达时的策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPolicy {
    /// 放行请求（普通流量默认）
    FailOpen,
    /// 拒绝请求并返回服务不可用信号（敏感操作）
    FailClosed,
}

/// 限流判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited,
    /// 仅 FailClosed 下出现：存储不可达，调用方应答 503
    StoreUnavailable,
}

/// 限流存储错误
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit store unavailable: {message}")]
    StoreUnavailable { message: String },
}

/// 限流计数存储
///
/// `incr_with_window` 自增计数并在本窗口首次自增时设置过期，
/// 两者在实现中必须不可分割。返回自增后的计数值。
#[async_trait]
pub trait RateCounterStore: Send + Sync {
    async fn incr_with_window(&self, key: &str, window: Duration) -> Result<u64, RateLimitError>;
}

/// Redis 计数存储
///
/// INCR 与首次 PEXPIRE 放在同一段 Lua 里执行，服务端原子完成。
#[derive(Clone)]
pub struct RedisRateCounterStore {
    conn: ConnectionManager,
    script: Arc<Script>,
}

const INCR_WITH_WINDOW_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

impl RedisRateCounterStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            script: Arc::new(Script::new(INCR_WITH_WINDOW_SCRIPT)),
        }
    }
}

#[async_trait]
impl RateCounterStore for RedisRateCounterStore {
    async fn incr_with_window(&self, key: &str, window: Duration) -> Result<u64, RateLimitError> {
        let mut conn = self.conn.clone();

        self.script
            .key(key)
            .arg(window.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RateLimitError::StoreUnavailable {
                message: e.to_string(),
            })
    }
}

/// 内存计数存储（测试与无 Redis 的开发运行）
///
/// 自增与窗口判定在同一把锁内完成，保持与 Redis 路径相同的原子性。
#[derive(Default)]
pub struct InMemoryRateCounterStore {
    counters: Mutex<HashMap<String, (u64, Instant)>>,
}

impl InMemoryRateCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateCounterStore for InMemoryRateCounterStore {
    async fn incr_with_window(&self, key: &str, window: Duration) -> Result<u64, RateLimitError> {
        let mut counters = self.counters.lock().await;
        let now = Instant::now();

        let entry = counters.entry(key.to_string()).or_insert((0, now + window));
        if entry.1 <= now {
            // 窗口已过，重开
            *entry = (0, now + window);
        }
        entry.0 += 1;
        Ok(entry.0)
    }
}

/// 限流器
///
/// `enforce` 为 false（test / development / stress 环境的显式开关）
/// 时所有检查无条件放行。
pub struct RateLimiter {
    store: Arc<dyn RateCounterStore>,
    enforce: bool,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateCounterStore>, enforce: bool) -> Self {
        Self { store, enforce }
    }

    /// 检查 (resource, identity) 在窗口内是否超过 limit
    pub async fn check(
        &self,
        resource: &str,
        identity: &str,
        limit: u64,
        window: Duration,
        policy: FailPolicy,
    ) -> RateDecision {
        if !self.enforce {
            return RateDecision::Allowed;
        }

        let key = format!("rl:{}:{}", resource, identity);

        match self.store.incr_with_window(&key, window).await {
            Ok(count) if count > limit => {
                debug!(key, count, limit, "请求被限流");
                RateDecision::Limited
            }
            Ok(_) => RateDecision::Allowed,
            Err(err) => match policy {
                FailPolicy::FailOpen => {
                    warn!(key, error = %err, "限流存储不可达，按 fail-open 放行");
                    RateDecision::Allowed
                }
                FailPolicy::FailClosed => {
                    warn!(key, error = %err, "限流存储不可达，按 fail-closed 拒绝");
                    RateDecision::StoreUnavailable
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 永远失败的存储，用于验证失败策略
    struct BrokenStore;

    #[async_trait]
    impl RateCounterStore for BrokenStore {
        async fn incr_with_window(&self, _key: &str, _window: Duration) -> Result<u64, RateLimitError> {
            Err(RateLimitError::StoreUnavailable {
                message: "connection refused".to_string(),
            })
        }
    }

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(InMemoryRateCounterStore::new()), true)
    }

    #[tokio::test]
    async fn test_nth_request_is_first_rejected() {
        let limiter = limiter();
        let window = Duration::from_secs(60);

        // 前 limit 条放行
        for i in 0..5 {
            let decision = limiter
                .check("send_chat", "user:1", 5, window, FailPolicy::FailOpen)
                .await;
            assert_eq!(decision, RateDecision::Allowed, "request {} should pass", i + 1);
        }

        // 第 limit+1 条是第一条被拒的
        let decision = limiter
            .check("send_chat", "user:1", 5, window, FailPolicy::FailOpen)
            .await;
        assert_eq!(decision, RateDecision::Limited);
    }

    #[tokio::test]
    async fn test_keys_are_isolated_by_resource_and_identity() {
        let limiter = limiter();
        let window = Duration::from_secs(60);

        for _ in 0..3 {
            limiter
                .check("typing", "user:1", 3, window, FailPolicy::FailOpen)
                .await;
        }
        assert_eq!(
            limiter
                .check("typing", "user:1", 3, window, FailPolicy::FailOpen)
                .await,
            RateDecision::Limited
        );

        // 其他身份和其他资源不受影响
        assert_eq!(
            limiter
                .check("typing", "user:2", 3, window, FailPolicy::FailOpen)
                .await,
            RateDecision::Allowed
        );
        assert_eq!(
            limiter
                .check("send_chat", "user:1", 3, window, FailPolicy::FailOpen)
                .await,
            RateDecision::Allowed
        );
    }

    #[tokio::test]
    async fn test_counter_resets_after_window() {
        let limiter = limiter();
        let window = Duration::from_millis(50);

        limiter
            .check("typing", "user:1", 1, window, FailPolicy::FailOpen)
            .await;
        assert_eq!(
            limiter
                .check("typing", "user:1", 1, window, FailPolicy::FailOpen)
                .await,
            RateDecision::Limited
        );

        tokio::time::sleep(Duration::from_millis(80)).await;

        // 无论窗口内发生过多少次自增，窗口过后计数重置
        assert_eq!(
            limiter
                .check("typing", "user:1", 1, window, FailPolicy::FailOpen)
                .await,
            RateDecision::Allowed
        );
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_atomic() {
        let store = Arc::new(InMemoryRateCounterStore::new());
        let window = Duration::from_secs(60);

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store.incr_with_window("rl:burst:user:1", window).await.unwrap()
            }));
        }

        let mut counts = Vec::new();
        for task in tasks {
            counts.push(task.await.unwrap());
        }
        counts.sort_unstable();

        // 每个并发自增拿到一个不同的计数值，恰好覆盖 1..=50
        assert_eq!(counts, (1..=50).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_fail_open_allows_on_store_outage() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore), true);
        let decision = limiter
            .check("send_chat", "user:1", 5, Duration::from_secs(60), FailPolicy::FailOpen)
            .await;
        assert_eq!(decision, RateDecision::Allowed);
    }

    #[tokio::test]
    async fn test_fail_closed_rejects_on_store_outage() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore), true);
        let decision = limiter
            .check("admin_action", "user:1", 5, Duration::from_secs(60), FailPolicy::FailClosed)
            .await;
        assert_eq!(decision, RateDecision::StoreUnavailable);
    }

    #[tokio::test]
    async fn test_bypass_disables_enforcement() {
        // 显式关闭开关后即使存储坏掉也一律放行
        let limiter = RateLimiter::new(Arc::new(BrokenStore), false);
        let decision = limiter
            .check("send_chat", "user:1", 0, Duration::from_secs(60), FailPolicy::FailClosed)
            .await;
        assert_eq!(decision, RateDecision::Allowed);
    }

    // Redis 路径：Lua 原子性与窗口过期需要真实实例验证
    #[tokio::test]
    async fn test_redis_incr_with_window() {
        if std::env::var("REDIS_INTEGRATION_TEST").is_err() {
            return;
        }
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let client = redis::Client::open(url).unwrap();
        let conn = client.get_connection_manager().await.unwrap();
        let store = RedisRateCounterStore::new(conn);

        let key = format!("rl:test:{}", std::process::id());
        let first = store.incr_with_window(&key, Duration::from_millis(200)).await.unwrap();
        let second = store.incr_with_window(&key, Duration::from_millis(200)).await.unwrap();
        assert_eq!((first, second), (1, 2));

        tokio::time::sleep(Duration::from_millis(300)).await;
        let after = store.incr_with_window(&key, Duration::from_millis(200)).await.unwrap();
        assert_eq!(after, 1, "counter must expire with the window");
    }
}
