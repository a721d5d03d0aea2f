//! 用户级连接注册表
//!
//! Hub 维护 identity → 连接集合 的进程内映射，服务于定向通知的
//! 扇出。所有变更经由同一把注册表级锁串行化；广播先在锁内对目标
//! 集合做快照，再在锁外写出，慢速对端不会拖住注册表。

use std::collections::HashMap;

use domain::{Channel, Envelope, UserId};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::connection::{ClientHandle, ConnectionId};
use crate::error::RegistryError;

/// 单用户最大连接数
const MAX_CONNS_PER_USER: usize = 12;
/// 进程内最大总连接数
const MAX_TOTAL_CONNS: usize = 10_000;

#[derive(Default)]
struct HubInner {
    conns: HashMap<UserId, HashMap<ConnectionId, ClientHandle>>,
    total_conns: usize,
    shutting_down: bool,
}

/// 用户级连接注册表
#[derive(Default)]
pub struct Hub {
    inner: RwLock<HubInner>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一条连接
    pub async fn register(&self, handle: ClientHandle) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;

        if inner.shutting_down {
            return Err(RegistryError::ShuttingDown);
        }
        if inner.total_conns >= MAX_TOTAL_CONNS {
            return Err(RegistryError::ServerConnectionLimit);
        }

        let bucket = inner.conns.entry(handle.user_id()).or_default();
        if bucket.len() >= MAX_CONNS_PER_USER {
            return Err(RegistryError::UserConnectionLimit);
        }

        bucket.insert(handle.connection_id(), handle);
        inner.total_conns += 1;
        Ok(())
    }

    /// 注销一条连接；该用户最后一条连接移除后整个桶一并删除
    pub async fn unregister(&self, user_id: UserId, connection_id: ConnectionId) {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;

        if let Some(bucket) = inner.conns.get_mut(&user_id) {
            if bucket.remove(&connection_id).is_some() {
                inner.total_conns -= 1;
            }
            if bucket.is_empty() {
                inner.conns.remove(&user_id);
            }
        }
    }

    /// 向某个用户的全部连接投递已序列化的消息
    ///
    /// 返回投递的连接数。送达不了早已断开的对端不是错误，是稳态。
    pub async fn broadcast(&self, user_id: UserId, payload: &str) -> usize {
        let targets: Vec<ClientHandle> = {
            let inner = self.inner.read().await;
            match inner.conns.get(&user_id) {
                Some(bucket) => bucket.values().cloned().collect(),
                None => return 0,
            }
        };

        for handle in &targets {
            handle.try_send(payload);
        }
        targets.len()
    }

    /// 向所有连接投递
    pub async fn broadcast_all(&self, payload: &str) -> usize {
        let targets: Vec<ClientHandle> = {
            let inner = self.inner.read().await;
            inner
                .conns
                .values()
                .flat_map(|bucket| bucket.values().cloned())
                .collect()
        };

        for handle in &targets {
            handle.try_send(payload);
        }
        targets.len()
    }

    /// 用户是否至少有一条活跃连接
    pub async fn is_online(&self, user_id: UserId) -> bool {
        let inner = self.inner.read().await;
        inner.conns.get(&user_id).is_some_and(|b| !b.is_empty())
    }

    /// 当前总连接数
    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.total_conns
    }

    /// 当前持有连接的用户数
    pub async fn user_count(&self) -> usize {
        self.inner.read().await.conns.len()
    }

    /// 订阅回调入口：按频道名分发一条来自共享介质的消息
    pub async fn dispatch(&self, channel: &str, payload: &str) {
        match Channel::parse(channel) {
            Some(Channel::Broadcast) => {
                self.broadcast_all(payload).await;
            }
            Some(Channel::UserNotifications(user_id)) => {
                let delivered = self.broadcast(user_id, payload).await;
                debug!(channel, user_id = %user_id, delivered, "通知已分发");
            }
            _ => {
                warn!(channel, "invalid notification channel");
            }
        }
    }

    /// 优雅关闭：停止接受新注册，向每条连接推送关闭通知，然后清空
    pub async fn shutdown(&self) {
        let targets: Vec<ClientHandle> = {
            let mut inner = self.inner.write().await;
            inner.shutting_down = true;
            let targets = inner
                .conns
                .values()
                .flat_map(|bucket| bucket.values().cloned())
                .collect();
            inner.conns.clear();
            inner.total_conns = 0;
            targets
        };

        if let Ok(notice) = Envelope::server_shutdown().encode() {
            for handle in &targets {
                handle.try_send(&notice);
            }
        }

        info!(connections = targets.len(), "notification hub 已关闭");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::EventKind;

    #[tokio::test]
    async fn test_register_broadcast_unregister() {
        let hub = Hub::new();
        let (handle, mut rx) = ClientHandle::channel(UserId(1));
        let connection_id = handle.connection_id();

        hub.register(handle).await.unwrap();
        assert!(hub.is_online(UserId(1)).await);

        let delivered = hub.broadcast(UserId(1), "ping").await;
        assert_eq!(delivered, 1);
        assert_eq!(rx.recv().await.as_deref(), Some("ping"));

        hub.unregister(UserId(1), connection_id).await;
        assert!(!hub.is_online(UserId(1)).await);
        assert_eq!(hub.broadcast(UserId(1), "ping").await, 0);
    }

    #[tokio::test]
    async fn test_no_empty_buckets_after_churn() {
        let hub = Hub::new();

        for _ in 0..10 {
            let (handle, _rx) = ClientHandle::channel(UserId(7));
            let connection_id = handle.connection_id();
            hub.register(handle).await.unwrap();
            hub.unregister(UserId(7), connection_id).await;
        }

        assert_eq!(hub.user_count().await, 0);
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_multi_device_broadcast_reaches_every_connection() {
        let hub = Hub::new();
        let (h1, mut rx1) = ClientHandle::channel(UserId(3));
        let (h2, mut rx2) = ClientHandle::channel(UserId(3));
        hub.register(h1).await.unwrap();
        hub.register(h2).await.unwrap();

        assert_eq!(hub.broadcast(UserId(3), "hello").await, 2);
        assert_eq!(rx1.recv().await.as_deref(), Some("hello"));
        assert_eq!(rx2.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_per_user_connection_limit() {
        let hub = Hub::new();
        let mut receivers = Vec::new();

        for _ in 0..12 {
            let (handle, rx) = ClientHandle::channel(UserId(5));
            receivers.push(rx);
            hub.register(handle).await.unwrap();
        }

        let (extra, _rx) = ClientHandle::channel(UserId(5));
        assert_eq!(
            hub.register(extra).await,
            Err(RegistryError::UserConnectionLimit)
        );
    }

    #[tokio::test]
    async fn test_dispatch_parses_channel() {
        let hub = Hub::new();
        let (handle, mut rx) = ClientHandle::channel(UserId(42));
        hub.register(handle).await.unwrap();

        hub.dispatch("notifications:user:42", "direct").await;
        assert_eq!(rx.recv().await.as_deref(), Some("direct"));

        hub.dispatch("notifications:broadcast", "to-everyone").await;
        assert_eq!(rx.recv().await.as_deref(), Some("to-everyone"));

        // 无法解析的频道丢弃，不 panic 也不投递
        hub.dispatch("notifications:user:not-a-number", "junk").await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_notifies_then_rejects() {
        let hub = Hub::new();
        let (handle, mut rx) = ClientHandle::channel(UserId(1));
        hub.register(handle).await.unwrap();

        hub.shutdown().await;

        let notice = rx.recv().await.unwrap();
        let envelope = Envelope::decode(&notice).unwrap();
        assert_eq!(envelope.kind, EventKind::ServerShutdown);

        let (late, _rx) = ClientHandle::channel(UserId(2));
        assert_eq!(hub.register(late).await, Err(RegistryError::ShuttingDown));
        assert_eq!(hub.connection_count().await, 0);
    }
}
