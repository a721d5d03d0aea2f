//! 房间级连接注册表
//!
//! 与用户为中心的 Hub 不同，ChatHub 以会话（房间）为中心：维护
//! 房间 → 成员 与 成员 → 房间 的双向映射，并从注册状态推导全局
//! 在线状态。在线状态只是派生数据，从不持久化，也不作为业务决策
//! 的唯一依据。
//!
//! 注册时的两段式握手是在线状态的引导契约：新连接收到一份
//! `connected_users` 快照（"告诉我谁在"），其余所有人收到一条
//! `user_status: online`（"告诉大家我来了"）。客户端从不轮询在线状态。

use std::collections::{HashMap, HashSet};

use domain::{Channel, Envelope, EventKind, PresenceStatus, RoomId, UserId};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::connection::{ClientHandle, ConnectionId};
use crate::error::RegistryError;

/// 单用户最大连接数（多端支持）
const MAX_CONNS_PER_USER: usize = 12;

#[derive(Default)]
struct ChatHubInner {
    /// userID -> 该用户的活跃连接集合
    user_conns: HashMap<UserId, HashMap<ConnectionId, ClientHandle>>,
    /// roomID -> 正在该房间活跃的用户集合
    rooms: HashMap<RoomId, HashSet<UserId>>,
    /// userID -> 该用户活跃的房间集合
    user_rooms: HashMap<UserId, HashSet<RoomId>>,
    shutting_down: bool,
}

impl ChatHubInner {
    /// 把用户从其加入的全部房间移除，删除由此出现的空房间
    fn evict_from_rooms(&mut self, user_id: UserId) {
        if let Some(rooms) = self.user_rooms.remove(&user_id) {
            for room_id in rooms {
                if let Some(members) = self.rooms.get_mut(&room_id) {
                    members.remove(&user_id);
                    if members.is_empty() {
                        self.rooms.remove(&room_id);
                    }
                }
            }
        }
    }

    fn snapshot_user_handles(&self, user_id: UserId) -> Vec<ClientHandle> {
        self.user_conns
            .get(&user_id)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default()
    }

    /// 除 `exclude` 外所有用户的全部连接
    fn snapshot_others(&self, exclude: UserId) -> Vec<ClientHandle> {
        self.user_conns
            .iter()
            .filter(|(user_id, _)| **user_id != exclude)
            .flat_map(|(_, bucket)| bucket.values().cloned())
            .collect()
    }
}

/// 房间级连接注册表
#[derive(Default)]
pub struct ChatHub {
    inner: RwLock<ChatHubInner>,
}

impl ChatHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册用户的一条连接，并执行在线状态引导握手
    pub async fn register_user(&self, handle: ClientHandle) -> Result<(), RegistryError> {
        let user_id = handle.user_id();

        let (was_online, snapshot, active_count) = {
            let mut inner = self.inner.write().await;

            if inner.shutting_down {
                return Err(RegistryError::ShuttingDown);
            }

            let bucket = inner.user_conns.entry(user_id).or_default();
            if bucket.len() >= MAX_CONNS_PER_USER {
                return Err(RegistryError::UserConnectionLimit);
            }

            let was_online = !bucket.is_empty();
            bucket.insert(handle.connection_id(), handle.clone());
            let active_count = bucket.len();

            let snapshot: Vec<UserId> = inner
                .user_conns
                .keys()
                .copied()
                .filter(|id| *id != user_id)
                .collect();

            (was_online, snapshot, active_count)
        };

        info!(user_id = %user_id, active_count, "ChatHub 注册连接");

        // 新连接先拿到在线快照（不含自己）
        if let Ok(payload) = Envelope::connected_users(snapshot).encode() {
            handle.try_send(&payload);
        }

        // 首条连接才翻转全局在线状态；多端重复上线不重复广播
        if !was_online {
            self.broadcast_user_status(user_id, PresenceStatus::Online)
                .await;
        }

        Ok(())
    }

    /// 注销用户的一条连接
    ///
    /// 最后一条连接断开后：清理其全部房间成员资格（删除空房间），
    /// 并向其余用户广播离线状态。
    pub async fn unregister_user(&self, user_id: UserId, connection_id: ConnectionId) {
        let remaining = {
            let mut inner = self.inner.write().await;

            let Some(bucket) = inner.user_conns.get_mut(&user_id) else {
                return;
            };
            if bucket.remove(&connection_id).is_none() {
                return;
            }

            let remaining = bucket.len();
            if remaining == 0 {
                inner.user_conns.remove(&user_id);
                inner.evict_from_rooms(user_id);
            }
            remaining
        };

        if remaining > 0 {
            debug!(user_id = %user_id, remaining, "ChatHub 注销连接，用户仍在线");
            return;
        }

        info!(user_id = %user_id, "ChatHub 注销用户，所有连接已断开");
        self.broadcast_user_status(user_id, PresenceStatus::Offline)
            .await;
    }

    /// 将用户订阅进一个房间
    ///
    /// 房间成员资格只影响扇出范围，不影响连接存活；未注册连接的
    /// join 意图直接丢弃并告警，不排队。
    pub async fn join(&self, user_id: UserId, room_id: RoomId) {
        let mut inner = self.inner.write().await;

        if !inner.user_conns.contains_key(&user_id) {
            warn!(user_id = %user_id, room_id = %room_id, "用户未注册连接，join 意图丢弃");
            return;
        }

        inner.rooms.entry(room_id).or_default().insert(user_id);
        inner.user_rooms.entry(user_id).or_default().insert(room_id);

        debug!(user_id = %user_id, room_id = %room_id, "用户加入房间");
    }

    /// 将用户从房间移除
    pub async fn leave(&self, user_id: UserId, room_id: RoomId) {
        let mut inner = self.inner.write().await;

        if let Some(members) = inner.rooms.get_mut(&room_id) {
            members.remove(&user_id);
            if members.is_empty() {
                inner.rooms.remove(&room_id);
            }
        }
        if let Some(rooms) = inner.user_rooms.get_mut(&user_id) {
            rooms.remove(&room_id);
            if rooms.is_empty() {
                inner.user_rooms.remove(&user_id);
            }
        }

        debug!(user_id = %user_id, room_id = %room_id, "用户离开房间");
    }

    /// 向房间内所有成员的所有连接广播
    ///
    /// 序列化只做一次；空房间是 no-op 而不是错误（私聊消息仍会
    /// 经由通知 Hub 送达）。返回送达的连接数。
    pub async fn broadcast_to_room(&self, room_id: RoomId, envelope: &Envelope) -> usize {
        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, room_id = %room_id, "房间广播序列化失败");
                return 0;
            }
        };

        let targets: Vec<ClientHandle> = {
            let inner = self.inner.read().await;
            let Some(members) = inner.rooms.get(&room_id) else {
                return 0;
            };
            members
                .iter()
                .flat_map(|user_id| inner.snapshot_user_handles(*user_id))
                .collect()
        };

        for handle in &targets {
            handle.try_send(&payload);
        }

        debug!(room_id = %room_id, delivered = targets.len(), "房间广播完成");
        targets.len()
    }

    /// 向所有已注册连接广播
    pub async fn broadcast_to_all(&self, envelope: &Envelope) -> usize {
        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "全局广播序列化失败");
                return 0;
            }
        };

        let targets: Vec<ClientHandle> = {
            let inner = self.inner.read().await;
            inner
                .user_conns
                .values()
                .flat_map(|bucket| bucket.values().cloned())
                .collect()
        };

        for handle in &targets {
            handle.try_send(&payload);
        }
        targets.len()
    }

    /// 向除本人外的所有用户广播上下线事件
    pub async fn broadcast_user_status(&self, user_id: UserId, status: PresenceStatus) {
        let payload = match Envelope::user_status(user_id, status).encode() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "状态广播序列化失败");
                return;
            }
        };

        let targets = {
            let inner = self.inner.read().await;
            inner.snapshot_others(user_id)
        };

        for handle in &targets {
            handle.try_send(&payload);
        }
    }

    /// 正在房间内活跃的用户集合
    pub async fn active_members(&self, room_id: RoomId) -> Vec<UserId> {
        let inner = self.inner.read().await;
        inner
            .rooms
            .get(&room_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// 用户是否正在某房间活跃
    pub async fn is_member(&self, user_id: UserId, room_id: RoomId) -> bool {
        let inner = self.inner.read().await;
        inner
            .user_rooms
            .get(&user_id)
            .is_some_and(|rooms| rooms.contains(&room_id))
    }

    /// 用户是否至少有一条活跃连接
    ///
    /// 注意区分"在任何地方在线"与"在这个房间活跃"——两者是
    /// 相互独立的信息通道。
    pub async fn is_online(&self, user_id: UserId) -> bool {
        let inner = self.inner.read().await;
        inner
            .user_conns
            .get(&user_id)
            .is_some_and(|bucket| !bucket.is_empty())
    }

    /// 当前存在成员的房间数
    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }

    /// 订阅回调入口：按频道名恢复房间 id 并向本进程成员扇出
    ///
    /// payload 里缺失 `type` 时按频道族补全（历史线路行为）；
    /// 无法解码的 payload 丢弃并告警，订阅循环继续。
    pub async fn dispatch(&self, channel: &str, payload: &str) {
        let parsed = Channel::parse(channel);
        let Some(room_id) = parsed.as_ref().and_then(Channel::room_id) else {
            warn!(channel, "invalid chat channel");
            return;
        };

        let fallback_kind = match parsed {
            Some(Channel::RoomMessages(_)) => EventKind::Message,
            Some(Channel::Typing(_)) => EventKind::Typing,
            Some(Channel::Presence(_)) => EventKind::Presence,
            _ => unreachable!("room_id() 已筛掉非房间频道"),
        };

        let mut envelope = match decode_with_fallback(payload, fallback_kind) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(channel, error = %err, "无法解码的房间消息已丢弃");
                return;
            }
        };
        envelope.conversation_id = Some(room_id);

        self.broadcast_to_room(room_id, &envelope).await;
    }

    /// 优雅关闭：推送关闭通知后清空全部状态
    pub async fn shutdown(&self) {
        let targets: Vec<ClientHandle> = {
            let mut inner = self.inner.write().await;
            inner.shutting_down = true;
            let targets = inner
                .user_conns
                .values()
                .flat_map(|bucket| bucket.values().cloned())
                .collect();
            inner.user_conns.clear();
            inner.rooms.clear();
            inner.user_rooms.clear();
            targets
        };

        if let Ok(notice) = Envelope::server_shutdown().encode() {
            for handle in &targets {
                handle.try_send(&notice);
            }
        }

        info!(connections = targets.len(), "chat hub 已关闭");
    }
}

/// 解码入站 payload；缺失 `type` 字段时注入频道族对应的默认值
fn decode_with_fallback(payload: &str, fallback: EventKind) -> Result<Envelope, domain::DomainError> {
    match Envelope::decode(payload) {
        Ok(envelope) => Ok(envelope),
        Err(original_err) => {
            let Ok(mut value) = serde_json::from_str::<serde_json::Value>(payload) else {
                return Err(original_err);
            };
            let Some(object) = value.as_object_mut() else {
                return Err(original_err);
            };
            if object.contains_key("type") {
                // type 存在但不合法（未知变体等），维持拒绝
                return Err(original_err);
            }
            object.insert(
                "type".to_string(),
                serde_json::to_value(fallback).unwrap_or(serde_json::Value::Null),
            );
            serde_json::from_value(value).map_err(|e| domain::DomainError::Encoding {
                message: e.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::ConnectedUsersPayload;
    use domain::UserStatusPayload;

    async fn registered(hub: &ChatHub, user_id: u64) -> (ClientHandle, tokio::sync::mpsc::Receiver<String>) {
        let (handle, rx) = ClientHandle::channel(UserId(user_id));
        hub.register_user(handle.clone()).await.unwrap();
        (handle, rx)
    }

    fn decode(raw: &str) -> Envelope {
        Envelope::decode(raw).unwrap()
    }

    #[tokio::test]
    async fn test_presence_bootstrap_symmetry() {
        let hub = ChatHub::new();
        let (_a, mut rx_a) = registered(&hub, 1).await;

        // A 先收到一份空快照
        let snapshot = decode(&rx_a.recv().await.unwrap());
        assert_eq!(snapshot.kind, EventKind::ConnectedUsers);
        let payload: ConnectedUsersPayload = snapshot.decode_payload().unwrap();
        assert!(payload.user_ids.is_empty());

        let (_b, mut rx_b) = registered(&hub, 2).await;

        // B 的快照里只有 A
        let snapshot = decode(&rx_b.recv().await.unwrap());
        let payload: ConnectedUsersPayload = snapshot.decode_payload().unwrap();
        assert_eq!(payload.user_ids, vec![UserId(1)]);

        // A 收到 B 的上线事件
        let status = decode(&rx_a.recv().await.unwrap());
        assert_eq!(status.kind, EventKind::UserStatus);
        let payload: UserStatusPayload = status.decode_payload().unwrap();
        assert_eq!(payload.user_id, UserId(2));
        assert_eq!(payload.status, PresenceStatus::Online);

        // B 没有收到自己的上线事件
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_second_device_does_not_rebroadcast_online() {
        let hub = ChatHub::new();
        let (_a, mut rx_a) = registered(&hub, 1).await;
        rx_a.recv().await.unwrap(); // 快照

        let (_b1, mut rx_b1) = registered(&hub, 2).await;
        rx_b1.recv().await.unwrap(); // 快照
        rx_a.recv().await.unwrap(); // B 上线

        // B 的第二台设备注册：A 不应再次收到上线广播
        let (_b2, mut rx_b2) = registered(&hub, 2).await;
        rx_b2.recv().await.unwrap(); // 快照
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_only_after_last_connection() {
        let hub = ChatHub::new();
        let (_a, mut rx_a) = registered(&hub, 1).await;
        rx_a.recv().await.unwrap();

        let (b1, mut _rx_b1) = registered(&hub, 2).await;
        let (b2, mut _rx_b2) = registered(&hub, 2).await;
        rx_a.recv().await.unwrap(); // B 上线

        hub.unregister_user(UserId(2), b1.connection_id()).await;
        assert!(rx_a.try_recv().is_err(), "还有一条连接，不应广播离线");
        assert!(hub.is_online(UserId(2)).await);

        hub.unregister_user(UserId(2), b2.connection_id()).await;
        let status = decode(&rx_a.recv().await.unwrap());
        let payload: UserStatusPayload = status.decode_payload().unwrap();
        assert_eq!(payload.status, PresenceStatus::Offline);
        assert!(!hub.is_online(UserId(2)).await);
    }

    #[tokio::test]
    async fn test_room_broadcast_reaches_each_member_once() {
        let hub = ChatHub::new();
        let (_a, mut rx_a) = registered(&hub, 1).await;
        let (_b, mut rx_b) = registered(&hub, 2).await;
        rx_a.recv().await.unwrap();
        rx_b.recv().await.unwrap();
        rx_a.recv().await.unwrap(); // B 上线

        hub.join(UserId(1), RoomId(7)).await;
        hub.join(UserId(2), RoomId(7)).await;

        let envelope = Envelope::new(EventKind::RoomMessage).with_room(RoomId(7));
        let delivered = hub.broadcast_to_room(RoomId(7), &envelope).await;
        assert_eq!(delivered, 2);

        assert_eq!(decode(&rx_a.recv().await.unwrap()).kind, EventKind::RoomMessage);
        assert_eq!(decode(&rx_b.recv().await.unwrap()).kind, EventKind::RoomMessage);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_join_without_connection_is_dropped() {
        let hub = ChatHub::new();
        hub.join(UserId(99), RoomId(1)).await;
        assert!(hub.active_members(RoomId(1)).await.is_empty());
        assert_eq!(hub.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_no_empty_room_buckets() {
        let hub = ChatHub::new();
        let (a, mut _rx_a) = registered(&hub, 1).await;

        hub.join(UserId(1), RoomId(7)).await;
        hub.leave(UserId(1), RoomId(7)).await;
        assert_eq!(hub.room_count().await, 0);

        hub.join(UserId(1), RoomId(8)).await;
        hub.unregister_user(UserId(1), a.connection_id()).await;
        assert_eq!(hub.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_online_anywhere_is_not_active_in_room() {
        let hub = ChatHub::new();
        let (_a, mut _rx_a) = registered(&hub, 1).await;

        assert!(hub.is_online(UserId(1)).await);
        assert!(!hub.is_member(UserId(1), RoomId(7)).await);

        hub.join(UserId(1), RoomId(7)).await;
        assert!(hub.is_member(UserId(1), RoomId(7)).await);

        hub.leave(UserId(1), RoomId(7)).await;
        assert!(hub.is_online(UserId(1)).await, "离开房间不影响连接存活");
    }

    #[tokio::test]
    async fn test_dispatch_recovers_room_and_fills_type() {
        let hub = ChatHub::new();
        let (_a, mut rx_a) = registered(&hub, 1).await;
        rx_a.recv().await.unwrap();
        hub.join(UserId(1), RoomId(7)).await;

        // 缺 type 的 payload 按频道族补全
        hub.dispatch("typing:conv:7", r#"{"payload":{"user_id":2,"username":"b","is_typing":true,"expires_in_ms":5000}}"#)
            .await;
        let envelope = decode(&rx_a.recv().await.unwrap());
        assert_eq!(envelope.kind, EventKind::Typing);
        assert_eq!(envelope.conversation_id, Some(RoomId(7)));

        // 畸形 payload 丢弃
        hub.dispatch("chat:conv:7", "not json at all").await;
        assert!(rx_a.try_recv().is_err());

        // 未知频道丢弃
        hub.dispatch("game:room:7", r#"{"type":"message"}"#).await;
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_to_empty_room_is_noop() {
        let hub = ChatHub::new();
        let envelope = Envelope::new(EventKind::Message).with_room(RoomId(404));
        assert_eq!(hub.broadcast_to_room(RoomId(404), &envelope).await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_clears_everything() {
        let hub = ChatHub::new();
        let (_a, mut rx_a) = registered(&hub, 1).await;
        rx_a.recv().await.unwrap();
        hub.join(UserId(1), RoomId(7)).await;

        hub.shutdown().await;

        let notice = decode(&rx_a.recv().await.unwrap());
        assert_eq!(notice.kind, EventKind::ServerShutdown);
        assert_eq!(hub.room_count().await, 0);

        let (late, _rx) = ClientHandle::channel(UserId(2));
        assert_eq!(
            hub.register_user(late).await,
            Err(RegistryError::ShuttingDown)
        );
    }
}
