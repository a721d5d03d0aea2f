//! 共享介质的频道命名规则
//!
//! 频道名是跨版本稳定的线路契约，按事件族参数化：
//! `notifications:user:<id>`、`chat:conv:<id>`、`typing:conv:<id>`、
//! `presence:conv:<id>`，另加全局 `notifications:broadcast`。
//! 订阅端必须容忍模式匹配投递，并从频道字符串中恢复 id；
//! 无法解析的频道丢弃并告警，绝不致命。

use std::fmt;

use crate::value_objects::{RoomId, UserId};

/// 通知族的订阅模式（Hub 侧）
pub const NOTIFICATION_PATTERNS: &[&str] = &["notifications:user:*", "notifications:broadcast"];

/// 聊天族的订阅模式（ChatHub 侧）
pub const CHAT_PATTERNS: &[&str] = &["chat:conv:*", "typing:conv:*", "presence:conv:*"];

/// 结构化频道名
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// 单用户定向通知
    UserNotifications(UserId),
    /// 全局广播
    Broadcast,
    /// 房间聊天消息
    RoomMessages(RoomId),
    /// 输入中指示
    Typing(RoomId),
    /// 房间内在线状态
    Presence(RoomId),
}

impl Channel {
    /// 解析收到的频道名；无法识别时返回 None，由调用方告警后丢弃
    pub fn parse(raw: &str) -> Option<Self> {
        if raw == "notifications:broadcast" {
            return Some(Channel::Broadcast);
        }
        if let Some(rest) = raw.strip_prefix("notifications:user:") {
            return rest.parse().ok().map(|id| Channel::UserNotifications(UserId(id)));
        }
        if let Some(rest) = raw.strip_prefix("chat:conv:") {
            return rest.parse().ok().map(|id| Channel::RoomMessages(RoomId(id)));
        }
        if let Some(rest) = raw.strip_prefix("typing:conv:") {
            return rest.parse().ok().map(|id| Channel::Typing(RoomId(id)));
        }
        if let Some(rest) = raw.strip_prefix("presence:conv:") {
            return rest.parse().ok().map(|id| Channel::Presence(RoomId(id)));
        }
        None
    }

    /// 频道所属房间（通知族返回 None）
    pub fn room_id(&self) -> Option<RoomId> {
        match self {
            Channel::RoomMessages(id) | Channel::Typing(id) | Channel::Presence(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::UserNotifications(id) => write!(f, "notifications:user:{}", id),
            Channel::Broadcast => write!(f, "notifications:broadcast"),
            Channel::RoomMessages(id) => write!(f, "chat:conv:{}", id),
            Channel::Typing(id) => write!(f, "typing:conv:{}", id),
            Channel::Presence(id) => write!(f, "presence:conv:{}", id),
        }
    }
}
