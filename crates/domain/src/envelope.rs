//! 线路消息信封
//!
//! 两个方向共用一种信封：`{type, conversation_id?, user_id?, username?, payload}`。
//! `type` 在边界处建模为封闭的枚举，未知取值在反序列化时显式拒绝；
//! `payload` 按变体解码成具体结构，而不是在业务代码里到处摸 JSON。

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{MessageId, RoomId, Timestamp, UserId};

/// 已知的事件类型
///
/// `Message` 与 `RoomMessage` 是同一逻辑广播的两条扇出路径
/// （pub/sub 中继 vs 进程内直投），两者都必须被容忍，由客户端
/// 去重缓存折叠，不允许砍掉其中一条。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    RoomMessage,
    Typing,
    Presence,
    UserStatus,
    ConnectedUsers,
    Joined,
    Read,
    ParticipantJoined,
    ParticipantLeft,
    /// 握手完成后推给连接本身的欢迎帧
    Connected,
    /// 出站队列满导致丢包时的尽力而为通知
    MessagesDropped,
    ServerShutdown,
    Error,
}

/// 线路消息信封
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<RoomId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            conversation_id: None,
            user_id: None,
            username: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_room(mut self, room_id: RoomId) -> Self {
        self.conversation_id = Some(room_id);
        self
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, DomainError> {
        self.payload = serde_json::to_value(payload).map_err(|e| DomainError::Encoding {
            message: e.to_string(),
        })?;
        Ok(self)
    }

    /// 反序列化一帧入站消息；未知 `type` 或畸形 JSON 都归为解码错误
    pub fn decode(raw: &str) -> Result<Self, DomainError> {
        serde_json::from_str(raw).map_err(|e| DomainError::Encoding {
            message: e.to_string(),
        })
    }

    pub fn encode(&self) -> Result<String, DomainError> {
        serde_json::to_string(self).map_err(|e| DomainError::Encoding {
            message: e.to_string(),
        })
    }

    /// 将 payload 解码为变体对应的具体结构
    pub fn decode_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, DomainError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| DomainError::Encoding {
            message: e.to_string(),
        })
    }

    // --- 常用事件的构造器 ---

    pub fn user_status(user_id: UserId, status: PresenceStatus) -> Self {
        let payload = serde_json::json!({ "status": status, "user_id": user_id });
        Self {
            kind: EventKind::UserStatus,
            conversation_id: None,
            user_id: Some(user_id),
            username: None,
            payload,
        }
    }

    pub fn connected_users(user_ids: Vec<UserId>) -> Self {
        let payload = serde_json::json!({ "user_ids": user_ids });
        Self {
            kind: EventKind::ConnectedUsers,
            conversation_id: None,
            user_id: None,
            username: None,
            payload,
        }
    }

    pub fn joined(room_id: RoomId) -> Self {
        let payload = serde_json::json!({ "conversation_id": room_id });
        Envelope::new(EventKind::Joined).with_room(room_id).payload_value(payload)
    }

    pub fn messages_dropped(reason: &str) -> Self {
        let payload = serde_json::json!({ "reason": reason });
        Envelope::new(EventKind::MessagesDropped).payload_value(payload)
    }

    pub fn server_shutdown() -> Self {
        let payload = serde_json::json!({ "message": "Server is shutting down" });
        Envelope::new(EventKind::ServerShutdown).payload_value(payload)
    }

    pub fn error(message: &str) -> Self {
        let payload = serde_json::json!({ "message": message });
        Envelope::new(EventKind::Error).payload_value(payload)
    }

    fn payload_value(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// 在线状态取值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// 聊天消息 payload（`message` / `room_message` 两个事件共用）
///
/// `client_tag` 是调用方提供的关联 id，客户端用它把服务端确认
/// 与本地乐观占位消息对账。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessagePayload {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_tag: Option<String>,
}

/// 输入中指示 payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingPayload {
    pub user_id: UserId,
    pub username: String,
    pub is_typing: bool,
    pub expires_in_ms: u64,
}

/// 房间内在线状态 payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresencePayload {
    pub user_id: UserId,
    pub username: String,
    pub status: PresenceStatus,
}

/// 全局上下线 payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStatusPayload {
    pub user_id: UserId,
    pub status: PresenceStatus,
}

/// 在线用户快照 payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedUsersPayload {
    pub user_ids: Vec<UserId>,
}

/// 已读回执 payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadPayload {
    pub conversation_id: RoomId,
    pub user_id: UserId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope::new(EventKind::RoomMessage)
            .with_room(RoomId(7))
            .with_user(UserId(3))
            .with_username("ada");

        let json: serde_json::Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "room_message");
        assert_eq!(json["conversation_id"], 7);
        assert_eq!(json["user_id"], 3);
        assert_eq!(json["username"], "ada");
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let encoded = Envelope::user_status(UserId(9), PresenceStatus::Online)
            .encode()
            .unwrap();
        assert!(!encoded.contains("conversation_id"));
        assert!(!encoded.contains("username"));
    }

    #[test]
    fn test_unknown_event_kind_is_rejected() {
        let raw = r#"{"type":"wormhole","payload":null}"#;
        assert!(Envelope::decode(raw).is_err());
    }

    #[test]
    fn test_missing_payload_defaults_to_null() {
        let envelope = Envelope::decode(r#"{"type":"read","conversation_id":4}"#).unwrap();
        assert_eq!(envelope.kind, EventKind::Read);
        assert!(envelope.payload.is_null());
    }

    #[test]
    fn test_chat_message_payload_roundtrip() {
        let payload = ChatMessagePayload {
            id: MessageId(501),
            room_id: RoomId(7),
            sender_id: UserId(3),
            content: "hi".to_string(),
            created_at: Utc::now(),
            client_tag: Some("tag-1".to_string()),
        };

        let envelope = Envelope::new(EventKind::Message)
            .with_room(RoomId(7))
            .with_payload(&payload)
            .unwrap();

        let decoded: ChatMessagePayload = envelope.decode_payload().unwrap();
        assert_eq!(decoded.id, MessageId(501));
        assert_eq!(decoded.client_tag.as_deref(), Some("tag-1"));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let envelope = Envelope::user_status(UserId(2), PresenceStatus::Offline);
        let payload: UserStatusPayload = envelope.decode_payload().unwrap();
        assert_eq!(payload.status, PresenceStatus::Offline);
        assert!(envelope.encode().unwrap().contains(r#""status":"offline""#));
    }
}
