//! 外部协作者契约
//!
//! 关系型数据模型及其 CRUD 仓储不属于实时层，这里只定义实时层
//! 消费它们的窄接口。实现方可以是数据库，也可以是测试用的内存实现。

use async_trait::async_trait;

use crate::errors::RepositoryError;
use crate::value_objects::{MessageId, RoomId, Timestamp, UserId};

/// 一条已持久化的消息
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: Timestamp,
}

/// 历史消息分页
#[derive(Debug, Clone)]
pub struct MessagePage {
    pub messages: Vec<StoredMessage>,
    /// 下一页游标；None 表示没有更早的消息
    pub next_cursor: Option<MessageId>,
}

/// 消息持久化契约
///
/// 持久化必须发生在发布到共享介质之前：publish 失败只损失实时性，
/// 不影响已落库状态的正确性。
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// 持久化一条消息并返回带 id 的完整记录
    async fn persist_message(
        &self,
        room_id: RoomId,
        sender_id: UserId,
        content: &str,
    ) -> Result<StoredMessage, RepositoryError>;

    /// 拉取一页历史消息，按 id 倒序，`cursor` 为上一页最旧的 id
    async fn fetch_recent_messages(
        &self,
        room_id: RoomId,
        cursor: Option<MessageId>,
        limit: usize,
    ) -> Result<MessagePage, RepositoryError>;

    /// 记录用户在房间内的已读位置
    async fn mark_read(&self, room_id: RoomId, user_id: UserId) -> Result<(), RepositoryError>;
}

/// 屏蔽关系查询
#[async_trait]
pub trait BlockList: Send + Sync {
    async fn is_blocked(
        &self,
        viewer_id: UserId,
        author_id: UserId,
    ) -> Result<bool, RepositoryError>;
}

/// 房间成员资格校验
#[async_trait]
pub trait Membership: Send + Sync {
    async fn validate_room_membership(
        &self,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<bool, RepositoryError>;
}

/// 用户名解析（信封里的 username 字段由服务端填充）
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn username_of(&self, user_id: UserId) -> Result<Option<String>, RepositoryError>;
}
