//! 关系型契约的内存实现
//!
//! 关系型数据模型本身不属于实时层；这里提供
//! `domain::repositories` 各契约的内存实现，供测试与无数据库的
//! 开发运行使用。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use domain::{
    BlockList, Membership, MessageId, MessagePage, MessageStore, RepositoryError, RoomId,
    StoredMessage, UserDirectory, UserId,
};
use tokio::sync::RwLock;

/// 内存消息存储
#[derive(Default)]
pub struct InMemoryMessageStore {
    next_id: AtomicU64,
    messages: RwLock<HashMap<RoomId, Vec<StoredMessage>>>,
    read_positions: RwLock<HashMap<(RoomId, UserId), MessageId>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            messages: RwLock::new(HashMap::new()),
            read_positions: RwLock::new(HashMap::new()),
        }
    }

    /// 用户在房间内的已读位置（测试用）
    pub async fn read_position(&self, room_id: RoomId, user_id: UserId) -> Option<MessageId> {
        let positions = self.read_positions.read().await;
        positions.get(&(room_id, user_id)).copied()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn persist_message(
        &self,
        room_id: RoomId,
        sender_id: UserId,
        content: &str,
    ) -> Result<StoredMessage, RepositoryError> {
        let message = StoredMessage {
            id: MessageId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            room_id,
            sender_id,
            content: content.to_string(),
            created_at: Utc::now(),
        };

        let mut messages = self.messages.write().await;
        messages.entry(room_id).or_default().push(message.clone());
        Ok(message)
    }

    async fn fetch_recent_messages(
        &self,
        room_id: RoomId,
        cursor: Option<MessageId>,
        limit: usize,
    ) -> Result<MessagePage, RepositoryError> {
        let messages = self.messages.read().await;
        let room_messages = messages.get(&room_id).cloned().unwrap_or_default();

        let mut page: Vec<StoredMessage> = room_messages
            .into_iter()
            .filter(|m| cursor.map_or(true, |c| m.id < c))
            .collect();
        page.sort_by(|a, b| b.id.cmp(&a.id));
        page.truncate(limit);

        let next_cursor = (page.len() == limit).then(|| page.last().map(|m| m.id)).flatten();
        Ok(MessagePage {
            messages: page,
            next_cursor,
        })
    }

    async fn mark_read(&self, room_id: RoomId, user_id: UserId) -> Result<(), RepositoryError> {
        let latest = {
            let messages = self.messages.read().await;
            messages
                .get(&room_id)
                .and_then(|list| list.last())
                .map(|m| m.id)
        };

        if let Some(latest) = latest {
            let mut positions = self.read_positions.write().await;
            positions.insert((room_id, user_id), latest);
        }
        Ok(())
    }
}

/// 内存屏蔽列表
#[derive(Default)]
pub struct InMemoryBlockList {
    /// (viewer, author) 对的集合
    blocked: RwLock<HashSet<(UserId, UserId)>>,
}

impl InMemoryBlockList {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn block(&self, viewer_id: UserId, author_id: UserId) {
        let mut blocked = self.blocked.write().await;
        blocked.insert((viewer_id, author_id));
    }
}

#[async_trait]
impl BlockList for InMemoryBlockList {
    async fn is_blocked(
        &self,
        viewer_id: UserId,
        author_id: UserId,
    ) -> Result<bool, RepositoryError> {
        let blocked = self.blocked.read().await;
        Ok(blocked.contains(&(viewer_id, author_id)))
    }
}

/// 内存成员资格
///
/// `permissive()` 创建的实例放行一切成员校验，供开发环境快速起步。
pub struct InMemoryMembership {
    members: RwLock<HashMap<RoomId, HashSet<UserId>>>,
    permit_all: bool,
}

impl Default for InMemoryMembership {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMembership {
    pub fn new() -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
            permit_all: false,
        }
    }

    pub fn permissive() -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
            permit_all: true,
        }
    }

    pub async fn add_member(&self, room_id: RoomId, user_id: UserId) {
        let mut members = self.members.write().await;
        members.entry(room_id).or_default().insert(user_id);
    }
}

#[async_trait]
impl Membership for InMemoryMembership {
    async fn validate_room_membership(
        &self,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<bool, RepositoryError> {
        if self.permit_all {
            return Ok(true);
        }
        let members = self.members.read().await;
        Ok(members
            .get(&room_id)
            .is_some_and(|set| set.contains(&user_id)))
    }
}

/// 内存用户名目录
#[derive(Default)]
pub struct InMemoryUserDirectory {
    usernames: RwLock<HashMap<UserId, String>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user_id: UserId, username: impl Into<String>) {
        let mut usernames = self.usernames.write().await;
        usernames.insert(user_id, username.into());
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn username_of(&self, user_id: UserId) -> Result<Option<String>, RepositoryError> {
        let usernames = self.usernames.read().await;
        Ok(usernames.get(&user_id).cloned())
    }
}
