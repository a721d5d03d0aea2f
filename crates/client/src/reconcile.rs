//! 乐观状态对账
//!
//! 发送消息时本地先插入占位（乐观更新），占位用调用方提供的
//! 关联 id（client_tag）登记。服务端确认的同一逻辑动作到达时，
//! 按 client_tag 匹配并替换占位，而不是重复插入。
//!
//! 存储按用户 id 划分命名空间，有显式生命周期：登录时初始化，
//! 切换账号时重建键（不是简单清空），登出时拆除——绝不让它
//! 悬挂着指向上一个身份的数据。

use std::collections::HashMap;

use domain::{ChatMessagePayload, RoomId, UserId};

/// 一条等待确认的乐观占位消息
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub client_tag: String,
    pub room_id: RoomId,
    pub content: String,
}

/// 对账结果
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// 确认匹配到了本地占位，应替换而非追加
    Replaced { client_tag: String },
    /// 没有对应占位（他人消息、或本端没有乐观插入），正常追加
    Fresh,
}

/// 乐观占位存储
pub struct OptimisticStore {
    user_id: UserId,
    pending: HashMap<String, PendingMessage>,
}

impl OptimisticStore {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            pending: HashMap::new(),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// 登记一条占位
    pub fn insert_placeholder(&mut self, client_tag: impl Into<String>, room_id: RoomId, content: impl Into<String>) {
        let client_tag = client_tag.into();
        self.pending.insert(
            client_tag.clone(),
            PendingMessage {
                client_tag,
                room_id,
                content: content.into(),
            },
        );
    }

    /// 用服务端确认对账
    ///
    /// 只有消息元数据里带着本端登记过的 client_tag 才算匹配；
    /// 匹配即消费占位，同一确认不会替换两次。
    pub fn reconcile(&mut self, payload: &ChatMessagePayload) -> Reconciliation {
        let Some(tag) = payload.client_tag.as_deref() else {
            return Reconciliation::Fresh;
        };

        if self.pending.remove(tag).is_some() {
            Reconciliation::Replaced {
                client_tag: tag.to_string(),
            }
        } else {
            Reconciliation::Fresh
        }
    }

    /// 等待确认的占位数量
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// 账号切换：重建键空间，丢弃上一身份的全部占位
    pub fn rekey(&mut self, user_id: UserId) {
        self.user_id = user_id;
        self.pending = HashMap::new();
    }

    /// 登出拆除
    pub fn teardown(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use domain::MessageId;

    fn confirmed(tag: Option<&str>) -> ChatMessagePayload {
        ChatMessagePayload {
            id: MessageId(501),
            room_id: RoomId(7),
            sender_id: UserId(1),
            content: "hi".to_string(),
            created_at: Utc::now(),
            client_tag: tag.map(|t| t.to_string()),
        }
    }

    #[test]
    fn test_matched_tag_replaces_placeholder() {
        let mut store = OptimisticStore::new(UserId(1));
        store.insert_placeholder("tag-1", RoomId(7), "hi");

        let result = store.reconcile(&confirmed(Some("tag-1")));
        assert_eq!(
            result,
            Reconciliation::Replaced {
                client_tag: "tag-1".to_string()
            }
        );
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn test_placeholder_is_consumed_once() {
        let mut store = OptimisticStore::new(UserId(1));
        store.insert_placeholder("tag-1", RoomId(7), "hi");

        store.reconcile(&confirmed(Some("tag-1")));
        // 同一确认重复到达（扇出双路径）不会第二次替换
        assert_eq!(store.reconcile(&confirmed(Some("tag-1"))), Reconciliation::Fresh);
    }

    #[test]
    fn test_unknown_tag_is_fresh() {
        let mut store = OptimisticStore::new(UserId(1));
        assert_eq!(store.reconcile(&confirmed(Some("not-mine"))), Reconciliation::Fresh);
        assert_eq!(store.reconcile(&confirmed(None)), Reconciliation::Fresh);
    }

    #[test]
    fn test_rekey_discards_previous_identity() {
        let mut store = OptimisticStore::new(UserId(1));
        store.insert_placeholder("tag-1", RoomId(7), "hi");

        store.rekey(UserId(2));
        assert_eq!(store.user_id(), UserId(2));
        assert_eq!(store.pending_count(), 0);
        assert_eq!(store.reconcile(&confirmed(Some("tag-1"))), Reconciliation::Fresh);
    }
}
