//! 入站消息去重
//!
//! 同一逻辑事件可能两次到达：`message` 与 `room_message` 是同一
//! 广播的两条扇出路径，发布竞争也可能造成重复。每个事件携带
//! (room, message-id)，应用前先查有界的近期缓存，命中即丢弃。
//! 缓存超过大小阈值时顺带淘汰超出时间视界的旧条目。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use domain::{MessageId, RoomId};

/// 默认大小阈值
const DEFAULT_MAX_ENTRIES: usize = 2048;
/// 默认时间视界
const DEFAULT_HORIZON: Duration = Duration::from_secs(300);

/// 有界的近期去重缓存
pub struct DedupCache {
    seen: HashMap<(RoomId, MessageId), Instant>,
    max_entries: usize,
    horizon: Duration,
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_HORIZON)
    }
}

impl DedupCache {
    pub fn new(max_entries: usize, horizon: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            max_entries,
            horizon,
        }
    }

    /// 记录一个 (room, message-id)；首次见到返回 true，重复返回 false
    pub fn insert(&mut self, room_id: RoomId, message_id: MessageId) -> bool {
        let key = (room_id, message_id);
        if self.seen.contains_key(&key) {
            return false;
        }

        self.seen.insert(key, Instant::now());
        if self.seen.len() > self.max_entries {
            self.evict_stale();
        }
        true
    }

    /// 淘汰超出时间视界的条目
    fn evict_stale(&mut self) {
        let now = Instant::now();
        let horizon = self.horizon;
        self.seen.retain(|_, seen_at| now.duration_since(*seen_at) < horizon);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// 账号切换/登出时清空
    pub fn clear(&mut self) {
        self.seen.clear();
    }
}
