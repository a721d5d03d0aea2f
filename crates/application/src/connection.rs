//! 连接句柄
//!
//! 一个 `ClientHandle` 对应一条已打开的双向流，持有该连接的有界
//! 出站队列。写入永不阻塞：慢速对端导致队列写满时直接丢弃本条
//! 消息，并尽力补发一条 `messages_dropped` 通知让前端感知缺口。

use domain::{Envelope, UserId};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// 出站队列容量，写满即丢
pub const OUTBOUND_BUFFER_SIZE: usize = 256;

/// 连接唯一标识（进程内）
pub type ConnectionId = Uuid;

/// 单条连接的发送端句柄
///
/// 由创建它的注册表独占管理；传输层关闭或显式注销时销毁，从不持久化。
#[derive(Clone)]
pub struct ClientHandle {
    connection_id: ConnectionId,
    user_id: UserId,
    sender: mpsc::Sender<String>,
}

impl ClientHandle {
    /// 创建句柄及其配对的出站接收端（由传输层的写循环消费）
    pub fn channel(user_id: UserId) -> (Self, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel(OUTBOUND_BUFFER_SIZE);
        (
            Self {
                connection_id: Uuid::new_v4(),
                user_id,
                sender,
            },
            receiver,
        )
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// 尽力写出一条已序列化的消息
    ///
    /// 队列已关闭说明对端正在拆线，属于正常稳态，不是错误；
    /// 队列写满则丢弃并补发缺口通知。
    pub fn try_send(&self, payload: &str) {
        match self.sender.try_send(payload.to_string()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(
                    connection_id = %self.connection_id,
                    user_id = %self.user_id,
                    "出站队列已关闭，消息忽略"
                );
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    connection_id = %self.connection_id,
                    user_id = %self.user_id,
                    "出站队列已满，消息丢弃"
                );

                if let Ok(notice) = Envelope::messages_dropped("buffer_full").encode() {
                    // 连通知都塞不进去，说明对端已经彻底跟不上了
                    let _ = self.sender.try_send(notice);
                }
            }
        }
    }
}
