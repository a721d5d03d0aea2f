//! Redis pub/sub 桥
//!
//! 实时扇出跨实例的唯一通路。发布端按事件族写入结构化频道，
//! 订阅端每个事件族维持一条长连接订阅，把消息交给进程内注册表。

pub mod error;
pub mod publisher;
pub mod subscriber;

pub use error::{RedisError, RedisResult};
pub use publisher::Notifier;
pub use subscriber::{EventHandler, PatternSubscriber};
