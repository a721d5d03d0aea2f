//! 实时层应用服务
//!
//! 进程内连接注册表：用户级 Hub 与房间级 ChatHub，以及两者共用的
//! 连接句柄抽象。注册表变更在每个实例内部串行化，广播在锁外写出。

pub mod chat_hub;
pub mod connection;
pub mod error;
pub mod hub;

pub use chat_hub::ChatHub;
pub use connection::{ClientHandle, ConnectionId, OUTBOUND_BUFFER_SIZE};
pub use error::RegistryError;
pub use hub::Hub;
