//! 客户端连接器
//!
//! 接收端契约的实现：换取单次票据、打开流、带抖动的指数退避
//! 重连、入站消息去重，以及本地乐观状态与服务端确认的对账。

pub mod backoff;
pub mod connector;
pub mod dedup;
pub mod reconcile;

pub use backoff::{Backoff, ReconnectPolicy};
pub use connector::{
    ChatConnector, ConnectorCommand, ConnectorError, ConnectorEvent, ConnectionState,
    HttpTicketSource, TicketSource,
};
pub use dedup::DedupCache;
pub use reconcile::{OptimisticStore, Reconciliation};
