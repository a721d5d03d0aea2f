//! 实时层基础设施
//!
//! Redis 承载的共享介质原语（pub/sub 桥、单次票据、令牌黑名单、
//! 原子限流计数），以及关系型存储契约的内存实现。所有跨实例共享
//! 的可变状态只经由原子原语触达：PUBLISH、GETDEL、EVAL、EXISTS、
//! SETEX——绝不把读-改-写拆成两次往返。

pub mod auth;
pub mod memory;
pub mod rate_limit;
pub mod redis;
pub mod tickets;

pub use auth::{AuthError, BlacklistStore, Claims, InMemoryBlacklist, RedisBlacklist, TokenVerifier};
pub use memory::{InMemoryBlockList, InMemoryMembership, InMemoryMessageStore, InMemoryUserDirectory};
pub use rate_limit::{
    FailPolicy, InMemoryRateCounterStore, RateCounterStore, RateDecision, RateLimitError,
    RateLimiter, RedisRateCounterStore,
};
pub use self::redis::{EventHandler, Notifier, PatternSubscriber, RedisError, RedisResult};
pub use tickets::{InMemoryTicketStore, RedisTicketStore, Ticket, TicketError, TicketStore};
