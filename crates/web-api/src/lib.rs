//! Web API 层。
//!
//! 提供 Axum 路由：票据签发、WebSocket 升级握手、健康检查，
//! 以及把订阅回调接入进程内注册表的接线。

mod auth;
mod error;
mod routes;
mod state;
mod websocket;
mod wiring;

pub use auth::authenticate;
pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
pub use wiring::RealtimeWiring;
