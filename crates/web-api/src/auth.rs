//! 握手认证
//!
//! 每次认证尝试走同一个状态机：先查票据，票据缺席或端点允许时
//! 退到令牌。两条路径最终都解析出一个身份，挂到请求/连接的余下
//! 生命周期上——系统的其他部分不再独立推导身份。
//!
//! 票据与令牌只在显式允许两者的端点上可互换：WebSocket 端点上
//! 出示了票据但无效时立即失败，绝不静默落回令牌路径。

use axum::http::HeaderMap;
use domain::UserId;
use infrastructure::TicketStore;
use tracing::warn;

use crate::error::ApiError;
use crate::state::AppState;

/// 从 Authorization 头提取 Bearer 令牌
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

/// 统一认证入口
///
/// `is_ws_path` 为 true 时票据是严格要求：出示了无效票据不落回
/// 令牌，令牌也不接受 query 参数形式（必须走票据）。
pub async fn authenticate(
    state: &AppState,
    ticket: Option<&str>,
    headers: &HeaderMap,
    token_query: Option<&str>,
    is_ws_path: bool,
) -> Result<UserId, ApiError> {
    // 1. 票据优先（短 TTL、单次使用）
    if let Some(ticket) = ticket.filter(|t| !t.is_empty()) {
        match state.tickets.redeem(ticket).await {
            Ok(Some(user_id)) => return Ok(user_id),
            Ok(None) => {
                if is_ws_path {
                    warn!("WebSocket 升级失败：票据无效或已消费");
                    return Err(ApiError::unauthorized("Invalid or expired WebSocket ticket"));
                }
                // 非 WS 端点允许落回令牌路径
            }
            Err(err) => {
                warn!(error = %err, "票据存储不可达");
                return Err(ApiError::service_unavailable("ticket store unavailable"));
            }
        }
    }

    // 2. 落回长效会话令牌
    let mut token = bearer_token(headers);
    if token.is_none() && !is_ws_path {
        // WS 路由拒绝 query 里的长效令牌，避免它泄漏进 URL
        token = token_query.filter(|t| !t.is_empty());
    }

    let Some(token) = token else {
        return Err(ApiError::unauthorized("Authorization required"));
    };

    let user_id = state.token_verifier.verify(token).await?;
    Ok(user_id)
}
