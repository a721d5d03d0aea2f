//! 路由定义

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use domain::{BlockList, Membership, MessageId, MessageStore, RoomId, StoredMessage};
use infrastructure::{FailPolicy, RateDecision, TicketStore};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::auth::authenticate;
use crate::error::ApiError;
use crate::state::AppState;
use crate::websocket;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/ws/ticket", post(issue_ticket))
        .route("/api/ws/chat", get(websocket::chat_upgrade))
        .route("/api/ws/notifications", get(websocket::notifications_upgrade))
        .route("/api/conversations/{room_id}/messages", get(recent_messages))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    redis: &'static str,
}

/// 健康检查
///
/// 共享介质降级只影响实时推送，不把 REST 路径报成硬故障。
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let redis = match &state.notifier {
        Some(notifier) => match notifier.ping().await {
            Ok(()) => "healthy",
            Err(_) => "unhealthy",
        },
        None => "disabled",
    };

    Json(HealthResponse {
        status: "healthy",
        redis,
    })
}

#[derive(Serialize)]
struct TicketResponse {
    ticket: String,
    ttl: u64,
}

/// 签发 WebSocket 票据
///
/// 认证走长效令牌；签出的票据短 TTL、单次使用，由流式握手消费。
async fn issue_ticket(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<TicketResponse>, ApiError> {
    let user_id = authenticate(&state, None, &headers, None, false).await?;

    let decision = state
        .rate_limiter
        .check(
            "ws_ticket",
            &format!("user:{}", user_id),
            30,
            Duration::from_secs(60),
            FailPolicy::FailOpen,
        )
        .await;
    if decision == RateDecision::Limited {
        return Err(ApiError::too_many_requests("rate limit exceeded"));
    }

    let ticket = state
        .tickets
        .issue(user_id, state.ticket_ttl_seconds)
        .await?;

    Ok(Json(TicketResponse {
        ticket: ticket.ticket,
        ttl: ticket.ttl,
    }))
}

#[derive(Deserialize)]
struct HistoryQuery {
    cursor: Option<u64>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct HistoryResponse {
    messages: Vec<HistoryMessage>,
    next_cursor: Option<MessageId>,
}

#[derive(Serialize)]
struct HistoryMessage {
    id: MessageId,
    sender_id: domain::UserId,
    content: String,
    created_at: domain::Timestamp,
}

impl From<StoredMessage> for HistoryMessage {
    fn from(message: StoredMessage) -> Self {
        Self {
            id: message.id,
            sender_id: message.sender_id,
            content: message.content,
            created_at: message.created_at,
        }
    }
}

/// 历史消息分页
///
/// 查看者屏蔽的作者在这里被过滤掉，实时路径不做逐收件人过滤。
async fn recent_messages(
    State(state): State<AppState>,
    Path(room_id): Path<u64>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> Result<Json<HistoryResponse>, ApiError> {
    let user_id = authenticate(&state, None, &headers, None, false).await?;
    let room_id = RoomId(room_id);

    if !state
        .membership
        .validate_room_membership(user_id, room_id)
        .await?
    {
        return Err(ApiError::forbidden("not a member of this conversation"));
    }

    let limit = query.limit.unwrap_or(50).min(100);
    let page = state
        .messages
        .fetch_recent_messages(room_id, query.cursor.map(MessageId), limit)
        .await?;

    let mut messages = Vec::with_capacity(page.messages.len());
    for message in page.messages {
        if state.blocks.is_blocked(user_id, message.sender_id).await? {
            continue;
        }
        messages.push(HistoryMessage::from(message));
    }

    Ok(Json(HistoryResponse {
        messages,
        next_cursor: page.next_cursor,
    }))
}
