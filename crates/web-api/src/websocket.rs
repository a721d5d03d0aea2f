//! WebSocket 处理器
//!
//! 两个升级端点：`/api/ws/chat` 注册进房间级 ChatHub 并处理
//! join/leave/typing/message/read 客户端帧；`/api/ws/notifications`
//! 注册进用户级 Hub，只向下推送定向通知。
//!
//! 升级握手只接受单次票据（或非浏览器客户端的 Bearer 头），
//! 长效令牌不允许出现在 URL 里。

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use application::ClientHandle;
use domain::{
    Channel, ChatMessagePayload, Envelope, EventKind, Membership, MessageStore, RoomId,
    UserDirectory, UserId,
};
use infrastructure::{FailPolicy, RateDecision};

use crate::auth::authenticate;
use crate::error::ApiError;
use crate::state::AppState;

/// WebSocket 升级查询参数
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// 单次票据
    pub ticket: Option<String>,
}

/// 客户端帧
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Join {
        conversation_id: u64,
    },
    Leave {
        conversation_id: u64,
    },
    Typing {
        conversation_id: u64,
        is_typing: bool,
    },
    Message {
        conversation_id: u64,
        content: String,
        #[serde(default)]
        client_tag: Option<String>,
    },
    Read {
        conversation_id: u64,
    },
}

/// WebSocket 写操作命令
#[derive(Debug)]
enum WsCommand {
    SendText(String),
    SendPong(Vec<u8>),
}

/// 聊天连接升级
pub async fn chat_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user_id = authenticate(&state, query.ticket.as_deref(), &headers, None, true).await?;

    info!(user_id = %user_id, "WebSocket 聊天连接升级");
    Ok(ws.on_upgrade(move |socket| chat_socket(socket, user_id, state)))
}

/// 通知连接升级
pub async fn notifications_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user_id = authenticate(&state, query.ticket.as_deref(), &headers, None, true).await?;

    info!(user_id = %user_id, "WebSocket 通知连接升级");
    Ok(ws.on_upgrade(move |socket| notification_socket(socket, user_id, state)))
}

async fn resolve_username(state: &AppState, user_id: UserId) -> String {
    match state.users.username_of(user_id).await {
        Ok(Some(username)) => username,
        Ok(None) => format!("user-{}", user_id),
        Err(err) => {
            warn!(user_id = %user_id, error = %err, "用户名查询失败");
            format!("user-{}", user_id)
        }
    }
}

/// 聊天连接主循环
async fn chat_socket(socket: WebSocket, user_id: UserId, state: AppState) {
    let username = resolve_username(&state, user_id).await;

    let (handle, mut outbound) = ClientHandle::channel(user_id);
    let connection_id = handle.connection_id();

    if let Err(err) = state.chat_hub.register_user(handle.clone()).await {
        warn!(user_id = %user_id, error = %err, "ChatHub 注册失败");
        let mut socket = socket;
        let _ = socket
            .send(WsMessage::Text(
                Envelope::error(&err.to_string()).encode().unwrap_or_default().into(),
            ))
            .await;
        let _ = socket.close().await;
        return;
    }

    // 欢迎帧
    if let Ok(welcome) = Envelope::new(EventKind::Connected)
        .with_user(user_id)
        .with_username(username.clone())
        .encode()
    {
        handle.try_send(&welcome);
    }

    let (mut sender, mut incoming) = socket.split();
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(32);

    // 发送任务：统一处理所有对 WebSocket sender 的写操作
    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(cmd) = cmd_rx.recv() => {
                    match cmd {
                        WsCommand::SendText(text) => {
                            if sender.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        WsCommand::SendPong(data) => {
                            if sender.send(WsMessage::Pong(data.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Some(payload) = outbound.recv() => {
                    if sender.send(WsMessage::Text(payload.into())).await.is_err() {
                        break;
                    }
                }
                else => break,
            }
        }
        debug!("WebSocket 发送任务结束");
    });

    // 接收任务：处理来自客户端的帧
    let recv_state = state.clone();
    let recv_handle = handle.clone();
    let recv_username = username.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(message) = incoming.next().await {
            match message {
                Ok(WsMessage::Text(text)) => {
                    handle_client_frame(
                        &recv_state,
                        &recv_handle,
                        user_id,
                        &recv_username,
                        text.as_str(),
                    )
                    .await;
                }
                Ok(WsMessage::Ping(data)) => {
                    if cmd_tx.send(WsCommand::SendPong(data.to_vec())).await.is_err() {
                        break;
                    }
                }
                Ok(WsMessage::Close(_)) => {
                    debug!(user_id = %user_id, "客户端关闭连接");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(user_id = %user_id, error = %err, "WebSocket 读错误");
                    break;
                }
            }
        }
        debug!("WebSocket 接收任务结束");
    });

    // 任一任务结束即视为连接断开
    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    state.chat_hub.unregister_user(user_id, connection_id).await;
    info!(user_id = %user_id, "WebSocket 聊天连接已清理");
}

/// 通知连接主循环：只下行，不处理业务帧
async fn notification_socket(socket: WebSocket, user_id: UserId, state: AppState) {
    let (handle, mut outbound) = ClientHandle::channel(user_id);
    let connection_id = handle.connection_id();

    if let Err(err) = state.hub.register(handle).await {
        warn!(user_id = %user_id, error = %err, "Hub 注册失败");
        let mut socket = socket;
        let _ = socket.close().await;
        return;
    }

    let (mut sender, mut incoming) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = outbound.recv().await {
            if sender.send(WsMessage::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(message) = incoming.next().await {
            match message {
                Ok(WsMessage::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    state.hub.unregister(user_id, connection_id).await;
    info!(user_id = %user_id, "WebSocket 通知连接已清理");
}

/// 处理一帧客户端消息
///
/// 畸形帧丢弃并告警，循环继续。
async fn handle_client_frame(
    state: &AppState,
    handle: &ClientHandle,
    user_id: UserId,
    username: &str,
    text: &str,
) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(user_id = %user_id, error = %err, "无法解析的客户端帧已丢弃");
            return;
        }
    };

    match frame {
        ClientFrame::Join { conversation_id } => {
            handle_join(state, handle, user_id, username, RoomId(conversation_id)).await;
        }
        ClientFrame::Leave { conversation_id } => {
            handle_leave(state, user_id, username, RoomId(conversation_id)).await;
        }
        ClientFrame::Typing {
            conversation_id,
            is_typing,
        } => {
            handle_typing(state, user_id, username, RoomId(conversation_id), is_typing).await;
        }
        ClientFrame::Message {
            conversation_id,
            content,
            client_tag,
        } => {
            handle_message(
                state,
                handle,
                user_id,
                username,
                RoomId(conversation_id),
                content,
                client_tag,
            )
            .await;
        }
        ClientFrame::Read { conversation_id } => {
            handle_read(state, user_id, username, RoomId(conversation_id)).await;
        }
    }
}

/// 成员资格校验；仓储出错时按拒绝处理
async fn is_participant(state: &AppState, user_id: UserId, room_id: RoomId) -> bool {
    match state
        .membership
        .validate_room_membership(user_id, room_id)
        .await
    {
        Ok(valid) => valid,
        Err(err) => {
            warn!(user_id = %user_id, room_id = %room_id, error = %err, "成员资格校验失败");
            false
        }
    }
}

async fn handle_join(
    state: &AppState,
    handle: &ClientHandle,
    user_id: UserId,
    username: &str,
    room_id: RoomId,
) {
    if !is_participant(state, user_id, room_id).await {
        warn!(user_id = %user_id, room_id = %room_id, "非成员的 join 请求被忽略");
        return;
    }

    state.chat_hub.join(user_id, room_id).await;

    // 给本连接的确认帧
    if let Ok(confirmation) = Envelope::joined(room_id).encode() {
        handle.try_send(&confirmation);
    }

    // 房间内在线状态事件经 presence 频道扇出（回环覆盖本进程）
    let event = Envelope::new(EventKind::ParticipantJoined)
        .with_room(room_id)
        .with_user(user_id)
        .with_username(username);
    relay_or_broadcast(state, &Channel::Presence(room_id), room_id, &event).await;
}

async fn handle_leave(state: &AppState, user_id: UserId, username: &str, room_id: RoomId) {
    state.chat_hub.leave(user_id, room_id).await;

    let event = Envelope::new(EventKind::ParticipantLeft)
        .with_room(room_id)
        .with_user(user_id)
        .with_username(username);
    relay_or_broadcast(state, &Channel::Presence(room_id), room_id, &event).await;
}

async fn handle_typing(
    state: &AppState,
    user_id: UserId,
    username: &str,
    room_id: RoomId,
    is_typing: bool,
) {
    if !is_participant(state, user_id, room_id).await {
        return;
    }

    // 输入中指示限流：超限静默丢弃，不打扰用户
    let decision = state
        .rate_limiter
        .check(
            "typing",
            &format!("user:{}", user_id),
            10,
            Duration::from_secs(10),
            FailPolicy::FailOpen,
        )
        .await;
    if decision != RateDecision::Allowed {
        return;
    }

    match &state.notifier {
        Some(notifier) => {
            if let Err(err) = notifier
                .publish_typing(room_id, user_id, username, is_typing)
                .await
            {
                warn!(error = %err, "输入中指示发布失败");
            }
        }
        None => {
            // 单实例模式：进程内直投
            let payload = domain::TypingPayload {
                user_id,
                username: username.to_string(),
                is_typing,
                expires_in_ms: 5000,
            };
            if let Ok(event) = Envelope::new(EventKind::Typing)
                .with_room(room_id)
                .with_user(user_id)
                .with_username(username)
                .with_payload(&payload)
            {
                state.chat_hub.broadcast_to_room(room_id, &event).await;
            }
        }
    }
}

async fn handle_message(
    state: &AppState,
    handle: &ClientHandle,
    user_id: UserId,
    username: &str,
    room_id: RoomId,
    content: String,
    client_tag: Option<String>,
) {
    if content.is_empty() {
        return;
    }
    if !is_participant(state, user_id, room_id).await {
        return;
    }

    let decision = state
        .rate_limiter
        .check(
            "send_chat",
            &format!("user:{}", user_id),
            15,
            Duration::from_secs(60),
            FailPolicy::FailOpen,
        )
        .await;
    if decision != RateDecision::Allowed {
        if let Ok(notice) =
            Envelope::error("Rate limit exceeded. Please wait a moment.").encode()
        {
            handle.try_send(&notice);
        }
        return;
    }

    // 先落库：发布失败只降级实时性，不回滚已持久化的消息
    let stored = match state
        .messages
        .persist_message(room_id, user_id, &content)
        .await
    {
        Ok(stored) => stored,
        Err(err) => {
            warn!(user_id = %user_id, room_id = %room_id, error = %err, "消息持久化失败");
            if let Ok(notice) = Envelope::error("Failed to send message").encode() {
                handle.try_send(&notice);
            }
            return;
        }
    };

    let payload = ChatMessagePayload {
        id: stored.id,
        room_id,
        sender_id: user_id,
        content: stored.content,
        created_at: stored.created_at,
        client_tag,
    };

    // 双路径扇出：pub/sub 中继（type=message，回环覆盖本进程）
    // 加 进程内直投（type=room_message）。同一逻辑消息可能两次到达
    // 同一客户端，由客户端去重缓存折叠。
    if let Ok(relayed) = Envelope::new(EventKind::Message)
        .with_room(room_id)
        .with_user(user_id)
        .with_username(username)
        .with_payload(&payload)
    {
        publish_best_effort(state, &Channel::RoomMessages(room_id), &relayed).await;
    }

    if let Ok(direct) = Envelope::new(EventKind::RoomMessage)
        .with_room(room_id)
        .with_user(user_id)
        .with_username(username)
        .with_payload(&payload)
    {
        state.chat_hub.broadcast_to_room(room_id, &direct).await;
    }

    debug!(user_id = %user_id, room_id = %room_id, message_id = %stored.id, "消息已扇出");
}

async fn handle_read(state: &AppState, user_id: UserId, username: &str, room_id: RoomId) {
    if !is_participant(state, user_id, room_id).await {
        return;
    }

    if let Err(err) = state.messages.mark_read(room_id, user_id).await {
        warn!(user_id = %user_id, room_id = %room_id, error = %err, "已读位置更新失败");
        return;
    }

    let payload = domain::ReadPayload {
        conversation_id: room_id,
        user_id,
    };
    if let Ok(receipt) = Envelope::new(EventKind::Read)
        .with_room(room_id)
        .with_user(user_id)
        .with_username(username)
        .with_payload(&payload)
    {
        relay_or_broadcast(state, &Channel::RoomMessages(room_id), room_id, &receipt).await;
    }
}

/// fire-and-forget 发布；未配置共享介质时为 no-op
async fn publish_best_effort(state: &AppState, channel: &Channel, envelope: &Envelope) {
    let Some(notifier) = &state.notifier else {
        return;
    };
    let Ok(payload) = envelope.encode() else {
        warn!(channel = %channel, "信封序列化失败");
        return;
    };
    notifier.publish_best_effort(channel, &payload).await;
}

/// 有共享介质时走 pub/sub（订阅回环覆盖本进程成员），
/// 单实例模式退化为进程内直投
async fn relay_or_broadcast(
    state: &AppState,
    channel: &Channel,
    room_id: RoomId,
    envelope: &Envelope,
) {
    match &state.notifier {
        Some(_) => publish_best_effort(state, channel, envelope).await,
        None => {
            state.chat_hub.broadcast_to_room(room_id, envelope).await;
        }
    }
}
