//! 聊天连接器
//!
//! 状态机：`Disconnected → Connecting → Open →（干净关闭:
//! Disconnected）|（意外断开: Backoff → Connecting）`。
//!
//! 每次进入 Connecting 都重新换取一张票据（从不复用旧票据），
//! 拼进连接地址；打开后重放全部已跟踪的房间成员资格，调用方
//! 无需手工重发 join。入站事件先过去重缓存再对账乐观状态。

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use domain::{ChatMessagePayload, Envelope, EventKind, RoomId};

use crate::backoff::{Backoff, ReconnectPolicy};
use crate::dedup::DedupCache;
use crate::reconcile::{OptimisticStore, Reconciliation};

/// 连接器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Backoff,
}

/// 连接器错误
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("ticket fetch failed: {0}")]
    TicketFetch(String),

    #[error("connect failed: {0}")]
    Connect(String),
}

/// 票据来源
///
/// 连接器对握手端点的唯一依赖；每次重连都要求一张全新票据。
#[async_trait]
pub trait TicketSource: Send + Sync {
    async fn fresh_ticket(&self) -> Result<String, ConnectorError>;
}

/// 经认证 REST 端点换取票据
pub struct HttpTicketSource {
    http: reqwest::Client,
    ticket_url: String,
    bearer_token: String,
}

#[derive(Deserialize)]
struct TicketResponse {
    ticket: String,
    #[allow(dead_code)]
    ttl: u64,
}

impl HttpTicketSource {
    pub fn new(base_url: &str, bearer_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            ticket_url: format!("{}/api/ws/ticket", base_url.trim_end_matches('/')),
            bearer_token: bearer_token.into(),
        }
    }
}

#[async_trait]
impl TicketSource for HttpTicketSource {
    async fn fresh_ticket(&self) -> Result<String, ConnectorError> {
        let response = self
            .http
            .post(&self.ticket_url)
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .map_err(|e| ConnectorError::TicketFetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ConnectorError::TicketFetch(format!(
                "ticket endpoint returned {}",
                response.status()
            )));
        }

        let body: TicketResponse = response
            .json()
            .await
            .map_err(|e| ConnectorError::TicketFetch(e.to_string()))?;
        Ok(body.ticket)
    }
}

/// 调用方下发的指令
#[derive(Debug, Clone)]
pub enum ConnectorCommand {
    Join(RoomId),
    Leave(RoomId),
    Send {
        room_id: RoomId,
        content: String,
        /// 乐观占位的关联 id，由调用方生成
        client_tag: String,
    },
    Typing {
        room_id: RoomId,
        is_typing: bool,
    },
    Read(RoomId),
    Shutdown,
}

/// 连接器上抛的事件
#[derive(Debug)]
pub enum ConnectorEvent {
    /// 连接已打开（含重连成功）
    Opened,
    /// 连接意外断开，进入退避重连
    ConnectionLost,
    /// 一条通过去重的入站事件
    Inbound {
        envelope: Envelope,
        /// 聊天消息附带对账结果；其余事件为 None
        reconciliation: Option<Reconciliation>,
    },
}

/// 一次连接会话的结束方式
enum SessionEnd {
    Clean,
    Unexpected,
}

/// 聊天连接器
pub struct ChatConnector {
    ws_url: String,
    tickets: Arc<dyn TicketSource>,
    backoff: Backoff,
    state: ConnectionState,
    /// 已跟踪的房间成员资格，重连后重放
    rooms: BTreeSet<RoomId>,
    dedup: DedupCache,
    optimistic: OptimisticStore,
    events: mpsc::UnboundedSender<ConnectorEvent>,
}

impl ChatConnector {
    pub fn new(
        ws_url: impl Into<String>,
        tickets: Arc<dyn TicketSource>,
        policy: ReconnectPolicy,
        optimistic: OptimisticStore,
        events: mpsc::UnboundedSender<ConnectorEvent>,
    ) -> Self {
        Self {
            ws_url: ws_url.into(),
            tickets,
            backoff: Backoff::new(policy),
            state: ConnectionState::Disconnected,
            rooms: BTreeSet::new(),
            dedup: DedupCache::default(),
            optimistic,
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// 主循环：连接、驱动、退避重连，直到 Shutdown 或指令通道关闭
    pub async fn run(mut self, mut commands: mpsc::Receiver<ConnectorCommand>) {
        loop {
            self.state = ConnectionState::Connecting;

            // 每次连接尝试都换新票据
            let ticket = match self.tickets.fresh_ticket().await {
                Ok(ticket) => ticket,
                Err(err) => {
                    warn!(error = %err, "票据获取失败");
                    self.wait_backoff().await;
                    continue;
                }
            };

            let url = format!("{}?ticket={}", self.ws_url, ticket);
            let stream = match connect_async(&url).await {
                Ok((stream, _response)) => stream,
                Err(err) => {
                    warn!(error = %err, "WebSocket 连接失败");
                    self.wait_backoff().await;
                    continue;
                }
            };

            self.state = ConnectionState::Open;
            self.backoff.reset();
            info!("连接已打开");
            let _ = self.events.send(ConnectorEvent::Opened);

            match self.drive(stream, &mut commands).await {
                SessionEnd::Clean => {
                    self.state = ConnectionState::Disconnected;
                    info!("连接干净关闭");
                    return;
                }
                SessionEnd::Unexpected => {
                    let _ = self.events.send(ConnectorEvent::ConnectionLost);
                    self.wait_backoff().await;
                }
            }
        }
    }

    async fn wait_backoff(&mut self) {
        self.state = ConnectionState::Backoff;
        let delay = self.backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, attempt = self.backoff.attempt(), "退避等待");
        tokio::time::sleep(delay).await;
    }

    /// 驱动一条已打开的连接
    async fn drive(
        &mut self,
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        commands: &mut mpsc::Receiver<ConnectorCommand>,
    ) -> SessionEnd {
        let (mut sink, mut inbound) = stream.split();

        // 重连后重放房间成员资格，服务端注册表恢复到断线前的状态
        for room_id in self.rooms.clone() {
            let frame = serde_json::json!({ "type": "join", "conversation_id": room_id });
            if sink.send(WsMessage::Text(frame.to_string().into())).await.is_err() {
                return SessionEnd::Unexpected;
            }
        }

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        // 调用方拆除了指令通道，按干净关闭处理
                        let _ = sink.send(WsMessage::Close(None)).await;
                        return SessionEnd::Clean;
                    };

                    match self.outbound_frame(command) {
                        OutboundAction::Send(frame) => {
                            if sink.send(WsMessage::Text(frame.into())).await.is_err() {
                                return SessionEnd::Unexpected;
                            }
                        }
                        OutboundAction::Close => {
                            let _ = sink.send(WsMessage::Close(None)).await;
                            return SessionEnd::Clean;
                        }
                        OutboundAction::None => {}
                    }
                }
                message = inbound.next() => {
                    match message {
                        Some(Ok(WsMessage::Text(text))) => {
                            if let Some(event) = self.apply_inbound(text.as_str()) {
                                let _ = self.events.send(event);
                            }
                        }
                        Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {}
                        Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => {
                            return SessionEnd::Unexpected;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    /// 把指令翻译成出站帧，同时维护成员资格与乐观占位
    fn outbound_frame(&mut self, command: ConnectorCommand) -> OutboundAction {
        match command {
            ConnectorCommand::Join(room_id) => {
                self.rooms.insert(room_id);
                OutboundAction::Send(
                    serde_json::json!({ "type": "join", "conversation_id": room_id }).to_string(),
                )
            }
            ConnectorCommand::Leave(room_id) => {
                self.rooms.remove(&room_id);
                OutboundAction::Send(
                    serde_json::json!({ "type": "leave", "conversation_id": room_id }).to_string(),
                )
            }
            ConnectorCommand::Send {
                room_id,
                content,
                client_tag,
            } => {
                self.optimistic
                    .insert_placeholder(client_tag.clone(), room_id, content.clone());
                OutboundAction::Send(
                    serde_json::json!({
                        "type": "message",
                        "conversation_id": room_id,
                        "content": content,
                        "client_tag": client_tag,
                    })
                    .to_string(),
                )
            }
            ConnectorCommand::Typing { room_id, is_typing } => OutboundAction::Send(
                serde_json::json!({
                    "type": "typing",
                    "conversation_id": room_id,
                    "is_typing": is_typing,
                })
                .to_string(),
            ),
            ConnectorCommand::Read(room_id) => OutboundAction::Send(
                serde_json::json!({ "type": "read", "conversation_id": room_id }).to_string(),
            ),
            ConnectorCommand::Shutdown => OutboundAction::Close,
        }
    }

    /// 应用一帧入站消息
    ///
    /// 聊天消息（`message` / `room_message` 两个别名）按
    /// (room, message-id) 去重：重复到达是扇出设计的产物，折叠成
    /// 一次应用。其余事件原样上抛；解码不了的帧丢弃并告警。
    pub fn apply_inbound(&mut self, raw: &str) -> Option<ConnectorEvent> {
        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "无法解码的入站帧已丢弃");
                return None;
            }
        };

        if matches!(envelope.kind, EventKind::Message | EventKind::RoomMessage) {
            let payload: ChatMessagePayload = match envelope.decode_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "聊天消息 payload 解码失败，已丢弃");
                    return None;
                }
            };

            let room_id = envelope.conversation_id.unwrap_or(payload.room_id);
            if !self.dedup.insert(room_id, payload.id) {
                debug!(room_id = %room_id, message_id = %payload.id, "重复消息已折叠");
                return None;
            }

            let reconciliation = self.optimistic.reconcile(&payload);
            return Some(ConnectorEvent::Inbound {
                envelope,
                reconciliation: Some(reconciliation),
            });
        }

        Some(ConnectorEvent::Inbound {
            envelope,
            reconciliation: None,
        })
    }

    /// 已跟踪的房间（测试用）
    pub fn tracked_rooms(&self) -> Vec<RoomId> {
        self.rooms.iter().copied().collect()
    }
}

enum OutboundAction {
    Send(String),
    Close,
    None,
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::UserId;

    struct NullTicketSource;

    #[async_trait]
    impl TicketSource for NullTicketSource {
        async fn fresh_ticket(&self) -> Result<String, ConnectorError> {
            Ok("ticket".to_string())
        }
    }

    fn connector() -> (ChatConnector, mpsc::UnboundedReceiver<ConnectorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ChatConnector::new(
                "ws://127.0.0.1:1/api/ws/chat",
                Arc::new(NullTicketSource),
                ReconnectPolicy::default(),
                OptimisticStore::new(UserId(1)),
                tx,
            ),
            rx,
        )
    }

    fn chat_frame(kind: &str, room: u64, id: u64, tag: Option<&str>) -> String {
        let mut payload = serde_json::json!({
            "id": id,
            "room_id": room,
            "sender_id": 1,
            "content": "hi",
            "created_at": "2025-06-01T00:00:00Z",
        });
        if let Some(tag) = tag {
            payload["client_tag"] = serde_json::json!(tag);
        }
        serde_json::json!({
            "type": kind,
            "conversation_id": room,
            "user_id": 1,
            "payload": payload,
        })
        .to_string()
    }

    #[test]
    fn test_dual_path_aliases_collapse_to_one_apply() {
        let (mut connector, _rx) = connector();

        // 同一逻辑消息经两条路径、两个事件名到达
        let first = connector.apply_inbound(&chat_frame("message", 7, 501, None));
        let second = connector.apply_inbound(&chat_frame("room_message", 7, 501, None));

        assert!(first.is_some());
        assert!(second.is_none(), "重复消息必须折叠");
    }

    #[test]
    fn test_distinct_messages_all_apply() {
        let (mut connector, _rx) = connector();
        assert!(connector.apply_inbound(&chat_frame("message", 7, 501, None)).is_some());
        assert!(connector.apply_inbound(&chat_frame("message", 7, 502, None)).is_some());
        assert!(connector.apply_inbound(&chat_frame("message", 8, 501, None)).is_some());
    }

    #[test]
    fn test_own_confirmation_reconciles_placeholder() {
        let (mut connector, _rx) = connector();
        let action = connector.outbound_frame(ConnectorCommand::Send {
            room_id: RoomId(7),
            content: "hi".to_string(),
            client_tag: "tag-1".to_string(),
        });
        assert!(matches!(action, OutboundAction::Send(_)));

        let event = connector
            .apply_inbound(&chat_frame("message", 7, 501, Some("tag-1")))
            .unwrap();
        match event {
            ConnectorEvent::Inbound { reconciliation, .. } => {
                assert_eq!(
                    reconciliation,
                    Some(Reconciliation::Replaced {
                        client_tag: "tag-1".to_string()
                    })
                );
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_foreign_message_is_fresh() {
        let (mut connector, _rx) = connector();
        let event = connector
            .apply_inbound(&chat_frame("room_message", 7, 501, None))
            .unwrap();
        match event {
            ConnectorEvent::Inbound { reconciliation, .. } => {
                assert_eq!(reconciliation, Some(Reconciliation::Fresh));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_and_unknown_frames_dropped() {
        let (mut connector, _rx) = connector();
        assert!(connector.apply_inbound("not json").is_none());
        assert!(connector
            .apply_inbound(r#"{"type":"wormhole","payload":null}"#)
            .is_none());
    }

    #[test]
    fn test_non_chat_events_pass_through_without_dedup() {
        let (mut connector, _rx) = connector();
        let frame = r#"{"type":"user_status","user_id":2,"payload":{"status":"online","user_id":2}}"#;

        // user_status 不携带消息 id，不参与去重
        assert!(connector.apply_inbound(frame).is_some());
        assert!(connector.apply_inbound(frame).is_some());
        assert_eq!(connector.dedup.len(), 0);
    }

    #[test]
    fn test_join_leave_tracks_rooms_for_rejoin() {
        let (mut connector, _rx) = connector();

        connector.outbound_frame(ConnectorCommand::Join(RoomId(7)));
        connector.outbound_frame(ConnectorCommand::Join(RoomId(9)));
        assert_eq!(connector.tracked_rooms(), vec![RoomId(7), RoomId(9)]);

        connector.outbound_frame(ConnectorCommand::Leave(RoomId(7)));
        assert_eq!(connector.tracked_rooms(), vec![RoomId(9)]);
    }

    #[test]
    fn test_typing_frame_shape() {
        let (mut connector, _rx) = connector();
        let action = connector.outbound_frame(ConnectorCommand::Typing {
            room_id: RoomId(7),
            is_typing: true,
        });
        let OutboundAction::Send(frame) = action else {
            panic!("expected outbound frame");
        };
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "typing");
        assert_eq!(value["conversation_id"], 7);
        assert_eq!(value["is_typing"], true);
    }

    #[test]
    fn test_dedup_uses_envelope_room_fallback() {
        let (mut connector, _rx) = connector();

        // conversation_id 缺失时退回 payload.room_id
        let frame = serde_json::json!({
            "type": "message",
            "payload": {
                "id": 1,
                "room_id": 7,
                "sender_id": 1,
                "content": "hi",
                "created_at": "2025-06-01T00:00:00Z",
            },
        })
        .to_string();

        assert!(connector.apply_inbound(&frame).is_some());
        assert!(connector.apply_inbound(&frame).is_none());
    }
}
