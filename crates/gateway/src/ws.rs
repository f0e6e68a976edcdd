//! WebSocket 处理器
//!
//! 连接升级时完成一次性鉴权，之后每条入站文本帧解析成操作信封交给
//! 中枢处理，处理结果（确认或拒绝）原路回给发送方。中枢的推送帧
//! 与操作回执共用同一个写端任务，单连接上的写入天然串行。

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use application::{OpEnvelope, OpOutcome, RejectKind, Rejection, SessionContext};
use domain::{SessionId, UserClass, UserId};

use crate::state::AppState;

/// WebSocket 连接查询参数
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// JWT access token
    pub token: String,
}

/// 操作回执帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireReply {
    /// 操作成功，载荷随操作类型变化
    Accepted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_request_id: Option<String>,
        #[serde(flatten)]
        outcome: OpOutcome,
    },
    /// 操作被拒绝，带机器可读原因与重试提示
    Rejected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_request_id: Option<String>,
        rejection: Rejection,
    },
}

/// 处理 WebSocket 连接升级，token 无效直接拒绝握手
pub async fn handle_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Result<Response, StatusCode> {
    if query.token.is_empty() {
        warn!("WebSocket 升级失败: token 为空");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let claims = match state.jwt_service.verify_token(&query.token) {
        Ok(claims) => claims,
        Err(err) => {
            warn!(error = %err, "WebSocket 升级失败: token 无效");
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    let user_id = claims.user_id();
    let class = claims.class;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user_id, class)))
}

/// 处理一条已鉴权的 WebSocket 连接，直到连接关闭
async fn handle_socket(socket: WebSocket, state: AppState, user_id: UserId, class: UserClass) {
    let session_id = SessionId::generate();
    let handle = match state.hub.connect(user_id, session_id) {
        Ok(handle) => handle,
        Err(err) => {
            warn!(user_id = %user_id, error = %err, "连接注册失败");
            return;
        }
    };
    let ctx = SessionContext {
        user_id,
        class,
        session_id,
    };

    let (mut sink, mut stream) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<WireReply>();
    let mut outbound = handle.outbound;

    // 写端任务：中枢推送帧与操作回执合流后串行写出
    let write_task = tokio::spawn(async move {
        loop {
            let serialized = tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(frame) => serde_json::to_string(&frame),
                    None => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(reply) => serde_json::to_string(&reply),
                    None => break,
                },
            };
            match serialized {
                Ok(json) => {
                    if sink.send(WsMessage::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "出站帧序列化失败");
                }
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(WsMessage::Text(text)) => {
                let envelope: OpEnvelope = match serde_json::from_str(&text) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        debug!(
                            user_id = %user_id,
                            session_id = %session_id,
                            error = %err,
                            "入站帧解析失败"
                        );
                        let reply = WireReply::Rejected {
                            client_request_id: None,
                            rejection: Rejection {
                                kind: RejectKind::InvalidContent,
                                retry_after_ms: None,
                            },
                        };
                        if reply_tx.send(reply).is_err() {
                            break;
                        }
                        continue;
                    }
                };

                let client_request_id = envelope.client_request_id.clone();
                let reply = match state.hub.dispatch(&ctx, envelope).await {
                    Ok(outcome) => WireReply::Accepted {
                        client_request_id,
                        outcome,
                    },
                    Err(err) => WireReply::Rejected {
                        client_request_id,
                        rejection: err.rejection(),
                    },
                };
                if reply_tx.send(reply).is_err() {
                    break;
                }
            }
            // 协议层 ping/pong 也算连接活着
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {
                state.hub.registry().heartbeat(session_id);
            }
            Ok(WsMessage::Binary(_)) => {
                debug!(session_id = %session_id, "忽略二进制帧");
            }
            Ok(WsMessage::Close(_)) => {
                info!(user_id = %user_id, session_id = %session_id, "客户端关闭连接");
                break;
            }
            Err(err) => {
                debug!(session_id = %session_id, error = %err, "连接读取错误");
                break;
            }
        }
    }

    state.hub.disconnect(session_id);
    write_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use application::ClientOp;

    #[test]
    fn accepted_reply_flattens_outcome() {
        let reply = WireReply::Accepted {
            client_request_id: Some("req-1".to_string()),
            outcome: OpOutcome::Ack,
        };

        let json: serde_json::Value = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "accepted");
        assert_eq!(json["client_request_id"], "req-1");
        assert_eq!(json["result"], "ack");
    }

    #[test]
    fn rejected_reply_carries_retry_hint() {
        let reply = WireReply::Rejected {
            client_request_id: None,
            rejection: Rejection {
                kind: RejectKind::RateLimited,
                retry_after_ms: Some(250),
            },
        };

        let json: serde_json::Value = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "rejected");
        assert_eq!(json["rejection"]["kind"], "rate_limited");
        assert_eq!(json["rejection"]["retry_after_ms"], 250);
        assert!(json.get("client_request_id").is_none());
    }

    #[test]
    fn inbound_envelope_parses_from_wire_json() {
        let envelope: OpEnvelope = serde_json::from_str(
            r#"{"client_request_id":"req-9","op":"typing","room_id":3,"active":true}"#,
        )
        .unwrap();

        assert_eq!(envelope.client_request_id.as_deref(), Some("req-9"));
        assert_eq!(
            envelope.op,
            ClientOp::Typing {
                room_id: domain::RoomId::new(3),
                active: true,
            }
        );
    }
}
