//! 出站帧与审计事件
//!
//! `ServerFrame` 是推送给活跃连接的载荷；`HubEvent` 是发往审计/通知
//! 接收端的事件，消费方异步处理，中枢从不等待。

use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, MessageId, RoomId, SessionId, UserId};
use crate::message::Message;
use crate::presence::UserStatus;
use crate::reaction::AggregateSnapshot;

/// 推送给客户端连接的帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// 新消息（房间或会话）
    MessageNew { message: Message },

    /// 消息内容被作者修改
    MessageEdited { message: Message },

    /// 某条消息的回应聚合更新
    ReactionUpdated {
        message_id: MessageId,
        snapshot: AggregateSnapshot,
    },

    /// 用户在线状态变化，None 表示离线
    PresenceChanged {
        user_id: UserId,
        status: Option<UserStatus>,
    },

    /// 房间内正在输入的用户集合变化
    TypingChanged {
        room_id: RoomId,
        user_ids: Vec<UserId>,
    },

    /// 用户加入房间
    MemberJoined { room_id: RoomId, user_id: UserId },

    /// 用户离开房间
    MemberLeft { room_id: RoomId, user_id: UserId },

    /// 消息置顶状态变化
    MessagePinned {
        room_id: RoomId,
        message_id: MessageId,
        pinned: bool,
    },
}

/// 审计/通知事件，发后即忘
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HubEvent {
    MessageSent {
        message_id: MessageId,
        author_id: UserId,
    },
    RoomCreated {
        room_id: RoomId,
        owner_id: UserId,
    },
    UserJoinedRoom {
        room_id: RoomId,
        user_id: UserId,
    },
    UserLeftRoom {
        room_id: RoomId,
        user_id: UserId,
    },
    ReactionAdded {
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
    },
    ReactionRemoved {
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
    },
    ConversationBlocked {
        conversation_id: ConversationId,
        user_id: UserId,
        blocked: bool,
    },
    ConnectionOpened {
        user_id: UserId,
        session_id: SessionId,
    },
    ConnectionClosed {
        user_id: UserId,
        session_id: SessionId,
    },
}
