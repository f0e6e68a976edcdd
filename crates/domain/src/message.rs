//! 消息实体
//!
//! 持久化 id 由存储层在写入成功时分配，客户端永远不生成 id。
//! 消息一经持久化不会丢失，删除只是软标记，保证其它持有者看到的
//! id 与顺序保持稳定。

use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};
use crate::ids::{ConversationId, MessageId, RoomId, Timestamp, UserId};

/// 消息内容校验：去除首尾空白后非空，且不超过长度上限（按字符计）
pub fn validate_content(content: &str, max_len: usize) -> DomainResult<()> {
    if content.trim().is_empty() {
        return Err(DomainError::invalid_argument("content", "cannot be empty"));
    }
    if content.chars().count() > max_len {
        return Err(DomainError::invalid_argument("content", "too long"));
    }
    Ok(())
}

/// 消息归属：恰好位于一个房间或一个会话中
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageLocation {
    Room(RoomId),
    Conversation(ConversationId),
}

impl MessageLocation {
    pub fn room_id(&self) -> Option<RoomId> {
        match self {
            MessageLocation::Room(id) => Some(*id),
            MessageLocation::Conversation(_) => None,
        }
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            MessageLocation::Room(_) => None,
            MessageLocation::Conversation(id) => Some(*id),
        }
    }
}

/// 持久化后的消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub author_id: UserId,
    pub location: MessageLocation,
    pub content: String,
    /// 线程/回复的父消息
    pub parent_id: Option<MessageId>,
    /// 直接回复本消息的数量
    pub thread_count: u32,
    pub edit_count: u32,
    pub pinned: bool,
    /// 软删除标记
    pub deleted: bool,
    pub created_at: Timestamp,
}

impl Message {
    pub fn is_visible(&self) -> bool {
        !self.deleted
    }
}

/// 待持久化的候选消息（尚无持久化 id）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub author_id: UserId,
    pub location: MessageLocation,
    pub content: String,
    pub parent_id: Option<MessageId>,
}

impl MessageDraft {
    pub fn new(
        author_id: UserId,
        location: MessageLocation,
        content: impl Into<String>,
        parent_id: Option<MessageId>,
    ) -> Self {
        Self {
            author_id,
            location,
            content: content.into(),
            parent_id,
        }
    }
}
