//! 房间与成员关系实体

use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};
use crate::ids::{MessageId, RoomId, Timestamp, UserId};

/// 房间可见性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomVisibility {
    Public,
    Private,
}

/// 成员在房间内的角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomRole {
    Member,
    Moderator,
    Admin,
}

impl RoomRole {
    /// 是否具备管理操作（置顶、踢人）的权限
    pub fn can_moderate(&self) -> bool {
        matches!(self, RoomRole::Moderator | RoomRole::Admin)
    }
}

/// 成员的通知级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    All,
    Mentions,
    Muted,
}

/// 房间实体
///
/// 房间在本核心内从不物理删除，删除是外部管理动作。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub visibility: RoomVisibility,
    pub owner_id: UserId,
    pub member_count: u32,
    pub max_members: u32,
    pub created_at: Timestamp,
}

impl Room {
    /// 房间名称校验
    pub fn validate_name(name: &str) -> DomainResult<()> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(DomainError::invalid_argument("room_name", "cannot be empty"));
        }
        if trimmed.len() > 100 {
            return Err(DomainError::invalid_argument("room_name", "too long"));
        }
        Ok(())
    }

    /// 成员数是否已达上限
    pub fn is_full(&self) -> bool {
        self.max_members > 0 && self.member_count >= self.max_members
    }
}

/// 房间成员关系，(room_id, user_id) 唯一
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMember {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub role: RoomRole,
    pub notification_level: NotificationLevel,
    pub last_read_message: Option<MessageId>,
    pub joined_at: Timestamp,
}

impl RoomMember {
    pub fn new(room_id: RoomId, user_id: UserId, role: RoomRole, joined_at: Timestamp) -> Self {
        Self {
            room_id,
            user_id,
            role,
            notification_level: NotificationLevel::All,
            last_read_message: None,
            joined_at,
        }
    }

    pub fn promote(&mut self, role: RoomRole) {
        self.role = role;
    }

    pub fn record_last_read(&mut self, message_id: MessageId) {
        self.last_read_message = Some(message_id);
    }
}
