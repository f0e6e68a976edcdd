//! 中枢错误定义
//!
//! 三类错误：准入错误（限流、屏蔽）调用方可稍后重试；校验错误原样
//! 返回给发送方，从不自动重试；存储错误中瞬时故障以"稍后再试"的
//! 形式呈现，约束冲突视为调用方缺陷，记日志并上抛。

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use domain::{ConversationId, DomainError, MessageId, RoomId, SessionId, StoreError, UserId};

/// 中枢层错误类型
#[derive(Debug, Error)]
pub enum HubError {
    /// 操作被限流
    #[error("操作被限流，{retry_after:?} 后可重试")]
    RateLimited { retry_after: Duration },

    /// 房间不存在
    #[error("房间不存在: {0}")]
    RoomNotFound(RoomId),

    /// 会话不存在
    #[error("会话不存在: {0}")]
    ConversationNotFound(ConversationId),

    /// 消息不存在
    #[error("消息不存在: {0}")]
    MessageNotFound(MessageId),

    /// 用户不是房间成员
    #[error("用户 {user_id} 不是房间 {room_id} 的成员")]
    NotAMember { room_id: RoomId, user_id: UserId },

    /// 用户不是会话参与者
    #[error("用户 {user_id} 不是会话 {conversation_id} 的参与者")]
    NotAParticipant {
        conversation_id: ConversationId,
        user_id: UserId,
    },

    /// 会话已被发送方屏蔽
    #[error("会话 {0} 已被屏蔽")]
    Blocked(ConversationId),

    /// 权限不足
    #[error("权限不足: {0}")]
    Forbidden(String),

    /// 房间已满
    #[error("房间已满: {0}")]
    RoomFull(RoomId),

    /// 内容校验失败
    #[error("消息内容不合法: {0}")]
    InvalidContent(String),

    /// 传输会话重复注册
    #[error("传输会话已注册: {0}")]
    DuplicateSession(SessionId),

    /// 存储暂时不可用（含持久化超时）
    #[error("存储暂时不可用，请稍后重试")]
    StoreUnavailable,

    /// 内部错误（意外故障，不应向客户端暴露细节）
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 拒绝原因的机器可读标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectKind {
    RateLimited,
    RoomNotFound,
    ConversationNotFound,
    MessageNotFound,
    NotAMember,
    NotAParticipant,
    Blocked,
    Forbidden,
    RoomFull,
    InvalidContent,
    DuplicateSession,
    Unavailable,
    Internal,
}

/// 返回给发送方的拒绝载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub kind: RejectKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl HubError {
    pub fn reject_kind(&self) -> RejectKind {
        match self {
            HubError::RateLimited { .. } => RejectKind::RateLimited,
            HubError::RoomNotFound(_) => RejectKind::RoomNotFound,
            HubError::ConversationNotFound(_) => RejectKind::ConversationNotFound,
            HubError::MessageNotFound(_) => RejectKind::MessageNotFound,
            HubError::NotAMember { .. } => RejectKind::NotAMember,
            HubError::NotAParticipant { .. } => RejectKind::NotAParticipant,
            HubError::Blocked(_) => RejectKind::Blocked,
            HubError::Forbidden(_) => RejectKind::Forbidden,
            HubError::RoomFull(_) => RejectKind::RoomFull,
            HubError::InvalidContent(_) => RejectKind::InvalidContent,
            HubError::DuplicateSession(_) => RejectKind::DuplicateSession,
            HubError::StoreUnavailable => RejectKind::Unavailable,
            HubError::Internal(_) => RejectKind::Internal,
        }
    }

    /// 准入类拒绝附带的重试提示
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            HubError::RateLimited { retry_after } => Some(retry_after.as_millis() as u64),
            HubError::StoreUnavailable => Some(1_000),
            _ => None,
        }
    }

    /// 是否属于意外内部故障（需要带上下文记录日志）
    pub fn is_internal(&self) -> bool {
        matches!(self, HubError::Internal(_))
    }

    pub fn rejection(&self) -> Rejection {
        Rejection {
            kind: self.reject_kind(),
            retry_after_ms: self.retry_after_ms(),
        }
    }
}

impl From<StoreError> for HubError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(_) => HubError::StoreUnavailable,
            // 约束冲突与意外缺失是调用方/数据缺陷，不重试
            StoreError::ConstraintViolation(message) => HubError::Internal(message),
            StoreError::NotFound(message) => HubError::Internal(message),
        }
    }
}

impl From<DomainError> for HubError {
    fn from(err: DomainError) -> Self {
        HubError::InvalidContent(err.to_string())
    }
}

/// 中枢层结果类型
pub type HubResult<T> = Result<T, HubError>;

/// 为存储调用加上超时上界；超时视为失败，不自动重试，也不产生部分扇出
pub(crate) async fn bounded_store_call<T, F>(limit: Duration, fut: F) -> HubResult<T>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(HubError::from(err)),
        Err(_) => Err(HubError::StoreUnavailable),
    }
}
