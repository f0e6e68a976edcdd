//! 表情回应实体与聚合快照

use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};
use crate::ids::{MessageId, Timestamp, UserId};

/// emoji 的最大字节长度（复合 emoji 序列也在此范围内）
pub const MAX_EMOJI_LEN: usize = 32;

/// (message, user, emoji) 唯一三元组
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
    pub created_at: Timestamp,
}

/// 校验 emoji：非空、长度受限
pub fn validate_emoji(emoji: &str) -> DomainResult<()> {
    if emoji.trim().is_empty() {
        return Err(DomainError::invalid_argument("emoji", "cannot be empty"));
    }
    if emoji.len() > MAX_EMOJI_LEN {
        return Err(DomainError::invalid_argument("emoji", "too long"));
    }
    Ok(())
}

/// 单个 emoji 的聚合条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionEntry {
    pub emoji: String,
    pub count: u32,
    /// 请求快照的用户自己是否回应过
    pub reacted: bool,
    /// 展示用的部分回应者列表
    pub sample_users: Vec<UserId>,
}

/// 一条消息的表情聚合快照
///
/// `version` 单调递增：同一消息的新快照 version 永远不小于旧快照，
/// 客户端据此丢弃乱序到达的过期快照。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub message_id: MessageId,
    pub version: u64,
    pub entries: Vec<ReactionEntry>,
}

impl AggregateSnapshot {
    /// 总回应数
    pub fn total(&self) -> u32 {
        self.entries.iter().map(|e| e.count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emoji_validation() {
        assert!(validate_emoji("👍").is_ok());
        assert!(validate_emoji("").is_err());
        assert!(validate_emoji("  ").is_err());
        assert!(validate_emoji(&"👍".repeat(20)).is_err());
    }
}
