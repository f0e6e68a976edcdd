//! 私聊会话实体
//!
//! 一个会话恰好包含两名参与者，用户对经过规范化（小 id 在前），
//! 因此 (A, B) 与 (B, A) 指向同一个会话。

use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};
use crate::ids::{ConversationId, Timestamp, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    /// 规范化后较小的用户 id
    pub user_low: UserId,
    /// 规范化后较大的用户 id
    pub user_high: UserId,
    /// user_low 是否屏蔽了该会话
    pub low_blocked: bool,
    /// user_high 是否屏蔽了该会话
    pub high_blocked: bool,
    pub created_at: Timestamp,
}

impl Conversation {
    /// 规范化用户对：小 id 在前，拒绝自己与自己的会话
    pub fn canonical_pair(a: UserId, b: UserId) -> DomainResult<(UserId, UserId)> {
        if a == b {
            return Err(DomainError::business_rule_violation(
                "conversation requires two distinct users",
            ));
        }
        if a < b {
            Ok((a, b))
        } else {
            Ok((b, a))
        }
    }

    pub fn participants(&self) -> [UserId; 2] {
        [self.user_low, self.user_high]
    }

    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.user_low == user_id || self.user_high == user_id
    }

    /// 对方参与者；非参与者返回 None
    pub fn peer_of(&self, user_id: UserId) -> Option<UserId> {
        if user_id == self.user_low {
            Some(self.user_high)
        } else if user_id == self.user_high {
            Some(self.user_low)
        } else {
            None
        }
    }

    /// 指定用户是否屏蔽了该会话
    pub fn blocked_by(&self, user_id: UserId) -> bool {
        (user_id == self.user_low && self.low_blocked)
            || (user_id == self.user_high && self.high_blocked)
    }

    /// 任意一方是否屏蔽
    pub fn is_blocked(&self) -> bool {
        self.low_blocked || self.high_blocked
    }

    /// 设置屏蔽标志，仅参与者可操作
    pub fn set_blocked(&mut self, user_id: UserId, blocked: bool) -> DomainResult<()> {
        if user_id == self.user_low {
            self.low_blocked = blocked;
            Ok(())
        } else if user_id == self.user_high {
            self.high_blocked = blocked;
            Ok(())
        } else {
            Err(DomainError::business_rule_violation(
                "only a participant may block a conversation",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation() -> Conversation {
        Conversation {
            id: ConversationId::new(1),
            user_low: UserId::new(1),
            user_high: UserId::new(2),
            low_blocked: false,
            high_blocked: false,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn canonical_pair_orders_and_rejects_self() {
        let (low, high) =
            Conversation::canonical_pair(UserId::new(9), UserId::new(3)).unwrap();
        assert_eq!(low, UserId::new(3));
        assert_eq!(high, UserId::new(9));
        assert!(Conversation::canonical_pair(UserId::new(3), UserId::new(3)).is_err());
    }

    #[test]
    fn blocking_is_per_participant() {
        let mut conv = conversation();
        conv.set_blocked(UserId::new(2), true).unwrap();
        assert!(conv.blocked_by(UserId::new(2)));
        assert!(!conv.blocked_by(UserId::new(1)));
        assert!(conv.is_blocked());
        // 第三方不能操作屏蔽
        assert!(conv.set_blocked(UserId::new(7), true).is_err());
    }

    #[test]
    fn peer_resolution() {
        let conv = conversation();
        assert_eq!(conv.peer_of(UserId::new(1)), Some(UserId::new(2)));
        assert_eq!(conv.peer_of(UserId::new(2)), Some(UserId::new(1)));
        assert_eq!(conv.peer_of(UserId::new(3)), None);
    }
}
