//! 令牌桶限流器
//!
//! 按 (用户, 动作类型) 维护独立令牌桶，基于距上次补充的时间惰性补充，
//! 不需要后台定时器。桶永不超过容量、永不为负：被拒绝的尝试不消耗令牌。
//! 配额按用户信任等级查表，查表是纯函数，没有副作用。

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use domain::{UserClass, UserId};

/// 受限流约束的动作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    SendMessage,
    JoinRoom,
    CreateRoom,
    AddReaction,
    SetTyping,
    UploadReference,
}

/// 单个桶的策略：容量与每秒补充速率
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitPolicy {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

/// 限流判定结果。`Allow` 从不报错，只给出允许/拒绝与重试提示。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    /// 拒绝时，距下一个令牌可用的时间
    pub retry_after: Duration,
}

/// 按信任等级查配额，纯函数
pub fn policy_for(class: UserClass, kind: ActionKind) -> LimitPolicy {
    use ActionKind::*;
    use UserClass::*;

    let (capacity, refill_per_sec) = match (class, kind) {
        (New, SendMessage) => (30, 0.5),
        (Trusted, SendMessage) => (60, 1.0),
        (Moderator, SendMessage) => (120, 2.0),

        (New, JoinRoom) => (10, 0.2),
        (Trusted, JoinRoom) => (20, 0.5),
        (Moderator, JoinRoom) => (60, 1.0),

        (New, CreateRoom) => (2, 1.0 / 300.0),
        (Trusted, CreateRoom) => (5, 1.0 / 60.0),
        (Moderator, CreateRoom) => (20, 0.2),

        (New, AddReaction) => (30, 1.0),
        (Trusted, AddReaction) => (60, 2.0),
        (Moderator, AddReaction) => (120, 4.0),

        // 输入提示本身就高频，各等级一致
        (_, SetTyping) => (60, 2.0),

        (New, UploadReference) => (5, 1.0 / 60.0),
        (Trusted, UploadReference) => (10, 0.1),
        (Moderator, UploadReference) => (30, 0.5),
    };

    LimitPolicy {
        capacity,
        refill_per_sec,
    }
}

/// 策略查表函数类型，测试可注入快速补充的策略
pub type PolicyFn = fn(UserClass, ActionKind) -> LimitPolicy;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: u32, now: Instant) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill: now,
        }
    }

    /// 按流逝时间惰性补充，封顶到容量
    fn refill(&mut self, policy: LimitPolicy, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * policy.refill_per_sec)
                .min(policy.capacity as f64);
            self.last_refill = now;
        }
    }

    fn try_take(&mut self, policy: LimitPolicy, now: Instant) -> Decision {
        self.refill(policy, now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Decision {
                allowed: true,
                retry_after: Duration::ZERO,
            }
        } else {
            let deficit = 1.0 - self.tokens;
            let secs = if policy.refill_per_sec > 0.0 {
                deficit / policy.refill_per_sec
            } else {
                f64::MAX
            };
            Decision {
                allowed: false,
                retry_after: Duration::from_secs_f64(secs.min(86_400.0)),
            }
        }
    }

    fn idle_since(&self, now: Instant) -> Duration {
        now.duration_since(self.last_refill)
    }
}

/// 按 (用户, 动作类型) 分桶的限流器
pub struct RateLimiter {
    buckets: DashMap<(UserId, ActionKind), TokenBucket>,
    policy: PolicyFn,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_policy(policy_for)
    }

    /// 注入自定义策略查表（测试用）
    pub fn with_policy(policy: PolicyFn) -> Self {
        Self {
            buckets: DashMap::new(),
            policy,
        }
    }

    /// 限流判定。从不报错；拒绝不消耗令牌，由调用方把拒绝返回给发送方，
    /// 绝不静默丢弃。
    pub fn allow(&self, user_id: UserId, class: UserClass, kind: ActionKind) -> Decision {
        let policy = (self.policy)(class, kind);
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry((user_id, kind))
            .or_insert_with(|| TokenBucket::full(policy.capacity, now));
        bucket.try_take(policy, now)
    }

    /// `allow` 的错误形式：拒绝时转成带重试提示的限流错误
    pub fn check(
        &self,
        user_id: UserId,
        class: UserClass,
        kind: ActionKind,
    ) -> crate::errors::HubResult<()> {
        let decision = self.allow(user_id, class, kind);
        if decision.allowed {
            Ok(())
        } else {
            Err(crate::errors::HubError::RateLimited {
                retry_after: decision.retry_after,
            })
        }
    }

    /// 清理长期空闲的桶，防止内存无限增长
    pub fn cleanup_idle(&self, idle: Duration) {
        let now = Instant::now();
        self.buckets.retain(|_, bucket| bucket.idle_since(now) < idle);
    }

    /// 当前桶数量（观测用）
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn burst_policy(_class: UserClass, _kind: ActionKind) -> LimitPolicy {
        LimitPolicy {
            capacity: 5,
            refill_per_sec: 10.0, // 100ms 一个令牌
        }
    }

    #[test]
    fn exactly_capacity_calls_succeed() {
        let limiter = RateLimiter::with_policy(burst_policy);
        let user = UserId::new(1);

        for i in 0..5 {
            let decision = limiter.allow(user, UserClass::New, ActionKind::SendMessage);
            assert!(decision.allowed, "call {} should be allowed", i + 1);
        }

        let denied = limiter.allow(user, UserClass::New, ActionKind::SendMessage);
        assert!(!denied.allowed);
        assert!(denied.retry_after > Duration::ZERO);
    }

    #[test]
    fn denied_attempt_does_not_consume() {
        let limiter = RateLimiter::with_policy(burst_policy);
        let user = UserId::new(2);

        for _ in 0..5 {
            assert!(limiter.allow(user, UserClass::New, ActionKind::SendMessage).allowed);
        }
        // 连续多次拒绝后，等待一个补充间隔应恰好放行一次
        for _ in 0..10 {
            assert!(!limiter.allow(user, UserClass::New, ActionKind::SendMessage).allowed);
        }

        std::thread::sleep(Duration::from_millis(150));
        assert!(limiter.allow(user, UserClass::New, ActionKind::SendMessage).allowed);
        assert!(!limiter.allow(user, UserClass::New, ActionKind::SendMessage).allowed);
    }

    #[test]
    fn buckets_are_isolated_per_action_and_user() {
        let limiter = RateLimiter::with_policy(burst_policy);
        let a = UserId::new(3);
        let b = UserId::new(4);

        for _ in 0..5 {
            assert!(limiter.allow(a, UserClass::New, ActionKind::SendMessage).allowed);
        }
        assert!(!limiter.allow(a, UserClass::New, ActionKind::SendMessage).allowed);

        // 同用户的其它动作与其它用户不受影响
        assert!(limiter.allow(a, UserClass::New, ActionKind::JoinRoom).allowed);
        assert!(limiter.allow(b, UserClass::New, ActionKind::SendMessage).allowed);
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let limiter = RateLimiter::with_policy(burst_policy);
        let user = UserId::new(5);

        assert!(limiter.allow(user, UserClass::New, ActionKind::SendMessage).allowed);
        std::thread::sleep(Duration::from_millis(700));

        // 空闲远超补满所需时间，仍只能连续取出容量个
        for _ in 0..5 {
            assert!(limiter.allow(user, UserClass::New, ActionKind::SendMessage).allowed);
        }
        assert!(!limiter.allow(user, UserClass::New, ActionKind::SendMessage).allowed);
    }

    #[test]
    fn default_policy_varies_by_class() {
        let new = policy_for(UserClass::New, ActionKind::SendMessage);
        let moderator = policy_for(UserClass::Moderator, ActionKind::SendMessage);
        assert!(moderator.capacity > new.capacity);
        assert!(moderator.refill_per_sec > new.refill_per_sec);
    }

    #[test]
    fn cleanup_drops_idle_buckets() {
        let limiter = RateLimiter::with_policy(burst_policy);
        limiter.allow(UserId::new(6), UserClass::New, ActionKind::SendMessage);
        assert_eq!(limiter.bucket_count(), 1);

        std::thread::sleep(Duration::from_millis(50));
        limiter.cleanup_idle(Duration::from_millis(10));
        assert_eq!(limiter.bucket_count(), 0);
    }
}
