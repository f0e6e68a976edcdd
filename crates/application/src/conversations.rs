//! 私聊会话管理
//!
//! 同一会话内的消息持久化按会话加锁串行，不同会话完全并行。
//! 屏蔽语义：发送方自己屏蔽了会话时发送直接失败；对方屏蔽时消息
//! 照常持久化，但不向屏蔽方扇出，也不追溯隐藏历史。

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::warn;

use config::HubConfig;
use domain::{
    validate_content, Conversation, ConversationId, Message, MessageDraft, MessageId,
    MessageLocation, MessageStore, UserClass, UserId,
};

use crate::errors::{bounded_store_call, HubError, HubResult};
use crate::rate_limiter::{ActionKind, RateLimiter};

/// 私聊会话管理器
pub struct ConversationManager {
    store: Arc<dyn MessageStore>,
    limiter: Arc<RateLimiter>,
    send_locks: DashMap<ConversationId, Arc<Mutex<()>>>,
    persist_timeout: Duration,
    max_content_len: usize,
    history_page_limit: u32,
}

impl ConversationManager {
    pub fn new(store: Arc<dyn MessageStore>, limiter: Arc<RateLimiter>, cfg: &HubConfig) -> Self {
        Self {
            store,
            limiter,
            send_locks: DashMap::new(),
            persist_timeout: Duration::from_millis(cfg.persist_timeout_ms),
            max_content_len: cfg.max_content_len,
            history_page_limit: cfg.history_page_limit,
        }
    }

    /// 取或建两人会话，用户对先规范化，重复调用返回同一会话
    pub async fn get_or_create(&self, a: UserId, b: UserId) -> HubResult<Conversation> {
        let (low, high) = Conversation::canonical_pair(a, b)?;
        bounded_store_call(
            self.persist_timeout,
            self.store.get_or_create_conversation(low, high),
        )
        .await
    }

    /// 发送私聊消息，返回持久化后的消息与会话（扇出需要屏蔽标志）
    pub async fn send(
        &self,
        author_id: UserId,
        class: UserClass,
        conversation_id: ConversationId,
        content: &str,
        parent_id: Option<MessageId>,
    ) -> HubResult<(Message, Conversation)> {
        let conversation = self.fetch_required(conversation_id).await?;
        if !conversation.is_participant(author_id) {
            return Err(HubError::NotAParticipant {
                conversation_id,
                user_id: author_id,
            });
        }
        // 自己屏蔽的会话不能再发言；对方屏蔽只影响扇出
        if conversation.blocked_by(author_id) {
            return Err(HubError::Blocked(conversation_id));
        }

        validate_content(content, self.max_content_len)?;
        self.limiter.check(author_id, class, ActionKind::SendMessage)?;

        let lock = self.send_lock(conversation_id);
        let _guard = lock.lock().await;

        let draft = MessageDraft::new(
            author_id,
            MessageLocation::Conversation(conversation_id),
            content,
            parent_id,
        );
        let message =
            bounded_store_call(self.persist_timeout, self.store.persist_message(draft)).await?;

        if let Some(parent) = parent_id {
            if let Err(err) = bounded_store_call(
                self.persist_timeout,
                self.store.bump_thread_count(parent),
            )
            .await
            {
                warn!(
                    parent_id = %parent,
                    conversation_id = %conversation_id,
                    error = %err,
                    "回复计数递增失败"
                );
            }
        }

        Ok((message, conversation))
    }

    /// 设置/解除屏蔽，仅参与者可操作，返回更新后的会话
    pub async fn set_blocked(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        blocked: bool,
    ) -> HubResult<Conversation> {
        let conversation = self.fetch_required(conversation_id).await?;
        if !conversation.is_participant(user_id) {
            return Err(HubError::NotAParticipant {
                conversation_id,
                user_id,
            });
        }

        bounded_store_call(
            self.persist_timeout,
            self.store
                .set_conversation_blocked(conversation_id, user_id, blocked),
        )
        .await
    }

    /// 会话历史，按 id 降序游标分页；屏蔽不追溯隐藏历史
    pub async fn history(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> HubResult<Vec<Message>> {
        let conversation = self.fetch_required(conversation_id).await?;
        if !conversation.is_participant(user_id) {
            return Err(HubError::NotAParticipant {
                conversation_id,
                user_id,
            });
        }

        let limit = limit.clamp(1, self.history_page_limit);
        bounded_store_call(
            self.persist_timeout,
            self.store.fetch_messages(
                MessageLocation::Conversation(conversation_id),
                limit,
                before,
            ),
        )
        .await
    }

    pub(crate) async fn fetch_required(&self, id: ConversationId) -> HubResult<Conversation> {
        bounded_store_call(self.persist_timeout, self.store.fetch_conversation(id))
            .await?
            .ok_or(HubError::ConversationNotFound(id))
    }

    /// 回收当前无人持有的会话串行锁
    pub fn prune_send_locks(&self) {
        self.send_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    fn send_lock(&self, id: ConversationId) -> Arc<Mutex<()>> {
        self.send_locks.entry(id).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::memory_store::InMemoryMessageStore;
    use crate::rate_limiter::LimitPolicy;

    fn test_config() -> HubConfig {
        HubConfig {
            outbound_queue_capacity: 8,
            heartbeat_window_secs: 60,
            reap_interval_secs: 15,
            presence_ttl_secs: 90,
            typing_ttl_secs: 5,
            persist_timeout_ms: 1_000,
            max_content_len: 100,
            history_page_limit: 10,
            default_max_members: 100,
            reaction_sample_size: 3,
        }
    }

    fn generous_policy(_class: UserClass, _kind: ActionKind) -> LimitPolicy {
        LimitPolicy {
            capacity: 1_000,
            refill_per_sec: 1_000.0,
        }
    }

    fn manager() -> ConversationManager {
        ConversationManager::new(
            Arc::new(InMemoryMessageStore::new()),
            Arc::new(RateLimiter::with_policy(generous_policy)),
            &test_config(),
        )
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent_and_canonical() {
        let conversations = manager();
        let a = UserId::new(7);
        let b = UserId::new(3);

        let first = conversations.get_or_create(a, b).await.unwrap();
        let second = conversations.get_or_create(b, a).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.user_low, UserId::new(3));
        assert_eq!(first.user_high, UserId::new(7));
    }

    #[tokio::test]
    async fn self_conversation_is_rejected() {
        let conversations = manager();
        let err = conversations
            .get_or_create(UserId::new(1), UserId::new(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::InvalidContent(_)));
    }

    #[tokio::test]
    async fn send_and_history() {
        let conversations = manager();
        let a = UserId::new(1);
        let b = UserId::new(2);
        let conv = conversations.get_or_create(a, b).await.unwrap();

        let (message, _) = conversations
            .send(a, UserClass::Trusted, conv.id, "hi", None)
            .await
            .unwrap();
        assert_eq!(message.location, MessageLocation::Conversation(conv.id));

        let history = conversations.history(b, conv.id, 10, None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, message.id);
    }

    #[tokio::test]
    async fn outsider_cannot_send_or_read() {
        let conversations = manager();
        let conv = conversations
            .get_or_create(UserId::new(1), UserId::new(2))
            .await
            .unwrap();
        let outsider = UserId::new(9);

        let err = conversations
            .send(outsider, UserClass::New, conv.id, "hi", None)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::NotAParticipant { .. }));

        let err = conversations
            .history(outsider, conv.id, 10, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::NotAParticipant { .. }));
    }

    #[tokio::test]
    async fn sender_blocked_conversation_rejects_send() {
        let conversations = manager();
        let a = UserId::new(1);
        let b = UserId::new(2);
        let conv = conversations.get_or_create(a, b).await.unwrap();

        conversations.set_blocked(a, conv.id, true).await.unwrap();
        let err = conversations
            .send(a, UserClass::Trusted, conv.id, "hi", None)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Blocked(_)));

        // 对方屏蔽不阻止持久化，消息进入历史
        let (message, conv_after) = conversations
            .send(b, UserClass::Trusted, conv.id, "still here", None)
            .await
            .unwrap();
        assert!(conv_after.blocked_by(a));
        let history = conversations.history(a, conv.id, 10, None).await.unwrap();
        assert_eq!(history[0].id, message.id);
    }

    #[tokio::test]
    async fn unblock_restores_sending() {
        let conversations = manager();
        let a = UserId::new(1);
        let b = UserId::new(2);
        let conv = conversations.get_or_create(a, b).await.unwrap();

        conversations.set_blocked(a, conv.id, true).await.unwrap();
        conversations.set_blocked(a, conv.id, false).await.unwrap();
        assert!(conversations
            .send(a, UserClass::Trusted, conv.id, "back", None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn third_party_cannot_block() {
        let conversations = manager();
        let conv = conversations
            .get_or_create(UserId::new(1), UserId::new(2))
            .await
            .unwrap();

        let err = conversations
            .set_blocked(UserId::new(9), conv.id, true)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::NotAParticipant { .. }));
    }

    #[tokio::test]
    async fn unknown_conversation_is_reported() {
        let conversations = manager();
        let err = conversations
            .send(UserId::new(1), UserClass::New, ConversationId::new(404), "x", None)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::ConversationNotFound(_)));
    }
}
