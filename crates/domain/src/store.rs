//! 持久化存储接口
//!
//! 核心通过这个窄接口访问关系型存储。持久化 id 与消息顺序由存储层
//! 在写入成功时分配；接口的各实现（内存、PostgreSQL）必须保证
//! 同一房间/会话内 id 单调递增。

use async_trait::async_trait;

use crate::conversation::Conversation;
use crate::errors::StoreResult;
use crate::ids::{ConversationId, MessageId, RoomId, UserId};
use crate::message::{Message, MessageDraft, MessageLocation};
use crate::reaction::Reaction;
use crate::room::{Room, RoomMember, RoomVisibility};

#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// 持久化候选消息，分配持久化 id 与 created_at
    async fn persist_message(&self, draft: MessageDraft) -> StoreResult<Message>;

    /// 根据 id 查找消息
    async fn fetch_message(&self, id: MessageId) -> StoreResult<Option<Message>>;

    /// 按 id 降序取历史消息，`before` 为游标（不含该条）
    async fn fetch_messages(
        &self,
        location: MessageLocation,
        limit: u32,
        before: Option<MessageId>,
    ) -> StoreResult<Vec<Message>>;

    /// 父消息的回复计数 +1
    async fn bump_thread_count(&self, parent_id: MessageId) -> StoreResult<()>;

    /// 置顶/取消置顶
    async fn set_pinned(&self, id: MessageId, pinned: bool) -> StoreResult<()>;

    /// 修改消息内容，edit_count +1，返回更新后的消息
    async fn apply_edit(&self, id: MessageId, content: String) -> StoreResult<Message>;

    /// 创建房间
    async fn create_room(
        &self,
        name: String,
        visibility: RoomVisibility,
        owner_id: UserId,
        max_members: u32,
    ) -> StoreResult<Room>;

    /// 查找房间（member_count 为当前成员数）
    async fn fetch_room(&self, id: RoomId) -> StoreResult<Option<Room>>;

    /// 写入/更新成员关系，(room_id, user_id) 唯一
    async fn upsert_membership(&self, member: RoomMember) -> StoreResult<RoomMember>;

    /// 删除成员关系，幂等
    async fn remove_membership(&self, room_id: RoomId, user_id: UserId) -> StoreResult<()>;

    /// 查找成员关系
    async fn fetch_membership(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> StoreResult<Option<RoomMember>>;

    /// 房间全部成员
    async fn list_members(&self, room_id: RoomId) -> StoreResult<Vec<RoomMember>>;

    /// 取或建会话，用户对已由调用方规范化
    async fn get_or_create_conversation(
        &self,
        user_low: UserId,
        user_high: UserId,
    ) -> StoreResult<Conversation>;

    /// 查找会话
    async fn fetch_conversation(&self, id: ConversationId)
        -> StoreResult<Option<Conversation>>;

    /// 更新会话某一方的屏蔽标志，返回更新后的会话
    async fn set_conversation_blocked(
        &self,
        id: ConversationId,
        user_id: UserId,
        blocked: bool,
    ) -> StoreResult<Conversation>;

    /// 插入回应三元组；已存在时返回 false（幂等）
    async fn upsert_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
    ) -> StoreResult<bool>;

    /// 删除回应三元组；不存在时返回 false（幂等）
    async fn remove_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
    ) -> StoreResult<bool>;

    /// 一条消息的全部回应（用于聚合冷启动）
    async fn fetch_reactions(&self, message_id: MessageId) -> StoreResult<Vec<Reaction>>;
}
