//! 房间管理
//!
//! 成员关系与房间活跃状态的内存视图按房间加锁，不同房间完全并行；
//! 同一房间的消息持久化在房间锁内串行，保证并发发帖的持久化 id
//! 顺序与接受顺序一致。成员关系的事实来源仍是存储层，内存视图在
//! 首次触达时惰性装载。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::warn;

use config::HubConfig;
use domain::{
    validate_content, Message, MessageDraft, MessageId, MessageLocation, MessageStore, Room,
    RoomId, RoomMember, RoomRole, RoomVisibility, Timestamp, UserClass, UserId,
};

use crate::errors::{bounded_store_call, HubError, HubResult};
use crate::rate_limiter::{ActionKind, RateLimiter};

struct RoomState {
    members: HashMap<UserId, RoomRole>,
    last_activity: Timestamp,
}

/// 房间管理器
pub struct RoomManager {
    store: Arc<dyn MessageStore>,
    limiter: Arc<RateLimiter>,
    rooms: DashMap<RoomId, Arc<Mutex<RoomState>>>,
    persist_timeout: Duration,
    max_content_len: usize,
    history_page_limit: u32,
    default_max_members: u32,
}

impl RoomManager {
    pub fn new(store: Arc<dyn MessageStore>, limiter: Arc<RateLimiter>, cfg: &HubConfig) -> Self {
        Self {
            store,
            limiter,
            rooms: DashMap::new(),
            persist_timeout: Duration::from_millis(cfg.persist_timeout_ms),
            max_content_len: cfg.max_content_len,
            history_page_limit: cfg.history_page_limit,
            default_max_members: cfg.default_max_members,
        }
    }

    /// 创建房间，创建者自动成为管理员成员
    pub async fn create_room(
        &self,
        owner_id: UserId,
        class: UserClass,
        name: &str,
        visibility: RoomVisibility,
        max_members: Option<u32>,
    ) -> HubResult<Room> {
        self.limiter.check(owner_id, class, ActionKind::CreateRoom)?;
        Room::validate_name(name)?;

        let mut room = bounded_store_call(
            self.persist_timeout,
            self.store.create_room(
                name.trim().to_string(),
                visibility,
                owner_id,
                max_members.unwrap_or(self.default_max_members),
            ),
        )
        .await?;

        let member = RoomMember::new(room.id, owner_id, RoomRole::Admin, room.created_at);
        bounded_store_call(self.persist_timeout, self.store.upsert_membership(member)).await?;
        room.member_count = 1;

        let mut members = HashMap::new();
        members.insert(owner_id, RoomRole::Admin);
        self.rooms.insert(
            room.id,
            Arc::new(Mutex::new(RoomState {
                members,
                last_activity: room.created_at,
            })),
        );

        Ok(room)
    }

    /// 加入房间，已是成员时幂等返回现有成员关系
    pub async fn join(
        &self,
        user_id: UserId,
        class: UserClass,
        room_id: RoomId,
    ) -> HubResult<RoomMember> {
        self.limiter.check(user_id, class, ActionKind::JoinRoom)?;

        let state = self.room_state(room_id).await?;
        let mut guard = state.lock().await;

        if guard.members.contains_key(&user_id) {
            let existing = bounded_store_call(
                self.persist_timeout,
                self.store.fetch_membership(room_id, user_id),
            )
            .await?;
            if let Some(member) = existing {
                return Ok(member);
            }
            // 内存视图领先于存储，继续走写入路径修复
        }

        let room = self.fetch_room_required(room_id).await?;
        if room.visibility == RoomVisibility::Private && room.owner_id != user_id {
            return Err(HubError::Forbidden("私密房间需要邀请".to_string()));
        }
        if guard.members.len() as u32 >= room.max_members && room.max_members > 0 {
            return Err(HubError::RoomFull(room_id));
        }

        let member = RoomMember::new(room_id, user_id, RoomRole::Member, chrono::Utc::now());
        let member =
            bounded_store_call(self.persist_timeout, self.store.upsert_membership(member)).await?;
        guard.members.insert(user_id, member.role);

        Ok(member)
    }

    /// 离开房间，非成员时为无操作
    pub async fn leave(&self, user_id: UserId, room_id: RoomId) -> HubResult<()> {
        let state = self.room_state(room_id).await?;
        let mut guard = state.lock().await;

        bounded_store_call(
            self.persist_timeout,
            self.store.remove_membership(room_id, user_id),
        )
        .await?;
        guard.members.remove(&user_id);
        Ok(())
    }

    /// 发布房间消息
    ///
    /// 前置条件依次为成员资格、内容校验、限流；通过后在房间锁内
    /// 持久化，由存储层分配持久化 id。父消息回复计数的递增失败
    /// 只记日志，不影响消息本身的成功。
    pub async fn post_message(
        &self,
        author_id: UserId,
        class: UserClass,
        room_id: RoomId,
        content: &str,
        parent_id: Option<MessageId>,
    ) -> HubResult<Message> {
        let state = self.room_state(room_id).await?;
        let mut guard = state.lock().await;

        if !guard.members.contains_key(&author_id) {
            return Err(HubError::NotAMember {
                room_id,
                user_id: author_id,
            });
        }
        validate_content(content, self.max_content_len)?;
        self.limiter.check(author_id, class, ActionKind::SendMessage)?;

        let draft = MessageDraft::new(
            author_id,
            MessageLocation::Room(room_id),
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
                warn!(parent_id = %parent, room_id = %room_id, error = %err, "回复计数递增失败");
            }
        }
        guard.last_activity = message.created_at;

        Ok(message)
    }

    /// 置顶/取消置顶，要求版主或管理员角色
    pub async fn pin(
        &self,
        moderator_id: UserId,
        room_id: RoomId,
        message_id: MessageId,
        pinned: bool,
    ) -> HubResult<()> {
        let state = self.room_state(room_id).await?;
        let guard = state.lock().await;

        match guard.members.get(&moderator_id) {
            Some(role) if role.can_moderate() => {}
            Some(_) => return Err(HubError::Forbidden("需要版主权限".to_string())),
            None => {
                return Err(HubError::NotAMember {
                    room_id,
                    user_id: moderator_id,
                })
            }
        }
        drop(guard);

        let message =
            bounded_store_call(self.persist_timeout, self.store.fetch_message(message_id))
                .await?
                .ok_or(HubError::MessageNotFound(message_id))?;
        if message.location != MessageLocation::Room(room_id) {
            return Err(HubError::MessageNotFound(message_id));
        }

        bounded_store_call(self.persist_timeout, self.store.set_pinned(message_id, pinned)).await
    }

    /// 修改自己发布的消息（房间或会话均可，位置不变）
    pub async fn edit_message(
        &self,
        author_id: UserId,
        message_id: MessageId,
        content: &str,
    ) -> HubResult<Message> {
        validate_content(content, self.max_content_len)?;

        let message =
            bounded_store_call(self.persist_timeout, self.store.fetch_message(message_id))
                .await?
                .ok_or(HubError::MessageNotFound(message_id))?;
        if message.author_id != author_id {
            return Err(HubError::Forbidden("只能修改自己的消息".to_string()));
        }

        bounded_store_call(
            self.persist_timeout,
            self.store.apply_edit(message_id, content.to_string()),
        )
        .await
    }

    /// 按 id 降序的游标式历史查询，单页上限由配置约束
    pub async fn history(
        &self,
        user_id: UserId,
        room_id: RoomId,
        limit: u32,
        before: Option<MessageId>,
    ) -> HubResult<Vec<Message>> {
        if !self.is_member(user_id, room_id).await? {
            return Err(HubError::NotAMember { room_id, user_id });
        }

        let limit = limit.clamp(1, self.history_page_limit);
        bounded_store_call(
            self.persist_timeout,
            self.store
                .fetch_messages(MessageLocation::Room(room_id), limit, before),
        )
        .await
    }

    /// 房间当前成员（扇出名单）
    pub async fn member_ids(&self, room_id: RoomId) -> HubResult<Vec<UserId>> {
        let state = self.room_state(room_id).await?;
        let guard = state.lock().await;
        Ok(guard.members.keys().copied().collect())
    }

    pub async fn is_member(&self, user_id: UserId, room_id: RoomId) -> HubResult<bool> {
        let state = self.room_state(room_id).await?;
        let guard = state.lock().await;
        Ok(guard.members.contains_key(&user_id))
    }

    async fn fetch_room_required(&self, room_id: RoomId) -> HubResult<Room> {
        bounded_store_call(self.persist_timeout, self.store.fetch_room(room_id))
            .await?
            .ok_or(HubError::RoomNotFound(room_id))
    }

    /// 房间状态的内存视图，首次触达时从存储装载
    async fn room_state(&self, room_id: RoomId) -> HubResult<Arc<Mutex<RoomState>>> {
        if let Some(state) = self.rooms.get(&room_id) {
            return Ok(state.clone());
        }

        let room = self.fetch_room_required(room_id).await?;
        let members = bounded_store_call(self.persist_timeout, self.store.list_members(room.id))
            .await?
            .into_iter()
            .map(|member| (member.user_id, member.role))
            .collect();
        let seeded = Arc::new(Mutex::new(RoomState {
            members,
            last_activity: room.created_at,
        }));

        // 并发装载时保留先到的那份
        Ok(self
            .rooms
            .entry(room_id)
            .or_insert(seeded)
            .clone())
    }
}
