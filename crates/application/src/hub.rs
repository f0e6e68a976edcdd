//! 中枢编排
//!
//! 每个入站操作沿固定路径推进：校验 → 限流 → 持久化 → 扇出 → 确认，
//! 任一阶段失败立即短路为拒绝。消息在拿到持久化 id 之前绝不对任何
//! 接收方可见；持久化失败时不发生任何扇出。同一房间/会话的
//! 持久化与扇出在同一把细粒度锁内完成，保证接收方观察到的顺序
//! 与持久化 id 顺序一致，不同房间/会话之间完全并行。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use config::HubConfig;
use domain::{
    AggregateSnapshot, Conversation, ConversationId, HubEvent, Message, MessageId,
    MessageLocation, MessageStore, Room, RoomId, RoomMember, RoomVisibility, ServerFrame,
    SessionId, UserClass, UserId, UserStatus,
};

use crate::audit::AuditSink;
use crate::conversations::ConversationManager;
use crate::errors::{bounded_store_call, HubError, HubResult};
use crate::presence::PresenceTracker;
use crate::rate_limiter::{ActionKind, RateLimiter};
use crate::reactions::ReactionAggregator;
use crate::registry::{ConnectionHandle, ConnectionRegistry, ReapedConnection};
use crate::rooms::RoomManager;

/// 限流桶、串行锁与回应聚合的空闲回收阈值
const IDLE_STATE_TTL: Duration = Duration::from_secs(3600);

/// 一条连接握手后的身份上下文，认证由外部服务在握手时完成
#[derive(Debug, Clone, Copy)]
pub struct SessionContext {
    pub user_id: UserId,
    pub class: UserClass,
    pub session_id: SessionId,
}

/// 入站操作信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpEnvelope {
    /// 客户端请求关联 id，原样带回确认/拒绝
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_request_id: Option<String>,
    #[serde(flatten)]
    pub op: ClientOp,
}

/// 入站操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientOp {
    PostRoomMessage {
        room_id: RoomId,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<MessageId>,
    },
    SendDirect {
        conversation_id: ConversationId,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<MessageId>,
    },
    OpenConversation {
        peer_id: UserId,
    },
    JoinRoom {
        room_id: RoomId,
    },
    LeaveRoom {
        room_id: RoomId,
    },
    CreateRoom {
        name: String,
        visibility: RoomVisibility,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_members: Option<u32>,
    },
    PinMessage {
        room_id: RoomId,
        message_id: MessageId,
        pinned: bool,
    },
    EditMessage {
        message_id: MessageId,
        content: String,
    },
    AddReaction {
        message_id: MessageId,
        emoji: String,
    },
    RemoveReaction {
        message_id: MessageId,
        emoji: String,
    },
    SetBlocked {
        conversation_id: ConversationId,
        blocked: bool,
    },
    SetStatus {
        status: UserStatus,
    },
    Typing {
        room_id: RoomId,
        active: bool,
    },
    FetchRoomHistory {
        room_id: RoomId,
        #[serde(default = "default_history_limit")]
        limit: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<MessageId>,
    },
    FetchDirectHistory {
        conversation_id: ConversationId,
        #[serde(default = "default_history_limit")]
        limit: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<MessageId>,
    },
    Heartbeat,
}

fn default_history_limit() -> u32 {
    50
}

impl ClientOp {
    /// 操作种类（日志用）
    pub fn kind(&self) -> &'static str {
        match self {
            ClientOp::PostRoomMessage { .. } => "post_room_message",
            ClientOp::SendDirect { .. } => "send_direct",
            ClientOp::OpenConversation { .. } => "open_conversation",
            ClientOp::JoinRoom { .. } => "join_room",
            ClientOp::LeaveRoom { .. } => "leave_room",
            ClientOp::CreateRoom { .. } => "create_room",
            ClientOp::PinMessage { .. } => "pin_message",
            ClientOp::EditMessage { .. } => "edit_message",
            ClientOp::AddReaction { .. } => "add_reaction",
            ClientOp::RemoveReaction { .. } => "remove_reaction",
            ClientOp::SetBlocked { .. } => "set_blocked",
            ClientOp::SetStatus { .. } => "set_status",
            ClientOp::Typing { .. } => "typing",
            ClientOp::FetchRoomHistory { .. } => "fetch_room_history",
            ClientOp::FetchDirectHistory { .. } => "fetch_direct_history",
            ClientOp::Heartbeat => "heartbeat",
        }
    }
}

/// 操作成功时返回给发送方的载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum OpOutcome {
    Message { message: Message },
    Membership { member: RoomMember },
    Room { room: Room },
    Conversation { conversation: Conversation },
    Aggregate { snapshot: AggregateSnapshot },
    History { messages: Vec<Message> },
    Ack,
}

/// 连接与消息中枢
pub struct Hub {
    store: Arc<dyn MessageStore>,
    registry: Arc<ConnectionRegistry>,
    limiter: Arc<RateLimiter>,
    rooms: Arc<RoomManager>,
    conversations: Arc<ConversationManager>,
    reactions: Arc<ReactionAggregator>,
    presence: Arc<PresenceTracker>,
    audit: Arc<dyn AuditSink>,
    /// 持久化与扇出的按目标串行锁
    fanout_locks: DashMap<MessageLocation, Arc<Mutex<()>>>,
    cfg: HubConfig,
}

impl Hub {
    pub fn new(store: Arc<dyn MessageStore>, audit: Arc<dyn AuditSink>, cfg: HubConfig) -> Self {
        let limiter = Arc::new(RateLimiter::new());
        Self::with_limiter(store, audit, limiter, cfg)
    }

    /// 注入限流器（测试用快速策略）
    pub fn with_limiter(
        store: Arc<dyn MessageStore>,
        audit: Arc<dyn AuditSink>,
        limiter: Arc<RateLimiter>,
        cfg: HubConfig,
    ) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new(cfg.outbound_queue_capacity)),
            rooms: Arc::new(RoomManager::new(store.clone(), limiter.clone(), &cfg)),
            conversations: Arc::new(ConversationManager::new(
                store.clone(),
                limiter.clone(),
                &cfg,
            )),
            reactions: Arc::new(ReactionAggregator::new(store.clone(), &cfg)),
            presence: Arc::new(PresenceTracker::new(
                Duration::from_secs(cfg.presence_ttl_secs),
                Duration::from_secs(cfg.typing_ttl_secs),
            )),
            fanout_locks: DashMap::new(),
            store,
            limiter,
            audit,
            cfg,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// 握手完成后接入一条连接
    pub fn connect(&self, user_id: UserId, session_id: SessionId) -> HubResult<ConnectionHandle> {
        let handle = self.registry.register(session_id, user_id)?;
        self.presence.refresh(user_id);
        self.audit.emit(HubEvent::ConnectionOpened {
            user_id,
            session_id,
        });
        info!(user_id = %user_id, session_id = %session_id, "连接接入");
        Ok(handle)
    }

    /// 连接关闭（主动断开或传输错误），幂等
    pub fn disconnect(&self, session_id: SessionId) {
        if let Some(reaped) = self.registry.unregister(session_id) {
            self.finish_disconnect(&reaped);
            info!(
                user_id = %reaped.user_id,
                session_id = %session_id,
                last_for_user = reaped.last_for_user,
                "连接断开"
            );
        }
    }

    /// 启动心跳回收任务：超窗的连接被摘除并触发离线在线状态
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = self.clone();
        let window = Duration::from_secs(hub.cfg.heartbeat_window_secs);
        let interval = Duration::from_secs(hub.cfg.reap_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for reaped in hub.registry.reap_expired(window) {
                    warn!(
                        user_id = %reaped.user_id,
                        session_id = %reaped.session_id,
                        "心跳超时，回收连接"
                    );
                    hub.finish_disconnect(&reaped);
                }
                hub.prune_idle_state(IDLE_STATE_TTL);
            }
        })
    }

    /// 回收空闲的内存状态：限流桶、回应聚合、无人持有的串行锁
    pub fn prune_idle_state(&self, idle: Duration) {
        self.limiter.cleanup_idle(idle);
        self.reactions.evict_idle(idle);
        self.conversations.prune_send_locks();
        self.fanout_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// 处理一个入站操作，返回确认载荷或带原因的拒绝
    pub async fn dispatch(&self, ctx: &SessionContext, envelope: OpEnvelope) -> HubResult<OpOutcome> {
        // 任何入站流量都算连接活着
        self.registry.heartbeat(ctx.session_id);

        let kind = envelope.op.kind();
        let result = self.dispatch_inner(ctx, envelope.op).await;
        if let Err(err) = &result {
            if err.is_internal() {
                warn!(
                    user_id = %ctx.user_id,
                    session_id = %ctx.session_id,
                    op = kind,
                    error = %err,
                    "操作内部失败"
                );
            } else {
                debug!(
                    user_id = %ctx.user_id,
                    session_id = %ctx.session_id,
                    op = kind,
                    error = %err,
                    "操作被拒绝"
                );
            }
        }
        result
    }

    async fn dispatch_inner(&self, ctx: &SessionContext, op: ClientOp) -> HubResult<OpOutcome> {
        match op {
            ClientOp::PostRoomMessage {
                room_id,
                content,
                parent_id,
            } => self.post_room_message(ctx, room_id, &content, parent_id).await,
            ClientOp::SendDirect {
                conversation_id,
                content,
                parent_id,
            } => self.send_direct(ctx, conversation_id, &content, parent_id).await,
            ClientOp::OpenConversation { peer_id } => {
                let conversation = self.conversations.get_or_create(ctx.user_id, peer_id).await?;
                Ok(OpOutcome::Conversation { conversation })
            }
            ClientOp::JoinRoom { room_id } => self.join_room(ctx, room_id).await,
            ClientOp::LeaveRoom { room_id } => self.leave_room(ctx, room_id).await,
            ClientOp::CreateRoom {
                name,
                visibility,
                max_members,
            } => self.create_room(ctx, &name, visibility, max_members).await,
            ClientOp::PinMessage {
                room_id,
                message_id,
                pinned,
            } => self.pin_message(ctx, room_id, message_id, pinned).await,
            ClientOp::EditMessage { message_id, content } => {
                self.edit_message(ctx, message_id, &content).await
            }
            ClientOp::AddReaction { message_id, emoji } => {
                self.limiter
                    .check(ctx.user_id, ctx.class, ActionKind::AddReaction)?;
                self.apply_reaction(ctx, message_id, &emoji, true).await
            }
            ClientOp::RemoveReaction { message_id, emoji } => {
                self.apply_reaction(ctx, message_id, &emoji, false).await
            }
            ClientOp::SetBlocked {
                conversation_id,
                blocked,
            } => {
                let conversation = self
                    .conversations
                    .set_blocked(ctx.user_id, conversation_id, blocked)
                    .await?;
                self.audit.emit(HubEvent::ConversationBlocked {
                    conversation_id,
                    user_id: ctx.user_id,
                    blocked,
                });
                Ok(OpOutcome::Conversation { conversation })
            }
            ClientOp::SetStatus { status } => {
                self.presence.set_status(ctx.user_id, status);
                self.broadcast_presence(ctx.user_id, Some(status), &self.registry.rooms_of(ctx.user_id));
                Ok(OpOutcome::Ack)
            }
            ClientOp::Typing { room_id, active } => self.typing(ctx, room_id, active).await,
            ClientOp::FetchRoomHistory {
                room_id,
                limit,
                before,
            } => {
                let messages = self.rooms.history(ctx.user_id, room_id, limit, before).await?;
                Ok(OpOutcome::History { messages })
            }
            ClientOp::FetchDirectHistory {
                conversation_id,
                limit,
                before,
            } => {
                let messages = self
                    .conversations
                    .history(ctx.user_id, conversation_id, limit, before)
                    .await?;
                Ok(OpOutcome::History { messages })
            }
            ClientOp::Heartbeat => {
                self.presence.refresh(ctx.user_id);
                Ok(OpOutcome::Ack)
            }
        }
    }

    async fn post_room_message(
        &self,
        ctx: &SessionContext,
        room_id: RoomId,
        content: &str,
        parent_id: Option<MessageId>,
    ) -> HubResult<OpOutcome> {
        let lock = self.fanout_lock(MessageLocation::Room(room_id));
        let _serial = lock.lock().await;

        let message = self
            .rooms
            .post_message(ctx.user_id, ctx.class, room_id, content, parent_id)
            .await?;

        let members = self.rooms.member_ids(room_id).await?;
        let frame = ServerFrame::MessageNew {
            message: message.clone(),
        };
        self.registry
            .route_to_room(room_id, &members, &frame, Some(ctx.session_id));
        self.audit.emit(HubEvent::MessageSent {
            message_id: message.id,
            author_id: ctx.user_id,
        });

        Ok(OpOutcome::Message { message })
    }

    async fn send_direct(
        &self,
        ctx: &SessionContext,
        conversation_id: ConversationId,
        content: &str,
        parent_id: Option<MessageId>,
    ) -> HubResult<OpOutcome> {
        let lock = self.fanout_lock(MessageLocation::Conversation(conversation_id));
        let _serial = lock.lock().await;

        let (message, conversation) = self
            .conversations
            .send(ctx.user_id, ctx.class, conversation_id, content, parent_id)
            .await?;

        let frame = ServerFrame::MessageNew {
            message: message.clone(),
        };
        // 发送方的其它连接
        self.registry
            .route_to_user(ctx.user_id, &frame, Some(ctx.session_id));
        // 对方屏蔽了会话时不向其扇出，消息本身已持久化
        if let Some(peer) = conversation.peer_of(ctx.user_id) {
            if !conversation.blocked_by(peer) {
                self.registry.route_to_user(peer, &frame, None);
            }
        }
        self.audit.emit(HubEvent::MessageSent {
            message_id: message.id,
            author_id: ctx.user_id,
        });

        Ok(OpOutcome::Message { message })
    }

    async fn join_room(&self, ctx: &SessionContext, room_id: RoomId) -> HubResult<OpOutcome> {
        let member = self.rooms.join(ctx.user_id, ctx.class, room_id).await?;
        self.registry.subscribe(ctx.session_id, room_id);

        let members = self.rooms.member_ids(room_id).await?;
        let frame = ServerFrame::MemberJoined {
            room_id,
            user_id: ctx.user_id,
        };
        self.registry
            .route_to_room(room_id, &members, &frame, Some(ctx.session_id));
        self.audit.emit(HubEvent::UserJoinedRoom {
            room_id,
            user_id: ctx.user_id,
        });

        Ok(OpOutcome::Membership { member })
    }

    async fn leave_room(&self, ctx: &SessionContext, room_id: RoomId) -> HubResult<OpOutcome> {
        self.rooms.leave(ctx.user_id, room_id).await?;
        self.registry.unsubscribe(ctx.session_id, room_id);
        self.presence.stop_typing(room_id, ctx.user_id);

        let members = self.rooms.member_ids(room_id).await?;
        let frame = ServerFrame::MemberLeft {
            room_id,
            user_id: ctx.user_id,
        };
        self.registry.route_to_room(room_id, &members, &frame, None);
        self.audit.emit(HubEvent::UserLeftRoom {
            room_id,
            user_id: ctx.user_id,
        });

        Ok(OpOutcome::Ack)
    }

    async fn create_room(
        &self,
        ctx: &SessionContext,
        name: &str,
        visibility: RoomVisibility,
        max_members: Option<u32>,
    ) -> HubResult<OpOutcome> {
        let room = self
            .rooms
            .create_room(ctx.user_id, ctx.class, name, visibility, max_members)
            .await?;
        self.registry.subscribe(ctx.session_id, room.id);
        self.audit.emit(HubEvent::RoomCreated {
            room_id: room.id,
            owner_id: ctx.user_id,
        });

        Ok(OpOutcome::Room { room })
    }

    async fn pin_message(
        &self,
        ctx: &SessionContext,
        room_id: RoomId,
        message_id: MessageId,
        pinned: bool,
    ) -> HubResult<OpOutcome> {
        self.rooms.pin(ctx.user_id, room_id, message_id, pinned).await?;

        let members = self.rooms.member_ids(room_id).await?;
        let frame = ServerFrame::MessagePinned {
            room_id,
            message_id,
            pinned,
        };
        self.registry.route_to_room(room_id, &members, &frame, None);

        Ok(OpOutcome::Ack)
    }

    async fn edit_message(
        &self,
        ctx: &SessionContext,
        message_id: MessageId,
        content: &str,
    ) -> HubResult<OpOutcome> {
        let message = self.rooms.edit_message(ctx.user_id, message_id, content).await?;

        let frame = ServerFrame::MessageEdited {
            message: message.clone(),
        };
        match message.location {
            MessageLocation::Room(room_id) => {
                let members = self.rooms.member_ids(room_id).await?;
                self.registry
                    .route_to_room(room_id, &members, &frame, Some(ctx.session_id));
            }
            MessageLocation::Conversation(conversation_id) => {
                let conversation = self.conversations.fetch_required(conversation_id).await?;
                // 编辑方的其它连接
                self.registry
                    .route_to_user(ctx.user_id, &frame, Some(ctx.session_id));
                // 与发送一致：对方屏蔽会话时不向其扇出
                if let Some(peer) = conversation.peer_of(ctx.user_id) {
                    if !conversation.blocked_by(peer) {
                        self.registry.route_to_user(peer, &frame, None);
                    }
                }
            }
        }

        Ok(OpOutcome::Message { message })
    }

    async fn apply_reaction(
        &self,
        ctx: &SessionContext,
        message_id: MessageId,
        emoji: &str,
        add: bool,
    ) -> HubResult<OpOutcome> {
        let audience = self.reaction_audience(ctx.user_id, message_id).await?;

        let snapshot = if add {
            self.reactions.add(ctx.user_id, message_id, emoji).await?
        } else {
            self.reactions.remove(ctx.user_id, message_id, emoji).await?
        };

        let frame = ServerFrame::ReactionUpdated {
            message_id,
            snapshot: snapshot.clone(),
        };
        for user_id in &audience {
            self.registry.route_to_user(*user_id, &frame, None);
        }
        self.audit.emit(if add {
            HubEvent::ReactionAdded {
                message_id,
                user_id: ctx.user_id,
                emoji: emoji.to_string(),
            }
        } else {
            HubEvent::ReactionRemoved {
                message_id,
                user_id: ctx.user_id,
                emoji: emoji.to_string(),
            }
        });

        Ok(OpOutcome::Aggregate { snapshot })
    }

    async fn typing(
        &self,
        ctx: &SessionContext,
        room_id: RoomId,
        active: bool,
    ) -> HubResult<OpOutcome> {
        if !self.rooms.is_member(ctx.user_id, room_id).await? {
            return Err(HubError::NotAMember {
                room_id,
                user_id: ctx.user_id,
            });
        }
        if active {
            self.limiter
                .check(ctx.user_id, ctx.class, ActionKind::SetTyping)?;
            self.presence.start_typing(room_id, ctx.user_id);
        } else {
            self.presence.stop_typing(room_id, ctx.user_id);
        }

        let frame = ServerFrame::TypingChanged {
            room_id,
            user_ids: self.presence.typing_snapshot(room_id),
        };
        let members = self.rooms.member_ids(room_id).await?;
        self.registry
            .route_to_room(room_id, &members, &frame, Some(ctx.session_id));

        Ok(OpOutcome::Ack)
    }

    /// 回应操作的访问检查与扇出名单：房间消息要求成员资格，
    /// 会话消息要求参与者身份
    async fn reaction_audience(
        &self,
        user_id: UserId,
        message_id: MessageId,
    ) -> HubResult<Vec<UserId>> {
        let timeout = Duration::from_millis(self.cfg.persist_timeout_ms);
        let message = bounded_store_call(timeout, self.store.fetch_message(message_id))
            .await?
            .ok_or(HubError::MessageNotFound(message_id))?;

        match message.location {
            MessageLocation::Room(room_id) => {
                if !self.rooms.is_member(user_id, room_id).await? {
                    return Err(HubError::NotAMember { room_id, user_id });
                }
                self.rooms.member_ids(room_id).await
            }
            MessageLocation::Conversation(conversation_id) => {
                let conversation =
                    bounded_store_call(timeout, self.store.fetch_conversation(conversation_id))
                        .await?
                        .ok_or(HubError::ConversationNotFound(conversation_id))?;
                if !conversation.is_participant(user_id) {
                    return Err(HubError::NotAParticipant {
                        conversation_id,
                        user_id,
                    });
                }
                Ok(conversation.participants().to_vec())
            }
        }
    }

    /// 连接彻底断开后的收尾：最后一条连接才触发离线广播
    fn finish_disconnect(&self, reaped: &ReapedConnection) {
        self.audit.emit(HubEvent::ConnectionClosed {
            user_id: reaped.user_id,
            session_id: reaped.session_id,
        });
        if reaped.last_for_user {
            self.presence.clear(reaped.user_id);
            self.broadcast_presence(reaped.user_id, None, &reaped.rooms);
        }
    }

    /// 把在线状态变化推给相关房间的在线订阅者
    fn broadcast_presence(
        &self,
        user_id: UserId,
        status: Option<UserStatus>,
        rooms: &HashSet<RoomId>,
    ) {
        let mut audience: HashSet<UserId> = HashSet::new();
        for room_id in rooms {
            audience.extend(self.registry.room_audience(*room_id));
        }
        audience.remove(&user_id);
        if audience.is_empty() {
            return;
        }

        let frame = ServerFrame::PresenceChanged { user_id, status };
        for target in audience {
            self.registry.route_to_user(target, &frame, None);
        }
    }

    fn fanout_lock(&self, location: MessageLocation) -> Arc<Mutex<()>> {
        self.fanout_locks.entry(location).or_default().clone()
    }
}
