//! PostgreSQL 版消息存储
//!
//! 持久化 id 由 BIGSERIAL 分配，同一房间/会话内天然单调。
//! 唯一键冲突映射为约束冲突（调用方缺陷），连接类故障映射为
//! 瞬时不可用，由调用方决定是否重试。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use domain::{
    Conversation, ConversationId, Message, MessageDraft, MessageId, MessageLocation,
    MessageStore, NotificationLevel, Reaction, Room, RoomId, RoomMember, RoomRole,
    RoomVisibility, StoreError, StoreResult, UserId,
};

fn map_sqlx_err(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::RowNotFound => StoreError::not_found(err.to_string()),
        sqlx::Error::Database(db) if db.is_unique_violation() || db.is_foreign_key_violation() => {
            StoreError::constraint_violation(db.to_string())
        }
        _ => StoreError::unavailable(err.to_string()),
    }
}

fn invalid_data(message: impl Into<String>) -> StoreError {
    StoreError::ConstraintViolation(message.into())
}

#[derive(Debug, FromRow)]
struct RoomRecord {
    id: i64,
    name: String,
    visibility: String,
    owner_id: i64,
    max_members: i32,
    member_count: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<RoomRecord> for Room {
    type Error = StoreError;

    fn try_from(value: RoomRecord) -> Result<Self, Self::Error> {
        Ok(Room {
            id: RoomId::from(value.id),
            name: value.name,
            visibility: parse_visibility(&value.visibility)?,
            owner_id: UserId::from(value.owner_id),
            member_count: value.member_count as u32,
            max_members: value.max_members as u32,
            created_at: value.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct MemberRecord {
    room_id: i64,
    user_id: i64,
    role: String,
    notification_level: String,
    last_read_message_id: Option<i64>,
    joined_at: DateTime<Utc>,
}

impl TryFrom<MemberRecord> for RoomMember {
    type Error = StoreError;

    fn try_from(value: MemberRecord) -> Result<Self, Self::Error> {
        Ok(RoomMember {
            room_id: RoomId::from(value.room_id),
            user_id: UserId::from(value.user_id),
            role: parse_role(&value.role)?,
            notification_level: parse_notification_level(&value.notification_level)?,
            last_read_message: value.last_read_message_id.map(MessageId::from),
            joined_at: value.joined_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRecord {
    id: i64,
    user_low: i64,
    user_high: i64,
    low_blocked: bool,
    high_blocked: bool,
    created_at: DateTime<Utc>,
}

impl From<ConversationRecord> for Conversation {
    fn from(value: ConversationRecord) -> Self {
        Conversation {
            id: ConversationId::from(value.id),
            user_low: UserId::from(value.user_low),
            user_high: UserId::from(value.user_high),
            low_blocked: value.low_blocked,
            high_blocked: value.high_blocked,
            created_at: value.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: i64,
    author_id: i64,
    room_id: Option<i64>,
    conversation_id: Option<i64>,
    content: String,
    parent_id: Option<i64>,
    thread_count: i32,
    edit_count: i32,
    pinned: bool,
    deleted: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRecord> for Message {
    type Error = StoreError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        let location = match (value.room_id, value.conversation_id) {
            (Some(room_id), None) => MessageLocation::Room(RoomId::from(room_id)),
            (None, Some(conversation_id)) => {
                MessageLocation::Conversation(ConversationId::from(conversation_id))
            }
            _ => {
                return Err(invalid_data(format!(
                    "message {} has inconsistent location",
                    value.id
                )))
            }
        };
        Ok(Message {
            id: MessageId::from(value.id),
            author_id: UserId::from(value.author_id),
            location,
            content: value.content,
            parent_id: value.parent_id.map(MessageId::from),
            thread_count: value.thread_count as u32,
            edit_count: value.edit_count as u32,
            pinned: value.pinned,
            deleted: value.deleted,
            created_at: value.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ReactionRecord {
    message_id: i64,
    user_id: i64,
    emoji: String,
    created_at: DateTime<Utc>,
}

impl From<ReactionRecord> for Reaction {
    fn from(value: ReactionRecord) -> Self {
        Reaction {
            message_id: MessageId::from(value.message_id),
            user_id: UserId::from(value.user_id),
            emoji: value.emoji,
            created_at: value.created_at,
        }
    }
}

fn parse_visibility(value: &str) -> StoreResult<RoomVisibility> {
    match value {
        "public" => Ok(RoomVisibility::Public),
        "private" => Ok(RoomVisibility::Private),
        other => Err(invalid_data(format!("unknown visibility: {other}"))),
    }
}

fn visibility_str(value: RoomVisibility) -> &'static str {
    match value {
        RoomVisibility::Public => "public",
        RoomVisibility::Private => "private",
    }
}

fn parse_role(value: &str) -> StoreResult<RoomRole> {
    match value {
        "member" => Ok(RoomRole::Member),
        "moderator" => Ok(RoomRole::Moderator),
        "admin" => Ok(RoomRole::Admin),
        other => Err(invalid_data(format!("unknown role: {other}"))),
    }
}

fn role_str(value: RoomRole) -> &'static str {
    match value {
        RoomRole::Member => "member",
        RoomRole::Moderator => "moderator",
        RoomRole::Admin => "admin",
    }
}

fn parse_notification_level(value: &str) -> StoreResult<NotificationLevel> {
    match value {
        "all" => Ok(NotificationLevel::All),
        "mentions" => Ok(NotificationLevel::Mentions),
        "muted" => Ok(NotificationLevel::Muted),
        other => Err(invalid_data(format!("unknown notification level: {other}"))),
    }
}

fn notification_level_str(value: NotificationLevel) -> &'static str {
    match value {
        NotificationLevel::All => "all",
        NotificationLevel::Mentions => "mentions",
        NotificationLevel::Muted => "muted",
    }
}

const MESSAGE_COLUMNS: &str = "id, author_id, room_id, conversation_id, content, parent_id, \
     thread_count, edit_count, pinned, deleted, created_at";

/// PostgreSQL 消息存储
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn persist_message(&self, draft: MessageDraft) -> StoreResult<Message> {
        let (room_id, conversation_id) = match draft.location {
            MessageLocation::Room(id) => (Some(id.0), None),
            MessageLocation::Conversation(id) => (None, Some(id.0)),
        };

        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            "INSERT INTO messages (author_id, room_id, conversation_id, content, parent_id) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(draft.author_id.0)
        .bind(room_id)
        .bind(conversation_id)
        .bind(&draft.content)
        .bind(draft.parent_id.map(|id| id.0))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.try_into()
    }

    async fn fetch_message(&self, id: MessageId) -> StoreResult<Option<Message>> {
        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Message::try_from).transpose()
    }

    async fn fetch_messages(
        &self,
        location: MessageLocation,
        limit: u32,
        before: Option<MessageId>,
    ) -> StoreResult<Vec<Message>> {
        let (column, key) = match location {
            MessageLocation::Room(id) => ("room_id", id.0),
            MessageLocation::Conversation(id) => ("conversation_id", id.0),
        };

        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE {column} = $1 AND deleted = FALSE AND ($2::BIGINT IS NULL OR id < $2) \
             ORDER BY id DESC LIMIT $3"
        ))
        .bind(key)
        .bind(before.map(|id| id.0))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Message::try_from).collect()
    }

    async fn bump_thread_count(&self, parent_id: MessageId) -> StoreResult<()> {
        let result = sqlx::query("UPDATE messages SET thread_count = thread_count + 1 WHERE id = $1")
            .bind(parent_id.0)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("message {parent_id}")));
        }
        Ok(())
    }

    async fn set_pinned(&self, id: MessageId, pinned: bool) -> StoreResult<()> {
        let result = sqlx::query("UPDATE messages SET pinned = $2 WHERE id = $1")
            .bind(id.0)
            .bind(pinned)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("message {id}")));
        }
        Ok(())
    }

    async fn apply_edit(&self, id: MessageId, content: String) -> StoreResult<Message> {
        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            "UPDATE messages SET content = $2, edit_count = edit_count + 1 \
             WHERE id = $1 RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(id.0)
        .bind(content)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.try_into()
    }

    async fn create_room(
        &self,
        name: String,
        visibility: RoomVisibility,
        owner_id: UserId,
        max_members: u32,
    ) -> StoreResult<Room> {
        let record = sqlx::query_as::<_, RoomRecord>(
            "INSERT INTO rooms (name, visibility, owner_id, max_members) \
             VALUES ($1, $2, $3, $4) \
             RETURNING id, name, visibility, owner_id, max_members, 0::BIGINT AS member_count, created_at",
        )
        .bind(&name)
        .bind(visibility_str(visibility))
        .bind(owner_id.0)
        .bind(max_members as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.try_into()
    }

    async fn fetch_room(&self, id: RoomId) -> StoreResult<Option<Room>> {
        let record = sqlx::query_as::<_, RoomRecord>(
            "SELECT r.id, r.name, r.visibility, r.owner_id, r.max_members, \
                    (SELECT COUNT(*) FROM room_members m WHERE m.room_id = r.id) AS member_count, \
                    r.created_at \
             FROM rooms r WHERE r.id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Room::try_from).transpose()
    }

    async fn upsert_membership(&self, member: RoomMember) -> StoreResult<RoomMember> {
        // 冲突时保留原 joined_at
        let record = sqlx::query_as::<_, MemberRecord>(
            "INSERT INTO room_members (room_id, user_id, role, notification_level, last_read_message_id, joined_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (room_id, user_id) DO UPDATE SET \
                 role = EXCLUDED.role, \
                 notification_level = EXCLUDED.notification_level, \
                 last_read_message_id = EXCLUDED.last_read_message_id \
             RETURNING room_id, user_id, role, notification_level, last_read_message_id, joined_at",
        )
        .bind(member.room_id.0)
        .bind(member.user_id.0)
        .bind(role_str(member.role))
        .bind(notification_level_str(member.notification_level))
        .bind(member.last_read_message.map(|id| id.0))
        .bind(member.joined_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.try_into()
    }

    async fn remove_membership(&self, room_id: RoomId, user_id: UserId) -> StoreResult<()> {
        sqlx::query("DELETE FROM room_members WHERE room_id = $1 AND user_id = $2")
            .bind(room_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn fetch_membership(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> StoreResult<Option<RoomMember>> {
        let record = sqlx::query_as::<_, MemberRecord>(
            "SELECT room_id, user_id, role, notification_level, last_read_message_id, joined_at \
             FROM room_members WHERE room_id = $1 AND user_id = $2",
        )
        .bind(room_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(RoomMember::try_from).transpose()
    }

    async fn list_members(&self, room_id: RoomId) -> StoreResult<Vec<RoomMember>> {
        let records = sqlx::query_as::<_, MemberRecord>(
            "SELECT room_id, user_id, role, notification_level, last_read_message_id, joined_at \
             FROM room_members WHERE room_id = $1 ORDER BY joined_at",
        )
        .bind(room_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(RoomMember::try_from).collect()
    }

    async fn get_or_create_conversation(
        &self,
        user_low: UserId,
        user_high: UserId,
    ) -> StoreResult<Conversation> {
        let inserted = sqlx::query_as::<_, ConversationRecord>(
            "INSERT INTO conversations (user_low, user_high) VALUES ($1, $2) \
             ON CONFLICT (user_low, user_high) DO NOTHING \
             RETURNING id, user_low, user_high, low_blocked, high_blocked, created_at",
        )
        .bind(user_low.0)
        .bind(user_high.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if let Some(record) = inserted {
            return Ok(record.into());
        }

        let record = sqlx::query_as::<_, ConversationRecord>(
            "SELECT id, user_low, user_high, low_blocked, high_blocked, created_at \
             FROM conversations WHERE user_low = $1 AND user_high = $2",
        )
        .bind(user_low.0)
        .bind(user_high.0)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(record.into())
    }

    async fn fetch_conversation(
        &self,
        id: ConversationId,
    ) -> StoreResult<Option<Conversation>> {
        let record = sqlx::query_as::<_, ConversationRecord>(
            "SELECT id, user_low, user_high, low_blocked, high_blocked, created_at \
             FROM conversations WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(record.map(Conversation::from))
    }

    async fn set_conversation_blocked(
        &self,
        id: ConversationId,
        user_id: UserId,
        blocked: bool,
    ) -> StoreResult<Conversation> {
        let record = sqlx::query_as::<_, ConversationRecord>(
            "UPDATE conversations SET \
                 low_blocked  = CASE WHEN user_low  = $2 THEN $3 ELSE low_blocked  END, \
                 high_blocked = CASE WHEN user_high = $2 THEN $3 ELSE high_blocked END \
             WHERE id = $1 \
             RETURNING id, user_low, user_high, low_blocked, high_blocked, created_at",
        )
        .bind(id.0)
        .bind(user_id.0)
        .bind(blocked)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(record.into())
    }

    async fn upsert_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO message_reactions (message_id, user_id, emoji) VALUES ($1, $2, $3) \
             ON CONFLICT (message_id, user_id, emoji) DO NOTHING",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .bind(&emoji)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn remove_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "DELETE FROM message_reactions WHERE message_id = $1 AND user_id = $2 AND emoji = $3",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .bind(&emoji)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn fetch_reactions(&self, message_id: MessageId) -> StoreResult<Vec<Reaction>> {
        let records = sqlx::query_as::<_, ReactionRecord>(
            "SELECT message_id, user_id, emoji, created_at \
             FROM message_reactions WHERE message_id = $1 ORDER BY created_at, user_id",
        )
        .bind(message_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(records.into_iter().map(Reaction::from).collect())
    }
}
