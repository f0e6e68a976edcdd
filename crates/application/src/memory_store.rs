//! 内存版存储实现
//!
//! 用于测试与本地开发。id 分配与顺序语义与关系型实现一致：
//! 持久化 id 全局单调递增，同一房间/会话内因此严格有序。

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use domain::{
    Conversation, ConversationId, Message, MessageDraft, MessageId, MessageLocation,
    MessageStore, Reaction, Room, RoomId, RoomMember, RoomVisibility, StoreError, StoreResult,
    UserId,
};

/// 内存存储
pub struct InMemoryMessageStore {
    next_message_id: AtomicI64,
    next_room_id: AtomicI64,
    next_conversation_id: AtomicI64,
    messages: RwLock<HashMap<MessageId, Message>>,
    by_location: RwLock<HashMap<MessageLocation, Vec<MessageId>>>,
    rooms: RwLock<HashMap<RoomId, Room>>,
    memberships: RwLock<HashMap<(RoomId, UserId), RoomMember>>,
    conversations: RwLock<HashMap<ConversationId, Conversation>>,
    conversation_pairs: RwLock<HashMap<(UserId, UserId), ConversationId>>,
    reactions: RwLock<HashMap<MessageId, Vec<Reaction>>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self {
            next_message_id: AtomicI64::new(1),
            next_room_id: AtomicI64::new(1),
            next_conversation_id: AtomicI64::new(1),
            messages: RwLock::new(HashMap::new()),
            by_location: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            memberships: RwLock::new(HashMap::new()),
            conversations: RwLock::new(HashMap::new()),
            conversation_pairs: RwLock::new(HashMap::new()),
            reactions: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn persist_message(&self, draft: MessageDraft) -> StoreResult<Message> {
        let id = MessageId::new(self.next_message_id.fetch_add(1, Ordering::SeqCst));
        let message = Message {
            id,
            author_id: draft.author_id,
            location: draft.location,
            content: draft.content,
            parent_id: draft.parent_id,
            thread_count: 0,
            edit_count: 0,
            pinned: false,
            deleted: false,
            created_at: chrono::Utc::now(),
        };

        self.messages.write().await.insert(id, message.clone());
        self.by_location
            .write()
            .await
            .entry(draft.location)
            .or_default()
            .push(id);
        Ok(message)
    }

    async fn fetch_message(&self, id: MessageId) -> StoreResult<Option<Message>> {
        Ok(self.messages.read().await.get(&id).cloned())
    }

    async fn fetch_messages(
        &self,
        location: MessageLocation,
        limit: u32,
        before: Option<MessageId>,
    ) -> StoreResult<Vec<Message>> {
        let messages = self.messages.read().await;
        let index = self.by_location.read().await;
        let ids = index.get(&location).cloned().unwrap_or_default();

        let mut page: Vec<Message> = ids
            .iter()
            .rev()
            .filter(|id| before.map_or(true, |cursor| **id < cursor))
            .filter_map(|id| messages.get(id).cloned())
            .take(limit as usize)
            .collect();
        page.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(page)
    }

    async fn bump_thread_count(&self, parent_id: MessageId) -> StoreResult<()> {
        let mut messages = self.messages.write().await;
        let parent = messages
            .get_mut(&parent_id)
            .ok_or_else(|| StoreError::not_found(format!("message {parent_id}")))?;
        parent.thread_count += 1;
        Ok(())
    }

    async fn set_pinned(&self, id: MessageId, pinned: bool) -> StoreResult<()> {
        let mut messages = self.messages.write().await;
        let message = messages
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(format!("message {id}")))?;
        message.pinned = pinned;
        Ok(())
    }

    async fn apply_edit(&self, id: MessageId, content: String) -> StoreResult<Message> {
        let mut messages = self.messages.write().await;
        let message = messages
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(format!("message {id}")))?;
        message.content = content;
        message.edit_count += 1;
        Ok(message.clone())
    }

    async fn create_room(
        &self,
        name: String,
        visibility: RoomVisibility,
        owner_id: UserId,
        max_members: u32,
    ) -> StoreResult<Room> {
        let id = RoomId::new(self.next_room_id.fetch_add(1, Ordering::SeqCst));
        let room = Room {
            id,
            name,
            visibility,
            owner_id,
            member_count: 0,
            max_members,
            created_at: chrono::Utc::now(),
        };
        self.rooms.write().await.insert(id, room.clone());
        Ok(room)
    }

    async fn fetch_room(&self, id: RoomId) -> StoreResult<Option<Room>> {
        let Some(mut room) = self.rooms.read().await.get(&id).cloned() else {
            return Ok(None);
        };
        room.member_count = self
            .memberships
            .read()
            .await
            .keys()
            .filter(|(room_id, _)| *room_id == id)
            .count() as u32;
        Ok(Some(room))
    }

    async fn upsert_membership(&self, member: RoomMember) -> StoreResult<RoomMember> {
        let mut memberships = self.memberships.write().await;
        let key = (member.room_id, member.user_id);
        // 已存在时保留原 joined_at
        let stored = match memberships.get(&key) {
            Some(existing) => {
                let mut updated = member;
                updated.joined_at = existing.joined_at;
                updated
            }
            None => member,
        };
        memberships.insert(key, stored.clone());
        Ok(stored)
    }

    async fn remove_membership(&self, room_id: RoomId, user_id: UserId) -> StoreResult<()> {
        self.memberships.write().await.remove(&(room_id, user_id));
        Ok(())
    }

    async fn fetch_membership(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> StoreResult<Option<RoomMember>> {
        Ok(self
            .memberships
            .read()
            .await
            .get(&(room_id, user_id))
            .cloned())
    }

    async fn list_members(&self, room_id: RoomId) -> StoreResult<Vec<RoomMember>> {
        Ok(self
            .memberships
            .read()
            .await
            .values()
            .filter(|member| member.room_id == room_id)
            .cloned()
            .collect())
    }

    async fn get_or_create_conversation(
        &self,
        user_low: UserId,
        user_high: UserId,
    ) -> StoreResult<Conversation> {
        let mut pairs = self.conversation_pairs.write().await;
        let mut conversations = self.conversations.write().await;

        if let Some(id) = pairs.get(&(user_low, user_high)) {
            if let Some(conversation) = conversations.get(id) {
                return Ok(conversation.clone());
            }
        }

        let id = ConversationId::new(self.next_conversation_id.fetch_add(1, Ordering::SeqCst));
        let conversation = Conversation {
            id,
            user_low,
            user_high,
            low_blocked: false,
            high_blocked: false,
            created_at: chrono::Utc::now(),
        };
        pairs.insert((user_low, user_high), id);
        conversations.insert(id, conversation.clone());
        Ok(conversation)
    }

    async fn fetch_conversation(
        &self,
        id: ConversationId,
    ) -> StoreResult<Option<Conversation>> {
        Ok(self.conversations.read().await.get(&id).cloned())
    }

    async fn set_conversation_blocked(
        &self,
        id: ConversationId,
        user_id: UserId,
        blocked: bool,
    ) -> StoreResult<Conversation> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(format!("conversation {id}")))?;
        conversation
            .set_blocked(user_id, blocked)
            .map_err(|err| StoreError::constraint_violation(err.to_string()))?;
        Ok(conversation.clone())
    }

    async fn upsert_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
    ) -> StoreResult<bool> {
        if !self.messages.read().await.contains_key(&message_id) {
            return Err(StoreError::not_found(format!("message {message_id}")));
        }

        let mut reactions = self.reactions.write().await;
        let list = reactions.entry(message_id).or_default();
        if list
            .iter()
            .any(|r| r.user_id == user_id && r.emoji == emoji)
        {
            return Ok(false);
        }
        list.push(Reaction {
            message_id,
            user_id,
            emoji,
            created_at: chrono::Utc::now(),
        });
        Ok(true)
    }

    async fn remove_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
    ) -> StoreResult<bool> {
        let mut reactions = self.reactions.write().await;
        let Some(list) = reactions.get_mut(&message_id) else {
            return Ok(false);
        };
        let before = list.len();
        list.retain(|r| !(r.user_id == user_id && r.emoji == emoji));
        Ok(list.len() < before)
    }

    async fn fetch_reactions(&self, message_id: MessageId) -> StoreResult<Vec<Reaction>> {
        Ok(self
            .reactions
            .read()
            .await
            .get(&message_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn message_ids_are_monotonic() {
        let store = InMemoryMessageStore::new();
        let location = MessageLocation::Room(RoomId::new(1));

        let mut last = MessageId::new(0);
        for i in 0..10 {
            let message = store
                .persist_message(MessageDraft::new(
                    UserId::new(1),
                    location,
                    format!("m{i}"),
                    None,
                ))
                .await
                .unwrap();
            assert!(message.id > last);
            last = message.id;
        }
    }

    #[tokio::test]
    async fn cursor_pagination_is_stable() {
        let store = InMemoryMessageStore::new();
        let location = MessageLocation::Room(RoomId::new(1));
        for i in 0..5 {
            store
                .persist_message(MessageDraft::new(
                    UserId::new(1),
                    location,
                    format!("m{i}"),
                    None,
                ))
                .await
                .unwrap();
        }

        let page = store.fetch_messages(location, 3, None).await.unwrap();
        assert_eq!(page.len(), 3);
        assert!(page[0].id > page[1].id && page[1].id > page[2].id);

        let next = store
            .fetch_messages(location, 3, Some(page[2].id))
            .await
            .unwrap();
        assert_eq!(next.len(), 2);
        assert!(next[0].id < page[2].id);
    }

    #[tokio::test]
    async fn conversation_pair_is_unique() {
        let store = InMemoryMessageStore::new();
        let first = store
            .get_or_create_conversation(UserId::new(1), UserId::new(2))
            .await
            .unwrap();
        let second = store
            .get_or_create_conversation(UserId::new(1), UserId::new(2))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn reaction_triple_is_unique() {
        let store = InMemoryMessageStore::new();
        let message = store
            .persist_message(MessageDraft::new(
                UserId::new(1),
                MessageLocation::Room(RoomId::new(1)),
                "m",
                None,
            ))
            .await
            .unwrap();

        assert!(store
            .upsert_reaction(message.id, UserId::new(2), "👍".into())
            .await
            .unwrap());
        assert!(!store
            .upsert_reaction(message.id, UserId::new(2), "👍".into())
            .await
            .unwrap());
        assert!(store
            .remove_reaction(message.id, UserId::new(2), "👍".into())
            .await
            .unwrap());
        assert!(!store
            .remove_reaction(message.id, UserId::new(2), "👍".into())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn fetch_room_counts_members() {
        let store = InMemoryMessageStore::new();
        let room = store
            .create_room("r".into(), RoomVisibility::Public, UserId::new(1), 10)
            .await
            .unwrap();
        store
            .upsert_membership(RoomMember::new(
                room.id,
                UserId::new(1),
                domain::RoomRole::Admin,
                chrono::Utc::now(),
            ))
            .await
            .unwrap();

        let fetched = store.fetch_room(room.id).await.unwrap().unwrap();
        assert_eq!(fetched.member_count, 1);
    }
}
