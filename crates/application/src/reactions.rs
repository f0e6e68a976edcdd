//! 表情回应聚合
//!
//! 每条消息的聚合在内存中增量维护，首次触达时从存储冷启动一次，
//! 之后的增删只调整计数，从不全量重扫。幂等性由存储的唯一三元组
//! 约束保证：重复插入/删除返回 false，聚合不变，也不算错误。
//! 快照版本号单调递增，客户端据此丢弃乱序到达的旧快照。
//! 长期未触达的聚合会被回收；重新装载时版本从装载时刻的时间戳起步，
//! 单调性跨越回收边界仍然成立。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;

use config::HubConfig;
use domain::{
    validate_emoji, AggregateSnapshot, MessageId, MessageStore, ReactionEntry, UserId,
};

use crate::errors::{bounded_store_call, HubError, HubResult};

struct AggregateState {
    version: u64,
    /// emoji → 回应者（按回应先后排列）
    per_emoji: BTreeMap<String, Vec<UserId>>,
    last_touched: Instant,
}

/// 装载时刻的纳秒时间戳作为版本起点，大于该消息此前发出的任何版本
fn seed_version() -> u64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX) as u64
}

impl AggregateState {
    fn snapshot(&self, message_id: MessageId, viewer: UserId, sample_size: usize) -> AggregateSnapshot {
        let entries = self
            .per_emoji
            .iter()
            .filter(|(_, users)| !users.is_empty())
            .map(|(emoji, users)| ReactionEntry {
                emoji: emoji.clone(),
                count: users.len() as u32,
                reacted: users.contains(&viewer),
                sample_users: users.iter().take(sample_size).copied().collect(),
            })
            .collect();
        AggregateSnapshot {
            message_id,
            version: self.version,
            entries,
        }
    }
}

/// 表情回应聚合器
pub struct ReactionAggregator {
    store: Arc<dyn MessageStore>,
    aggregates: DashMap<MessageId, Arc<Mutex<AggregateState>>>,
    persist_timeout: Duration,
    sample_size: usize,
}

impl ReactionAggregator {
    pub fn new(store: Arc<dyn MessageStore>, cfg: &HubConfig) -> Self {
        Self {
            store,
            aggregates: DashMap::new(),
            persist_timeout: Duration::from_millis(cfg.persist_timeout_ms),
            sample_size: cfg.reaction_sample_size,
        }
    }

    /// 添加回应。三元组已存在时无操作，返回当前聚合
    pub async fn add(
        &self,
        user_id: UserId,
        message_id: MessageId,
        emoji: &str,
    ) -> HubResult<AggregateSnapshot> {
        validate_emoji(emoji)?;
        let state = self.aggregate_state(message_id).await?;
        let mut guard = state.lock().await;
        guard.last_touched = Instant::now();

        let inserted = bounded_store_call(
            self.persist_timeout,
            self.store
                .upsert_reaction(message_id, user_id, emoji.to_string()),
        )
        .await?;

        if inserted {
            let users = guard.per_emoji.entry(emoji.to_string()).or_default();
            if !users.contains(&user_id) {
                users.push(user_id);
            }
            guard.version += 1;
        }

        Ok(guard.snapshot(message_id, user_id, self.sample_size))
    }

    /// 移除回应。三元组不存在时无操作，返回当前聚合
    pub async fn remove(
        &self,
        user_id: UserId,
        message_id: MessageId,
        emoji: &str,
    ) -> HubResult<AggregateSnapshot> {
        validate_emoji(emoji)?;
        let state = self.aggregate_state(message_id).await?;
        let mut guard = state.lock().await;
        guard.last_touched = Instant::now();

        let removed = bounded_store_call(
            self.persist_timeout,
            self.store
                .remove_reaction(message_id, user_id, emoji.to_string()),
        )
        .await?;

        if removed {
            if let Some(users) = guard.per_emoji.get_mut(emoji) {
                users.retain(|u| *u != user_id);
                if users.is_empty() {
                    guard.per_emoji.remove(emoji);
                }
            }
            guard.version += 1;
        }

        Ok(guard.snapshot(message_id, user_id, self.sample_size))
    }

    /// 某用户视角的当前聚合快照
    pub async fn snapshot_for(
        &self,
        viewer: UserId,
        message_id: MessageId,
    ) -> HubResult<AggregateSnapshot> {
        let state = self.aggregate_state(message_id).await?;
        let mut guard = state.lock().await;
        guard.last_touched = Instant::now();
        Ok(guard.snapshot(message_id, viewer, self.sample_size))
    }

    /// 回收长期未触达的聚合，防止内存无限增长；正被使用的条目跳过
    pub fn evict_idle(&self, idle: Duration) {
        let now = Instant::now();
        self.aggregates.retain(|_, state| match state.try_lock() {
            Ok(guard) => now.duration_since(guard.last_touched) < idle,
            Err(_) => true,
        });
    }

    /// 消息的聚合状态，首次触达时从存储冷启动
    async fn aggregate_state(&self, message_id: MessageId) -> HubResult<Arc<Mutex<AggregateState>>> {
        if let Some(state) = self.aggregates.get(&message_id) {
            return Ok(state.clone());
        }

        let message =
            bounded_store_call(self.persist_timeout, self.store.fetch_message(message_id))
                .await?;
        if message.is_none() {
            return Err(HubError::MessageNotFound(message_id));
        }

        let reactions =
            bounded_store_call(self.persist_timeout, self.store.fetch_reactions(message_id))
                .await?;
        let mut per_emoji: BTreeMap<String, Vec<UserId>> = BTreeMap::new();
        for reaction in reactions {
            let users = per_emoji.entry(reaction.emoji).or_default();
            if !users.contains(&reaction.user_id) {
                users.push(reaction.user_id);
            }
        }

        let seeded = Arc::new(Mutex::new(AggregateState {
            version: seed_version(),
            per_emoji,
            last_touched: Instant::now(),
        }));
        Ok(self.aggregates.entry(message_id).or_insert(seeded).clone())
    }
}
