//! 在线状态与输入提示
//!
//! 状态与输入提示都带生存期，读取时惰性过期，不开后台清理任务。
//! 输入提示完全保留在内存，进程重启即消失。

use std::time::{Duration, Instant};

use dashmap::DashMap;

use domain::{RoomId, UserId, UserStatus};

struct StatusEntry {
    status: UserStatus,
    expires_at: Instant,
}

/// 在线状态追踪器
pub struct PresenceTracker {
    statuses: DashMap<UserId, StatusEntry>,
    typing: DashMap<RoomId, DashMap<UserId, Instant>>,
    status_ttl: Duration,
    typing_ttl: Duration,
}

impl PresenceTracker {
    pub fn new(status_ttl: Duration, typing_ttl: Duration) -> Self {
        Self {
            statuses: DashMap::new(),
            typing: DashMap::new(),
            status_ttl,
            typing_ttl,
        }
    }

    /// 设置用户状态并续期
    pub fn set_status(&self, user_id: UserId, status: UserStatus) {
        self.statuses.insert(
            user_id,
            StatusEntry {
                status,
                expires_at: Instant::now() + self.status_ttl,
            },
        );
    }

    /// 心跳续期，保持当前状态不变；没有状态记录时置为在线
    pub fn refresh(&self, user_id: UserId) {
        let expires_at = Instant::now() + self.status_ttl;
        self.statuses
            .entry(user_id)
            .and_modify(|entry| entry.expires_at = expires_at)
            .or_insert(StatusEntry {
                status: UserStatus::Online,
                expires_at,
            });
    }

    /// 清除用户状态（最后一条连接断开时调用）
    pub fn clear(&self, user_id: UserId) {
        self.statuses.remove(&user_id);
        for rooms in self.typing.iter() {
            rooms.remove(&user_id);
        }
    }

    /// 读取用户状态，过期即视为离线并顺手摘除
    pub fn status_of(&self, user_id: UserId) -> Option<UserStatus> {
        let now = Instant::now();
        let live = {
            let entry = self.statuses.get(&user_id)?;
            (entry.expires_at > now).then_some(entry.status)
        };
        if live.is_none() {
            self.statuses
                .remove_if(&user_id, |_, entry| entry.expires_at <= now);
        }
        live
    }

    /// 标记用户在房间内正在输入，重复调用只是续期
    pub fn start_typing(&self, room_id: RoomId, user_id: UserId) {
        self.typing
            .entry(room_id)
            .or_default()
            .insert(user_id, Instant::now() + self.typing_ttl);
    }

    pub fn stop_typing(&self, room_id: RoomId, user_id: UserId) {
        if let Some(rooms) = self.typing.get(&room_id) {
            rooms.remove(&user_id);
        }
    }

    /// 房间内当前正在输入的用户，读取时摘掉过期项
    pub fn typing_snapshot(&self, room_id: RoomId) -> Vec<UserId> {
        let now = Instant::now();
        let Some(rooms) = self.typing.get(&room_id) else {
            return Vec::new();
        };
        rooms.retain(|_, deadline| *deadline > now);
        let mut users: Vec<UserId> = rooms.iter().map(|entry| *entry.key()).collect();
        users.sort();
        users
    }
}
