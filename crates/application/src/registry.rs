//! 连接注册表
//!
//! 跟踪活跃传输会话与用户的对应关系，持有每条连接的有界出站队列。
//! 扇出用 `try_send`：队列满就丢帧并计数，慢消费者绝不拖慢发送路径。
//! 同一用户允许多条并发连接，帧会投递到该用户的每一条连接。

use std::collections::HashSet;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::warn;

use domain::{RoomId, ServerFrame, SessionId, UserId};

use crate::errors::{HubError, HubResult};

/// 注册成功后交给传输层的句柄，`outbound` 是该连接独占的出站队列
#[derive(Debug)]
pub struct ConnectionHandle {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub outbound: mpsc::Receiver<ServerFrame>,
}

/// 单次扇出的投递统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanoutReport {
    /// 成功入队的连接数
    pub delivered: usize,
    /// 因队列满被丢弃的帧数
    pub dropped_full: usize,
    /// 目标用户中当前无任何连接的人数
    pub offline_users: usize,
}

/// 被注销/回收的连接
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapedConnection {
    pub session_id: SessionId,
    pub user_id: UserId,
    /// 该用户是否已没有其它连接
    pub last_for_user: bool,
    /// 该连接生前订阅的房间（离线在线状态扇出需要）
    pub rooms: HashSet<RoomId>,
}

struct ConnectionEntry {
    user_id: UserId,
    sender: mpsc::Sender<ServerFrame>,
    last_heartbeat: Instant,
    rooms: HashSet<RoomId>,
}

/// 活跃连接注册表
pub struct ConnectionRegistry {
    connections: DashMap<SessionId, ConnectionEntry>,
    user_sessions: DashMap<UserId, HashSet<SessionId>>,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            user_sessions: DashMap::new(),
            queue_capacity,
        }
    }

    /// 注册一条新连接，重复的会话标识直接拒绝
    pub fn register(&self, session_id: SessionId, user_id: UserId) -> HubResult<ConnectionHandle> {
        if self.connections.contains_key(&session_id) {
            return Err(HubError::DuplicateSession(session_id));
        }

        let (sender, outbound) = mpsc::channel(self.queue_capacity);
        self.connections.insert(
            session_id,
            ConnectionEntry {
                user_id,
                sender,
                last_heartbeat: Instant::now(),
                rooms: HashSet::new(),
            },
        );
        self.user_sessions
            .entry(user_id)
            .or_default()
            .insert(session_id);

        Ok(ConnectionHandle {
            session_id,
            user_id,
            outbound,
        })
    }

    /// 注销连接，幂等。返回被摘除的条目信息（未注册则为 None）
    pub fn unregister(&self, session_id: SessionId) -> Option<ReapedConnection> {
        let (_, entry) = self.connections.remove(&session_id)?;
        let last_for_user = self.detach_user_session(entry.user_id, session_id);
        Some(ReapedConnection {
            session_id,
            user_id: entry.user_id,
            last_for_user,
            rooms: entry.rooms,
        })
    }

    /// 会话对应的用户
    pub fn user_of(&self, session_id: SessionId) -> Option<UserId> {
        self.connections.get(&session_id).map(|entry| entry.user_id)
    }

    /// 刷新心跳时间，未注册的会话忽略
    pub fn heartbeat(&self, session_id: SessionId) {
        if let Some(mut entry) = self.connections.get_mut(&session_id) {
            entry.last_heartbeat = Instant::now();
        }
    }

    /// 把连接订阅到房间的扇出目标
    pub fn subscribe(&self, session_id: SessionId, room_id: RoomId) {
        if let Some(mut entry) = self.connections.get_mut(&session_id) {
            entry.rooms.insert(room_id);
        }
    }

    pub fn unsubscribe(&self, session_id: SessionId, room_id: RoomId) {
        if let Some(mut entry) = self.connections.get_mut(&session_id) {
            entry.rooms.remove(&room_id);
        }
    }

    /// 用户在任意连接上订阅过的房间集合
    pub fn rooms_of(&self, user_id: UserId) -> HashSet<RoomId> {
        let mut rooms = HashSet::new();
        if let Some(sessions) = self.user_sessions.get(&user_id) {
            for session_id in sessions.iter() {
                if let Some(entry) = self.connections.get(session_id) {
                    rooms.extend(entry.rooms.iter().copied());
                }
            }
        }
        rooms
    }

    /// 订阅了某房间的所有在线用户
    pub fn room_audience(&self, room_id: RoomId) -> HashSet<UserId> {
        self.connections
            .iter()
            .filter(|entry| entry.rooms.contains(&room_id))
            .map(|entry| entry.user_id)
            .collect()
    }

    /// 用户是否有至少一条活跃连接
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.user_sessions
            .get(&user_id)
            .map(|sessions| !sessions.is_empty())
            .unwrap_or(false)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// 把帧投递到某用户的全部连接，可排除一条（通常是发起方自己的会话）
    pub fn route_to_user(
        &self,
        user_id: UserId,
        frame: &ServerFrame,
        exclude: Option<SessionId>,
    ) -> FanoutReport {
        let mut report = FanoutReport::default();
        let Some(sessions) = self.user_sessions.get(&user_id) else {
            report.offline_users = 1;
            return report;
        };
        if sessions.is_empty() {
            report.offline_users = 1;
            return report;
        }

        for session_id in sessions.iter() {
            if exclude == Some(*session_id) {
                continue;
            }
            if let Some(entry) = self.connections.get(session_id) {
                self.push_frame(&entry, *session_id, frame, &mut report);
            }
        }
        report
    }

    /// 把帧投递到房间成员的全部连接，成员名单由调用方给出，
    /// 可排除发送方自己的连接。慢消费者被跳过并计数，绝不阻塞整体扇出。
    pub fn route_to_room(
        &self,
        _room_id: RoomId,
        member_ids: &[UserId],
        frame: &ServerFrame,
        exclude: Option<SessionId>,
    ) -> FanoutReport {
        let mut report = FanoutReport::default();
        for user_id in member_ids {
            let partial = self.route_to_user(*user_id, frame, exclude);
            report.delivered += partial.delivered;
            report.dropped_full += partial.dropped_full;
            report.offline_users += partial.offline_users;
        }
        report
    }

    /// 摘除心跳超窗的连接，由回收任务周期性调用
    pub fn reap_expired(&self, window: Duration) -> Vec<ReapedConnection> {
        let now = Instant::now();
        let expired: Vec<SessionId> = self
            .connections
            .iter()
            .filter(|entry| now.duration_since(entry.last_heartbeat) > window)
            .map(|entry| *entry.key())
            .collect();

        expired
            .into_iter()
            .filter_map(|session_id| self.unregister(session_id))
            .collect()
    }

    fn push_frame(
        &self,
        entry: &ConnectionEntry,
        session_id: SessionId,
        frame: &ServerFrame,
        report: &mut FanoutReport,
    ) {
        match entry.sender.try_send(frame.clone()) {
            Ok(()) => report.delivered += 1,
            Err(mpsc::error::TrySendError::Full(_)) => {
                report.dropped_full += 1;
                warn!(
                    session_id = %session_id,
                    user_id = %entry.user_id,
                    "出站队列已满，丢弃帧"
                );
            }
            // 接收端已关闭，等待注销流程摘除
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// 从用户索引摘掉一条会话，返回该用户是否已无其它连接
    fn detach_user_session(&self, user_id: UserId, session_id: SessionId) -> bool {
        let mut last = false;
        if let Some(mut sessions) = self.user_sessions.get_mut(&user_id) {
            sessions.remove(&session_id);
            last = sessions.is_empty();
        }
        if last {
            self.user_sessions
                .remove_if(&user_id, |_, sessions| sessions.is_empty());
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use domain::UserStatus;

    fn presence_frame(user_id: UserId) -> ServerFrame {
        ServerFrame::PresenceChanged {
            user_id,
            status: Some(UserStatus::Online),
        }
    }

    #[tokio::test]
    async fn register_and_route_to_user() {
        let registry = ConnectionRegistry::new(8);
        let user = UserId::new(1);
        let mut handle = registry.register(SessionId::generate(), user).unwrap();

        let report = registry.route_to_user(user, &presence_frame(user), None);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped_full, 0);

        let frame = handle.outbound.recv().await.unwrap();
        assert!(matches!(frame, ServerFrame::PresenceChanged { .. }));
    }

    #[tokio::test]
    async fn duplicate_session_is_rejected() {
        let registry = ConnectionRegistry::new(8);
        let session = SessionId::generate();
        registry.register(session, UserId::new(1)).unwrap();

        let err = registry.register(session, UserId::new(2)).unwrap_err();
        assert!(matches!(err, HubError::DuplicateSession(_)));
        // 原连接不受影响
        assert!(registry.is_online(UserId::new(1)));
        assert!(!registry.is_online(UserId::new(2)));
    }

    #[tokio::test]
    async fn multiple_connections_per_user_all_receive() {
        let registry = ConnectionRegistry::new(8);
        let user = UserId::new(7);
        let mut h1 = registry.register(SessionId::generate(), user).unwrap();
        let mut h2 = registry.register(SessionId::generate(), user).unwrap();

        let report = registry.route_to_user(user, &presence_frame(user), None);
        assert_eq!(report.delivered, 2);

        assert!(h1.outbound.recv().await.is_some());
        assert!(h2.outbound.recv().await.is_some());
    }

    #[tokio::test]
    async fn full_queue_drops_frame_without_blocking() {
        let registry = ConnectionRegistry::new(1);
        let user = UserId::new(3);
        let mut handle = registry.register(SessionId::generate(), user).unwrap();

        let first = registry.route_to_user(user, &presence_frame(user), None);
        assert_eq!(first.delivered, 1);

        // 消费者不读，第二帧被丢弃
        let second = registry.route_to_user(user, &presence_frame(user), None);
        assert_eq!(second.delivered, 0);
        assert_eq!(second.dropped_full, 1);

        // 读走一帧后恢复投递
        handle.outbound.recv().await.unwrap();
        let third = registry.route_to_user(user, &presence_frame(user), None);
        assert_eq!(third.delivered, 1);
    }

    #[tokio::test]
    async fn room_routing_excludes_sender_connection() {
        let registry = ConnectionRegistry::new(8);
        let room = RoomId::new(10);
        let alice = UserId::new(1);
        let bob = UserId::new(2);

        let mut a = registry.register(SessionId::generate(), alice).unwrap();
        let mut b = registry.register(SessionId::generate(), bob).unwrap();

        let members = [alice, bob];
        let report = registry.route_to_room(room, &members, &presence_frame(alice), Some(a.session_id));
        assert_eq!(report.delivered, 1);
        assert!(b.outbound.recv().await.is_some());
        assert!(a.outbound.try_recv().is_err());

        // 不排除时双方都收到
        let report = registry.route_to_room(room, &members, &presence_frame(bob), None);
        assert_eq!(report.delivered, 2);
        assert!(a.outbound.recv().await.is_some());
        assert!(b.outbound.recv().await.is_some());
    }

    #[tokio::test]
    async fn subscriptions_track_presence_audience() {
        let registry = ConnectionRegistry::new(8);
        let room = RoomId::new(11);
        let alice = UserId::new(1);

        let handle = registry.register(SessionId::generate(), alice).unwrap();
        registry.subscribe(handle.session_id, room);
        assert!(registry.rooms_of(alice).contains(&room));
        assert!(registry.room_audience(room).contains(&alice));

        registry.unsubscribe(handle.session_id, room);
        assert!(registry.rooms_of(alice).is_empty());
        assert!(registry.room_audience(room).is_empty());
    }

    #[tokio::test]
    async fn unregister_is_idempotent_and_reports_last() {
        let registry = ConnectionRegistry::new(8);
        let user = UserId::new(5);
        let h1 = registry.register(SessionId::generate(), user).unwrap();
        let h2 = registry.register(SessionId::generate(), user).unwrap();

        let first = registry.unregister(h1.session_id).unwrap();
        assert!(!first.last_for_user);
        assert!(registry.unregister(h1.session_id).is_none());

        let second = registry.unregister(h2.session_id).unwrap();
        assert!(second.last_for_user);
        assert!(!registry.is_online(user));
    }

    #[tokio::test]
    async fn reap_expired_removes_stale_connections() {
        let registry = ConnectionRegistry::new(8);
        let stale = registry
            .register(SessionId::generate(), UserId::new(1))
            .unwrap();
        let fresh = registry
            .register(SessionId::generate(), UserId::new(2))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.heartbeat(fresh.session_id);

        let reaped = registry.reap_expired(Duration::from_millis(30));
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].session_id, stale.session_id);
        assert!(reaped[0].last_for_user);
        assert_eq!(registry.connection_count(), 1);
    }

    #[tokio::test]
    async fn offline_target_is_counted_not_errored() {
        let registry = ConnectionRegistry::new(8);
        let report = registry.route_to_user(UserId::new(99), &presence_frame(UserId::new(99)), None);
        assert_eq!(report.delivered, 0);
        assert_eq!(report.offline_users, 1);
    }
}
