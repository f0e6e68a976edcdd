//! 连接与消息中枢核心
//!
//! 内存中的编排层：跟踪活跃用户/会话，接收入站聊天操作，在任何副作用前
//! 执行限流，委托存储层分配持久化顺序，并把消息/回应/在线状态变化
//! 精确扇出到相关的活跃连接。

pub mod audit;
pub mod conversations;
pub mod errors;
pub mod hub;
pub mod memory_store;
pub mod presence;
pub mod rate_limiter;
pub mod reactions;
pub mod registry;
pub mod rooms;

// 重新导出常用类型
pub use audit::{AuditSink, ChannelAuditSink, NullAuditSink};
pub use conversations::ConversationManager;
pub use errors::{HubError, HubResult, RejectKind, Rejection};
pub use hub::{ClientOp, Hub, OpEnvelope, OpOutcome, SessionContext};
pub use memory_store::InMemoryMessageStore;
pub use presence::PresenceTracker;
pub use rate_limiter::{ActionKind, Decision, LimitPolicy, RateLimiter};
pub use reactions::ReactionAggregator;
pub use registry::{ConnectionHandle, ConnectionRegistry, FanoutReport, ReapedConnection};
pub use rooms::RoomManager;
