//! 消息中枢核心领域模型
//!
//! 包含房间、会话、消息、表情回应等核心实体，以及存储接口和出站帧定义。

pub mod conversation;
pub mod errors;
pub mod frames;
pub mod ids;
pub mod message;
pub mod presence;
pub mod reaction;
pub mod room;
pub mod store;

// 重新导出常用类型
pub use conversation::*;
pub use errors::*;
pub use frames::*;
pub use ids::*;
pub use message::*;
pub use presence::*;
pub use reaction::*;
pub use room::*;
pub use store::*;
