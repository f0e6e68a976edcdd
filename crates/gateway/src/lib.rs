//! WebSocket 网关
//!
//! 负责连接握手时的 JWT 鉴权、入站/出站帧的编解码，以及把
//! 传输层事件接到中枢上。认证只发生在握手阶段，连接建立后
//! 身份上下文固定不变。

mod auth;
mod routes;
mod state;
mod ws;

pub use auth::{AuthError, Claims, JwtService};
pub use routes::router;
pub use state::AppState;
pub use ws::WireReply;
