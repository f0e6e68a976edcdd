//! 在线状态类型
//!
//! 在线状态是弱引用信息，从不作为用户是否存在的权威来源，
//! 缺乏刷新时自动过期。

use serde::{Deserialize, Serialize};

/// 用户的在线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Online,
    Away,
    Busy,
}
