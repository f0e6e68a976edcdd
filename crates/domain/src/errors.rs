//! 领域模型错误定义
//!
//! 定义领域层的校验错误以及存储接口的失败形态。

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// 参数校验错误
    #[error("验证失败: {field}: {message}")]
    InvalidArgument { field: String, message: String },

    /// 业务规则违反错误
    #[error("业务规则违反: {rule}")]
    BusinessRuleViolation { rule: String },
}

impl DomainError {
    /// 创建参数校验错误
    pub fn invalid_argument(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            message: message.into(),
        }
    }

    /// 创建业务规则违反错误
    pub fn business_rule_violation(rule: impl Into<String>) -> Self {
        Self::BusinessRuleViolation { rule: rule.into() }
    }
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;

/// 存储接口错误类型
///
/// `Unavailable` 是瞬时故障，由调用方决定是否重试；
/// `ConstraintViolation` 视为调用方缺陷，不重试，记录日志并原样上抛。
#[derive(Debug, Error)]
pub enum StoreError {
    /// 存储暂时不可用（连接失败、超时等瞬时故障）
    #[error("存储暂时不可用: {0}")]
    Unavailable(String),

    /// 存储约束冲突（唯一键、外键等，调用方缺陷）
    #[error("存储约束冲突: {0}")]
    ConstraintViolation(String),

    /// 记录不存在
    #[error("记录不存在: {0}")]
    NotFound(String),
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn constraint_violation(message: impl Into<String>) -> Self {
        Self::ConstraintViolation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}

/// 存储接口结果类型
pub type StoreResult<T> = Result<T, StoreError>;
