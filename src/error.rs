//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 错误类型定义
//!
//! 使用thiserror定义所有错误类型，并为每个错误提供稳定的机器可读错误码。

use thiserror::Error;

/// OtpGuard 错误类型
#[derive(Error, Debug)]
pub enum OtpGuardError {
    /// 资源未找到
    #[error("资源未找到: {0}")]
    NotFound(String),

    /// 资源已存在
    #[error("资源已存在: {0}")]
    AlreadyExists(String),

    /// 输入无效
    #[error("输入无效: {0}")]
    InvalidInput(String),

    /// 速率限制超出
    #[error("速率限制超出: {0}")]
    RateLimitExceeded(String),

    /// 熔断器打开
    #[error("熔断器打开: {0}")]
    CircuitOpen(String),

    /// 连接池已关闭
    #[error("连接池已关闭")]
    PoolClosed,

    /// 连接超时
    #[error("连接超时: {0}")]
    ConnectionTimeout(String),

    /// 数据库错误（携带操作上下文）
    #[error("数据库错误 [{operation}]: {source}")]
    DatabaseError {
        /// 失败的操作名称
        operation: String,
        /// 底层存储错误
        #[source]
        source: StorageError,
    },

    /// OTP验证码错误
    #[error("OTP验证码错误")]
    OtpInvalid,

    /// OTP不存在或已过期
    #[error("OTP不存在或已过期")]
    OtpExpiredOrNotFound,

    /// 操作被取消
    #[error("操作已取消")]
    Cancelled,

    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// 存储错误
    #[error("存储错误: {0}")]
    StorageError(#[from] StorageError),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    SerdeError(#[from] serde_json::Error),
}

/// 稳定的机器可读错误码
///
/// 返回给客户端的错误码，内部原因只写入日志。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    InvalidInput,
    RateLimitExceeded,
    CircuitOpen,
    PoolClosed,
    ConnectionTimeout,
    DatabaseError,
    OtpInvalid,
    OtpExpiredOrNotFound,
    Cancelled,
    ConfigError,
    StorageError,
    SerdeError,
}

impl OtpGuardError {
    /// 获取错误码
    pub fn code(&self) -> ErrorCode {
        match self {
            OtpGuardError::NotFound(_) => ErrorCode::NotFound,
            OtpGuardError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            OtpGuardError::InvalidInput(_) => ErrorCode::InvalidInput,
            OtpGuardError::RateLimitExceeded(_) => ErrorCode::RateLimitExceeded,
            OtpGuardError::CircuitOpen(_) => ErrorCode::CircuitOpen,
            OtpGuardError::PoolClosed => ErrorCode::PoolClosed,
            OtpGuardError::ConnectionTimeout(_) => ErrorCode::ConnectionTimeout,
            OtpGuardError::DatabaseError { .. } => ErrorCode::DatabaseError,
            OtpGuardError::OtpInvalid => ErrorCode::OtpInvalid,
            OtpGuardError::OtpExpiredOrNotFound => ErrorCode::OtpExpiredOrNotFound,
            OtpGuardError::Cancelled => ErrorCode::Cancelled,
            OtpGuardError::ConfigError(_) => ErrorCode::ConfigError,
            OtpGuardError::StorageError(_) => ErrorCode::StorageError,
            OtpGuardError::SerdeError(_) => ErrorCode::SerdeError,
        }
    }

    /// 获取错误码字符串（对外稳定）
    pub fn code_str(&self) -> &'static str {
        match self.code() {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::PoolClosed => "POOL_CLOSED",
            ErrorCode::ConnectionTimeout => "CONNECTION_TIMEOUT",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::OtpInvalid => "OTP_INVALID",
            ErrorCode::OtpExpiredOrNotFound => "OTP_EXPIRED_OR_NOT_FOUND",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::ConfigError => "CONFIG_ERROR",
            ErrorCode::StorageError => "STORAGE_ERROR",
            ErrorCode::SerdeError => "SERDE_ERROR",
        }
    }

    /// 构造数据库错误
    pub fn database(operation: impl Into<String>, source: StorageError) -> Self {
        OtpGuardError::DatabaseError {
            operation: operation.into(),
            source,
        }
    }
}

/// 存储错误
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// 连接错误
    #[error("连接错误: {0}")]
    ConnectionError(String),

    /// 查询错误
    #[error("查询错误: {0}")]
    QueryError(String),

    /// 超时错误
    #[error("超时错误: {0}")]
    TimeoutError(String),

    /// 未找到
    #[error("未找到: {0}")]
    NotFound(String),
}

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CircuitState {
    /// 关闭状态（正常）
    Closed,
    /// 打开状态（熔断）
    Open,
    /// 半开状态（探测）
    HalfOpen,
}

impl CircuitState {
    /// 状态字符串表示
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 熔断器统计信息
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CircuitBreakerStats {
    /// 当前状态
    pub state: CircuitState,
    /// 失败次数
    pub failures: u32,
    /// 成功次数
    pub successes: u32,
    /// 总调用次数
    pub total_calls: u64,
    /// 最后失败时间
    pub last_failure: Option<chrono::DateTime<chrono::Utc>>,
    /// 最后状态变更时间
    pub last_state_change: Option<chrono::DateTime<chrono::Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message() {
        let error = OtpGuardError::ConfigError("测试错误".to_string());
        assert_eq!(error.to_string(), "配置错误: 测试错误");
    }

    #[test]
    fn test_storage_error_conversion() {
        let storage_error = StorageError::NotFound("test_key".to_string());
        let error: OtpGuardError = storage_error.into();
        assert!(matches!(error, OtpGuardError::StorageError(_)));
        assert_eq!(error.code(), ErrorCode::StorageError);
    }

    #[test]
    fn test_error_code_str() {
        assert_eq!(
            OtpGuardError::RateLimitExceeded("x".to_string()).code_str(),
            "RATE_LIMIT_EXCEEDED"
        );
        assert_eq!(OtpGuardError::OtpInvalid.code_str(), "OTP_INVALID");
        assert_eq!(
            OtpGuardError::OtpExpiredOrNotFound.code_str(),
            "OTP_EXPIRED_OR_NOT_FOUND"
        );
        assert_eq!(OtpGuardError::PoolClosed.code_str(), "POOL_CLOSED");
    }

    #[test]
    fn test_database_error_context() {
        let error = OtpGuardError::database(
            "get_user",
            StorageError::QueryError("connection reset".to_string()),
        );
        assert_eq!(error.code(), ErrorCode::DatabaseError);
        assert!(error.to_string().contains("get_user"));
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }
}
