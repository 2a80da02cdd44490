//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! OtpGuard - Phone-number OTP authentication core
//!
//! Issues and validates one-time passcodes, guards every entry point with
//! multi-scope rate limiting, and protects downstream dependencies with a
//! self-healing circuit breaker. All shared state lives in a pluggable
//! key-value store with TTL support.
//!
//! # API Layers
//!
//! ## Prelude (Quick Start)
//!
//! Use `use otpguard::prelude::*;` to import all commonly used types.
//!
//! ## Core API
//!
//! - [`OtpService`] - OTP generation and validation state machine
//! - [`RateLimiter`] - Fixed-window counters over four independent scopes
//! - [`CircuitBreaker`] - Closed/Open/HalfOpen dependency protection
//! - [`ConnectionPool`] - Bounded pool with waiter queue and sweeping
//! - [`retry`] / [`retry_with_result`] - Bounded exponential backoff
//! - [`EventService`] - Fire-and-forget lifecycle notifications
//! - [`OtpGuardError`] - Error types with stable machine-readable codes
//!
//! ## Storage
//!
//! Everything speaks to the [`KvStorage`] trait. [`MemoryStorage`] backs
//! tests and single-process deployments; the `redis` feature adds
//! [`RedisStorage`](redis_storage::RedisStorage) for shared deployments.
//!
//! # Examples
//!
//! ```rust
//! use otpguard::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let storage = Arc::new(MemoryStorage::new());
//!
//!     // 生成并校验一次性验证码
//!     let otp = OtpService::new(storage.clone(), OtpConfig::default());
//!     let code = otp.generate("+1234567890").await.unwrap();
//!     otp.validate("+1234567890", &code).await.unwrap();
//!
//!     // 同一验证码只能消费一次
//!     assert!(otp.validate("+1234567890", &code).await.is_err());
//! }
//! ```
//!
//! # Features
//!
//! - **Multi-scope rate limiting**: global/auth/otp/user fixed windows, fail-open
//! - **Circuit breaker**: bounded half-open probing, background state manager
//! - **Connection pool**: waiter queue with cancellation-safe acquisition
//! - **Retry helper**: exponential backoff with jitter, cancellable sleeps
//! - **Event bus**: at-most-once pub/sub fan-out over the KV store
//! - **Monitoring**: Prometheus counters against an explicit registry

pub mod prelude;

pub mod auth;
pub mod circuit_breaker;
pub mod config;
pub mod connection_pool;
pub mod constants;
pub mod error;
pub mod events;
pub mod metrics;
pub mod otp;
pub mod rate_limiter;
#[cfg(feature = "redis")]
pub mod redis_storage;
pub mod retry;
pub mod storage;
pub mod user;

// 重新导出常用类型
pub use auth::{validate_phone_number, AuthService};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
pub use config::AppConfig;
pub use connection_pool::{
    ConnectionFactory, ConnectionPool, PoolConfig, PoolStats, PoolableConnection,
};
pub use error::{
    CircuitBreakerStats, CircuitState, ErrorCode, OtpGuardError, StorageError,
};
pub use events::{
    Event, EventHandler, EventPublisher, EventService, EventSubscriber, EventTypeConfig,
    EventsConfig, LogEventHandler,
};
pub use metrics::Metrics;
pub use otp::{OtpConfig, OtpService};
pub use rate_limiter::{
    denial_headers, rate_limit_headers, RateLimitDecision, RateLimitErrorBody, RateLimitScope,
    RateLimitStatus, RateLimiter, RateLimitingConfig, ScopeLimit,
};
#[cfg(feature = "redis")]
pub use redis_storage::{RedisConfig, RedisStorage};
pub use retry::{retry, retry_with_result, RetryConfig, RetryHook};
pub use storage::{KvStorage, MemoryStorage};
pub use user::{MemoryUserRepository, User, UserRepository, UserRole};
