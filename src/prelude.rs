//! Prelude module - Commonly used types for quick imports
//!
//! This module re-exports the most commonly used types from OtpGuard,
//! allowing users to import them with a single `use otpguard::prelude::*;`
//! statement instead of importing each type individually.

// Core types - always available
pub use crate::config::AppConfig;
pub use crate::error::{CircuitState, ErrorCode, OtpGuardError, StorageError};

// OTP engine
pub use crate::otp::{OtpConfig, OtpService};

// Rate limiting
pub use crate::rate_limiter::{
    RateLimitDecision, RateLimitScope, RateLimiter, RateLimitingConfig,
};

// Resilience primitives
pub use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
pub use crate::connection_pool::{ConnectionPool, PoolConfig, PoolableConnection};
pub use crate::retry::{retry, retry_with_result, RetryConfig};

// Events
pub use crate::events::{Event, EventHandler, EventPublisher, EventService, EventsConfig};

// Storage
pub use crate::storage::{KvStorage, MemoryStorage};

// Users and auth
pub use crate::auth::{validate_phone_number, AuthService};
pub use crate::user::{MemoryUserRepository, User, UserRepository};

// Monitoring
pub use crate::metrics::Metrics;

// Feature-gated exports
#[cfg(feature = "redis")]
pub use crate::redis_storage::{RedisConfig, RedisStorage};
