//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Centralized configuration constants for OtpGuard.
//!
//! This module provides well-documented constants used throughout the library.
//! All magic numbers are defined here with their purpose and usage context.

// ============================================================================
// OTP Constants
// ============================================================================

/// Default OTP code length.
///
/// Six digits is the common balance between usability and guess resistance
/// when combined with the `otp` rate-limiting scope.
pub const DEFAULT_OTP_LENGTH: usize = 6;

/// Default OTP expiry (2 minutes).
///
/// Codes older than this are removed by the store's TTL mechanism; no
/// separate cleanup job exists.
pub const DEFAULT_OTP_EXPIRY_SECS: u64 = 120;

/// Default OTP key prefix.
///
/// Codes are stored under `{prefix}:{phone_number}`.
pub const DEFAULT_OTP_KEY_PREFIX: &str = "otp";

/// Default OTP code charset.
///
/// Code characters are drawn uniformly from this set.
pub const DEFAULT_OTP_CHARSET: &str = "0123456789";

// ============================================================================
// Rate Limiting Constants
// ============================================================================

/// Key prefix shared by all rate-limiting scopes.
///
/// Counters live under `{prefix}:{scope}:{identifier}`.
pub const RATE_LIMIT_KEY_PREFIX: &str = "rate_limit";

/// Default request budget for the `global` scope (per client IP).
pub const DEFAULT_RATE_LIMIT_GLOBAL_REQUESTS: u64 = 100;

/// Default window for the `global` scope (1 minute).
pub const DEFAULT_RATE_LIMIT_GLOBAL_WINDOW_SECS: u64 = 60;

/// Default request budget for the `auth` scope (per client IP).
pub const DEFAULT_RATE_LIMIT_AUTH_REQUESTS: u64 = 20;

/// Default window for the `auth` scope (1 minute).
pub const DEFAULT_RATE_LIMIT_AUTH_WINDOW_SECS: u64 = 60;

/// Default request budget for the `otp` scope (per phone number).
pub const DEFAULT_RATE_LIMIT_OTP_REQUESTS: u64 = 3;

/// Default window for the `otp` scope (10 minutes).
pub const DEFAULT_RATE_LIMIT_OTP_WINDOW_SECS: u64 = 600;

/// Default request budget for the `user` scope (per client IP).
pub const DEFAULT_RATE_LIMIT_USER_REQUESTS: u64 = 50;

/// Default window for the `user` scope (1 minute).
pub const DEFAULT_RATE_LIMIT_USER_WINDOW_SECS: u64 = 60;

// ============================================================================
// Circuit Breaker Constants
// ============================================================================

/// Default failure threshold for the circuit breaker.
///
/// The breaker transitions to open state after this many failures.
pub const DEFAULT_CIRCUIT_BREAKER_FAILURE_THRESHOLD: u32 = 5;

/// Default success threshold for the half-open state.
///
/// The breaker transitions back to closed state after this many successes
/// while half-open.
pub const DEFAULT_CIRCUIT_BREAKER_SUCCESS_THRESHOLD: u32 = 3;

/// Default timeout before an open breaker may probe again (30 seconds).
pub const DEFAULT_CIRCUIT_BREAKER_TIMEOUT_SECS: u64 = 30;

/// Maximum number of concurrent probe calls in the half-open state.
pub const DEFAULT_CIRCUIT_BREAKER_MAX_CONCURRENT_PROBES: u32 = 2;

/// Default failure window (1 minute).
///
/// The background state manager clears stale failures once this much time
/// has passed since the last recorded failure.
pub const DEFAULT_CIRCUIT_BREAKER_WINDOW_SECS: u64 = 60;

/// Default minimum request count carried in the breaker configuration.
pub const DEFAULT_CIRCUIT_BREAKER_MIN_REQUEST_COUNT: u32 = 10;

/// Interval of the breaker's background state manager (10 seconds).
pub const DEFAULT_CIRCUIT_BREAKER_SWEEP_INTERVAL_SECS: u64 = 10;

/// TTL of the best-effort breaker state snapshot in the KV store (24 hours).
pub const CIRCUIT_BREAKER_SNAPSHOT_TTL_SECS: u64 = 86_400;

// ============================================================================
// Connection Pool Constants
// ============================================================================

/// Default maximum number of open connections.
pub const DEFAULT_POOL_MAX_OPEN: usize = 25;

/// Default maximum number of idle connections retained.
pub const DEFAULT_POOL_MAX_IDLE: usize = 5;

/// Default interval of the pool's background sweep (1 minute).
pub const DEFAULT_POOL_SWEEP_INTERVAL_SECS: u64 = 60;

// ============================================================================
// Retry Constants
// ============================================================================

/// Default maximum number of attempts.
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;

/// Default initial delay between attempts (100 milliseconds).
pub const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 100;

/// Default delay cap (30 seconds).
pub const DEFAULT_RETRY_MAX_DELAY_SECS: u64 = 30;

/// Default multiplicative backoff factor.
pub const DEFAULT_RETRY_BACKOFF_FACTOR: f64 = 2.0;

/// Fraction of the computed delay added as uniform jitter (10%).
pub const RETRY_JITTER_FRACTION: f64 = 0.1;

// ============================================================================
// Event Bus Constants
// ============================================================================

/// Default pub/sub channel carrying all events.
pub const DEFAULT_EVENTS_CHANNEL: &str = "events";

/// Event source recorded in every published event envelope.
pub const EVENT_SOURCE: &str = "otpguard";

/// Event schema version recorded in every published event envelope.
pub const EVENT_SCHEMA_VERSION: &str = "1.0";

/// Buffer size of a subscription's delivery channel.
pub const EVENT_SUBSCRIPTION_BUFFER: usize = 128;
