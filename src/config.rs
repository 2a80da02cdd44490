//! 配置模块
//!
//! 从环境变量装配各组件配置，所有键都有默认值。时长值接受
//! `ms`/`s`/`m`/`h`后缀，无后缀按秒解析。

use std::env;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::connection_pool::PoolConfig;
use crate::constants::{
    DEFAULT_CIRCUIT_BREAKER_FAILURE_THRESHOLD, DEFAULT_CIRCUIT_BREAKER_MAX_CONCURRENT_PROBES,
    DEFAULT_CIRCUIT_BREAKER_MIN_REQUEST_COUNT, DEFAULT_CIRCUIT_BREAKER_SUCCESS_THRESHOLD,
    DEFAULT_CIRCUIT_BREAKER_TIMEOUT_SECS, DEFAULT_CIRCUIT_BREAKER_WINDOW_SECS,
    DEFAULT_EVENTS_CHANNEL, DEFAULT_OTP_CHARSET, DEFAULT_OTP_EXPIRY_SECS, DEFAULT_OTP_KEY_PREFIX,
    DEFAULT_OTP_LENGTH, DEFAULT_POOL_MAX_IDLE, DEFAULT_POOL_MAX_OPEN,
    DEFAULT_POOL_SWEEP_INTERVAL_SECS, DEFAULT_RATE_LIMIT_AUTH_REQUESTS,
    DEFAULT_RATE_LIMIT_AUTH_WINDOW_SECS, DEFAULT_RATE_LIMIT_GLOBAL_REQUESTS,
    DEFAULT_RATE_LIMIT_GLOBAL_WINDOW_SECS, DEFAULT_RATE_LIMIT_OTP_REQUESTS,
    DEFAULT_RATE_LIMIT_OTP_WINDOW_SECS, DEFAULT_RATE_LIMIT_USER_REQUESTS,
    DEFAULT_RATE_LIMIT_USER_WINDOW_SECS,
};
use crate::error::OtpGuardError;
use crate::events::{EventTypeConfig, EventsConfig};
use crate::otp::OtpConfig;
use crate::rate_limiter::{RateLimitingConfig, ScopeLimit};
#[cfg(feature = "redis")]
use crate::redis_storage::RedisConfig;

/// 应用配置
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// OTP配置
    pub otp: OtpConfig,
    /// 速率限制配置
    pub rate_limiting: RateLimitingConfig,
    /// 熔断器配置
    pub circuit_breaker: CircuitBreakerConfig,
    /// 连接池配置
    pub pool: PoolConfig,
    /// 事件系统配置
    pub events: EventsConfig,
    /// Redis配置
    #[cfg(feature = "redis")]
    pub redis: RedisConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            otp: OtpConfig::default(),
            rate_limiting: RateLimitingConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            pool: PoolConfig::default(),
            events: EventsConfig::default(),
            #[cfg(feature = "redis")]
            redis: RedisConfig::default(),
        }
    }
}

impl AppConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        Self {
            otp: OtpConfig {
                length: get_env_as_usize("OTP_LENGTH", DEFAULT_OTP_LENGTH),
                expiry: get_env_as_duration(
                    "OTP_EXPIRY",
                    Duration::from_secs(DEFAULT_OTP_EXPIRY_SECS),
                ),
                key_prefix: get_env("OTP_KEY_PREFIX", DEFAULT_OTP_KEY_PREFIX),
                charset: get_env("OTP_CODE_CHARSET", DEFAULT_OTP_CHARSET),
            },
            rate_limiting: RateLimitingConfig {
                global: scope_from_env(
                    "GLOBAL",
                    DEFAULT_RATE_LIMIT_GLOBAL_REQUESTS,
                    Duration::from_secs(DEFAULT_RATE_LIMIT_GLOBAL_WINDOW_SECS),
                ),
                auth: scope_from_env(
                    "AUTH",
                    DEFAULT_RATE_LIMIT_AUTH_REQUESTS,
                    Duration::from_secs(DEFAULT_RATE_LIMIT_AUTH_WINDOW_SECS),
                ),
                otp: scope_from_env(
                    "OTP",
                    DEFAULT_RATE_LIMIT_OTP_REQUESTS,
                    Duration::from_secs(DEFAULT_RATE_LIMIT_OTP_WINDOW_SECS),
                ),
                user: scope_from_env(
                    "USER",
                    DEFAULT_RATE_LIMIT_USER_REQUESTS,
                    Duration::from_secs(DEFAULT_RATE_LIMIT_USER_WINDOW_SECS),
                ),
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: get_env_as_u32(
                    "CB_FAILURE_THRESHOLD",
                    DEFAULT_CIRCUIT_BREAKER_FAILURE_THRESHOLD,
                ),
                success_threshold: get_env_as_u32(
                    "CB_SUCCESS_THRESHOLD",
                    DEFAULT_CIRCUIT_BREAKER_SUCCESS_THRESHOLD,
                ),
                timeout: get_env_as_duration(
                    "CB_TIMEOUT",
                    Duration::from_secs(DEFAULT_CIRCUIT_BREAKER_TIMEOUT_SECS),
                ),
                max_concurrent_probes: get_env_as_u32(
                    "CB_MAX_CONCURRENT",
                    DEFAULT_CIRCUIT_BREAKER_MAX_CONCURRENT_PROBES,
                ),
                window_size: get_env_as_duration(
                    "CB_WINDOW_SIZE",
                    Duration::from_secs(DEFAULT_CIRCUIT_BREAKER_WINDOW_SECS),
                ),
                min_request_count: get_env_as_u32(
                    "CB_MIN_REQUEST_COUNT",
                    DEFAULT_CIRCUIT_BREAKER_MIN_REQUEST_COUNT,
                ),
            },
            pool: PoolConfig {
                max_open: get_env_as_usize("DB_MAX_OPEN_CONNS", DEFAULT_POOL_MAX_OPEN),
                max_idle: get_env_as_usize("DB_MAX_IDLE_CONNS", DEFAULT_POOL_MAX_IDLE),
                sweep_interval: get_env_as_duration(
                    "POOL_SWEEP_INTERVAL",
                    Duration::from_secs(DEFAULT_POOL_SWEEP_INTERVAL_SECS),
                ),
            },
            events: EventsConfig {
                enabled: get_env_as_bool("EVENTS_ENABLED", true),
                channel: get_env("EVENTS_CHANNEL", DEFAULT_EVENTS_CHANNEL),
                otp_generated: event_type_from_env("OTP_GENERATED", "otp_generated"),
                otp_verified: event_type_from_env("OTP_VERIFIED", "otp_verified"),
                user_created: event_type_from_env("USER_CREATED", "user_created"),
                user_logged_in: event_type_from_env("USER_LOGGED_IN", "user_logged_in"),
                rate_limited: event_type_from_env("RATE_LIMITED", "rate_limited"),
            },
            #[cfg(feature = "redis")]
            redis: RedisConfig::from_env(),
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), OtpGuardError> {
        self.otp.validate().map_err(OtpGuardError::ConfigError)?;
        self.rate_limiting
            .validate()
            .map_err(OtpGuardError::ConfigError)?;

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(OtpGuardError::ConfigError(
                "熔断器失败阈值不能为零".to_string(),
            ));
        }
        if self.circuit_breaker.success_threshold == 0 {
            return Err(OtpGuardError::ConfigError(
                "熔断器成功阈值不能为零".to_string(),
            ));
        }

        if self.pool.max_open == 0 {
            return Err(OtpGuardError::ConfigError(
                "连接池最大连接数不能为零".to_string(),
            ));
        }
        if self.pool.max_idle > self.pool.max_open {
            return Err(OtpGuardError::ConfigError(
                "连接池最大空闲数不能超过最大连接数".to_string(),
            ));
        }

        Ok(())
    }
}

fn scope_from_env(scope: &str, requests: u64, window: Duration) -> ScopeLimit {
    ScopeLimit {
        requests: get_env_as_u64(&format!("RATE_LIMIT_{}_REQUESTS", scope), requests),
        window: get_env_as_duration(&format!("RATE_LIMIT_{}_DURATION", scope), window),
        enabled: get_env_as_bool(&format!("RATE_LIMIT_{}_ENABLED", scope), true),
    }
}

fn event_type_from_env(event: &str, default_name: &str) -> EventTypeConfig {
    EventTypeConfig {
        name: get_env(&format!("EVENT_{}_NAME", event), default_name),
        enabled: get_env_as_bool(&format!("EVENT_{}_ENABLED", event), true),
    }
}

/// 读取字符串环境变量
pub(crate) fn get_env(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

/// 读取u64环境变量
pub(crate) fn get_env_as_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// 读取u32环境变量
pub(crate) fn get_env_as_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// 读取usize环境变量
pub(crate) fn get_env_as_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// 读取布尔环境变量
pub(crate) fn get_env_as_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// 读取时长环境变量
pub(crate) fn get_env_as_duration(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| parse_duration(&value))
        .unwrap_or(default)
}

/// 解析时长字符串
///
/// 支持`ms`/`s`/`m`/`h`后缀，无后缀按秒解析。
pub(crate) fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Some(millis) = value.strip_suffix("ms") {
        return millis.parse().ok().map(Duration::from_millis);
    }
    if let Some(hours) = value.strip_suffix('h') {
        return hours.parse::<u64>().ok().map(|v| Duration::from_secs(v * 3600));
    }
    if let Some(minutes) = value.strip_suffix('m') {
        return minutes.parse::<u64>().ok().map(|v| Duration::from_secs(v * 60));
    }
    if let Some(secs) = value.strip_suffix('s') {
        return secs.parse().ok().map(Duration::from_secs);
    }
    value.parse().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("100ms"), Some(Duration::from_millis(100)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration(" 10m "), Some(Duration::from_secs(600)));
        assert_eq!(parse_duration("abc"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();

        assert_eq!(config.otp.length, 6);
        assert_eq!(config.otp.expiry, Duration::from_secs(120));
        assert_eq!(config.rate_limiting.otp.requests, 3);
        assert_eq!(
            config.rate_limiting.otp.window,
            Duration::from_secs(600)
        );
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        let mut config = AppConfig::default();
        config.otp.length = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.pool.max_idle = config.pool.max_open + 1;
        assert!(config.validate().is_err());
    }
}
