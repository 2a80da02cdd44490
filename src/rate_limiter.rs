//! 速率限制器
//!
//! 基于键值存储的固定窗口计数器，四个独立作用域（global/auth/otp/user）
//! 并行运行，各自拥有独立的键空间和(限额, 窗口)配置。
//!
//! 窗口从作用域内第一次请求开始计时，窗口内的后续请求不顺延过期时间。
//! 计数更新使用存储层的原子自增加首次请求设置过期时间，避免
//! 读取-回写竞争造成的漏计。
//!
//! 存储不可用时限制器放行请求（fail-open），只记录错误，绝不因为
//! 限流组件自身故障阻塞全部流量。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::{
    DEFAULT_RATE_LIMIT_AUTH_REQUESTS, DEFAULT_RATE_LIMIT_AUTH_WINDOW_SECS,
    DEFAULT_RATE_LIMIT_GLOBAL_REQUESTS, DEFAULT_RATE_LIMIT_GLOBAL_WINDOW_SECS,
    DEFAULT_RATE_LIMIT_OTP_REQUESTS, DEFAULT_RATE_LIMIT_OTP_WINDOW_SECS,
    DEFAULT_RATE_LIMIT_USER_REQUESTS, DEFAULT_RATE_LIMIT_USER_WINDOW_SECS,
    RATE_LIMIT_KEY_PREFIX,
};
use crate::events::EventPublisher;
use crate::metrics::Metrics;
use crate::storage::KvStorage;

/// 速率限制作用域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitScope {
    /// 全局（按客户端IP）
    Global,
    /// 认证接口（按客户端IP）
    Auth,
    /// OTP发送（按手机号）
    Otp,
    /// 用户接口（按客户端IP）
    User,
}

impl RateLimitScope {
    /// 所有作用域
    pub const ALL: [RateLimitScope; 4] = [
        RateLimitScope::Global,
        RateLimitScope::Auth,
        RateLimitScope::Otp,
        RateLimitScope::User,
    ];

    /// 作用域字符串表示（键空间与指标标签共用）
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitScope::Global => "global",
            RateLimitScope::Auth => "auth",
            RateLimitScope::Otp => "otp",
            RateLimitScope::User => "user",
        }
    }
}

impl std::fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个作用域的限额配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeLimit {
    /// 窗口内允许的请求数
    pub requests: u64,
    /// 窗口长度
    pub window: Duration,
    /// 是否启用
    pub enabled: bool,
}

impl ScopeLimit {
    /// 创建新的作用域限额
    pub fn new(requests: u64, window: Duration) -> Self {
        Self {
            requests,
            window,
            enabled: true,
        }
    }
}

/// 速率限制配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// global作用域
    pub global: ScopeLimit,
    /// auth作用域
    pub auth: ScopeLimit,
    /// otp作用域
    pub otp: ScopeLimit,
    /// user作用域
    pub user: ScopeLimit,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            global: ScopeLimit::new(
                DEFAULT_RATE_LIMIT_GLOBAL_REQUESTS,
                Duration::from_secs(DEFAULT_RATE_LIMIT_GLOBAL_WINDOW_SECS),
            ),
            auth: ScopeLimit::new(
                DEFAULT_RATE_LIMIT_AUTH_REQUESTS,
                Duration::from_secs(DEFAULT_RATE_LIMIT_AUTH_WINDOW_SECS),
            ),
            otp: ScopeLimit::new(
                DEFAULT_RATE_LIMIT_OTP_REQUESTS,
                Duration::from_secs(DEFAULT_RATE_LIMIT_OTP_WINDOW_SECS),
            ),
            user: ScopeLimit::new(
                DEFAULT_RATE_LIMIT_USER_REQUESTS,
                Duration::from_secs(DEFAULT_RATE_LIMIT_USER_WINDOW_SECS),
            ),
        }
    }
}

impl RateLimitingConfig {
    /// 获取作用域对应的限额配置
    pub fn scope(&self, scope: RateLimitScope) -> &ScopeLimit {
        match scope {
            RateLimitScope::Global => &self.global,
            RateLimitScope::Auth => &self.auth,
            RateLimitScope::Otp => &self.otp,
            RateLimitScope::User => &self.user,
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), String> {
        for scope in RateLimitScope::ALL {
            let limit = self.scope(scope);
            if limit.enabled && limit.requests == 0 {
                return Err(format!("作用域[{}]的请求限额不能为零", scope));
            }
            if limit.enabled && limit.window.is_zero() {
                return Err(format!("作用域[{}]的窗口不能为零", scope));
            }
        }
        Ok(())
    }
}

/// 速率限制决策
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitDecision {
    /// 允许
    Allowed {
        /// 限额
        limit: u64,
        /// 窗口内剩余次数
        remaining: u64,
        /// 窗口剩余时间
        reset: Duration,
    },
    /// 拒绝
    Denied {
        /// 限额
        limit: u64,
        /// 建议重试等待时间（当前窗口剩余TTL）
        retry_after: Duration,
        /// 对外错误消息
        message: String,
    },
}

impl RateLimitDecision {
    /// 是否允许
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }

    /// 拒绝时的429响应体
    pub fn error_body(&self) -> Option<RateLimitErrorBody> {
        match self {
            RateLimitDecision::Denied { message, .. } => Some(RateLimitErrorBody {
                error: "rate_limit_exceeded".to_string(),
                message: message.clone(),
            }),
            RateLimitDecision::Allowed { .. } => None,
        }
    }
}

/// 速率限制429响应体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitErrorBody {
    /// 稳定错误标识
    pub error: String,
    /// 人类可读消息
    pub message: String,
}

/// 只读的限额状态（用于响应头）
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitStatus {
    /// 限额
    pub limit: u64,
    /// 剩余次数
    pub remaining: u64,
    /// 窗口剩余时间
    pub reset: Duration,
}

/// 生成限额响应头（所有响应都携带）
pub fn rate_limit_headers(status: &RateLimitStatus) -> Vec<(&'static str, String)> {
    vec![
        ("X-RateLimit-Limit", status.limit.to_string()),
        ("X-RateLimit-Remaining", status.remaining.to_string()),
        ("X-RateLimit-Reset", status.reset.as_secs().to_string()),
    ]
}

/// 生成拒绝响应的附加头
pub fn denial_headers(decision: &RateLimitDecision) -> Vec<(&'static str, String)> {
    match decision {
        RateLimitDecision::Denied { retry_after, .. } => vec![
            ("Retry-After", retry_after.as_secs().to_string()),
            ("X-RateLimit-Exceeded", "true".to_string()),
        ],
        RateLimitDecision::Allowed { .. } => Vec::new(),
    }
}

/// 多作用域速率限制器
pub struct RateLimiter {
    storage: Arc<dyn KvStorage>,
    config: RateLimitingConfig,
    metrics: Option<Arc<Metrics>>,
    events: Option<Arc<EventPublisher>>,
}

impl RateLimiter {
    /// 创建速率限制器
    pub fn new(storage: Arc<dyn KvStorage>, config: RateLimitingConfig) -> Self {
        Self {
            storage,
            config,
            metrics: None,
            events: None,
        }
    }

    /// 挂接指标
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// 挂接事件发布器
    pub fn with_events(mut self, events: Arc<EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    fn counter_key(scope: RateLimitScope, identifier: &str) -> String {
        format!("{}:{}:{}", RATE_LIMIT_KEY_PREFIX, scope.as_str(), identifier)
    }

    /// 检查并消费一次请求配额
    ///
    /// 存储不可用时放行（fail-open）。
    pub async fn check_and_consume(
        &self,
        scope: RateLimitScope,
        identifier: &str,
    ) -> RateLimitDecision {
        let limit = self.config.scope(scope).clone();
        if !limit.enabled || limit.requests == 0 {
            return RateLimitDecision::Allowed {
                limit: limit.requests,
                remaining: limit.requests,
                reset: limit.window,
            };
        }

        let key = Self::counter_key(scope, identifier);

        let count = match self.storage.incr(&key).await {
            Ok(count) => count.max(0) as u64,
            Err(e) => {
                warn!(
                    scope = scope.as_str(),
                    identifier, "速率限制存储不可用，放行请求: {}", e
                );
                return RateLimitDecision::Allowed {
                    limit: limit.requests,
                    remaining: limit.requests.saturating_sub(1),
                    reset: limit.window,
                };
            }
        };

        // 窗口在计数器创建时开启一次，之后不再顺延
        if count == 1 {
            if let Err(e) = self.storage.expire(&key, limit.window).await {
                warn!(scope = scope.as_str(), "设置限流窗口失败: {}", e);
            }
        }

        let reset = match self.storage.ttl(&key).await {
            Ok(Some(ttl)) => ttl,
            _ => limit.window,
        };

        if count > limit.requests {
            warn!(
                scope = scope.as_str(),
                identifier,
                limit = limit.requests,
                window_secs = limit.window.as_secs(),
                "速率限制超出"
            );

            if let Some(metrics) = &self.metrics {
                metrics.record_rate_limit_exceeded(scope.as_str());
            }
            if let Some(events) = &self.events {
                if let Err(e) = events
                    .publish_rate_limited(scope.as_str(), identifier)
                    .await
                {
                    warn!("发布限流事件失败: {}", e);
                }
            }

            let message = format!(
                "too many requests. Limit: {} requests per {}. Please try again later.",
                limit.requests,
                format_window(limit.window)
            );
            return RateLimitDecision::Denied {
                limit: limit.requests,
                retry_after: reset,
                message,
            };
        }

        debug!(
            scope = scope.as_str(),
            identifier, count, "速率限制检查通过"
        );
        RateLimitDecision::Allowed {
            limit: limit.requests,
            remaining: limit.requests - count,
            reset,
        }
    }

    /// 读取当前限额状态，不消费配额
    ///
    /// 用于为每个响应填充限额头。失败时按满额状态返回。
    pub async fn status(&self, scope: RateLimitScope, identifier: &str) -> RateLimitStatus {
        let limit = self.config.scope(scope);
        let key = Self::counter_key(scope, identifier);

        let count = match self.storage.get(&key).await {
            Ok(Some(value)) => value.parse::<u64>().unwrap_or(0),
            Ok(None) => 0,
            Err(e) => {
                warn!(scope = scope.as_str(), "读取限流状态失败: {}", e);
                0
            }
        };

        let reset = match self.storage.ttl(&key).await {
            Ok(Some(ttl)) => ttl,
            _ => Duration::ZERO,
        };

        RateLimitStatus {
            limit: limit.requests,
            remaining: limit.requests.saturating_sub(count),
            reset,
        }
    }
}

/// 人类可读的窗口描述
fn format_window(window: Duration) -> String {
    let secs = window.as_secs();
    if secs >= 60 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}
