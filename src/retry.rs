//! 重试辅助
//!
//! 以带抖动的指数退避执行操作，次数有界。主要用于启动阶段建立
//! 数据库和缓存连接。错误码允许列表之外的错误立即中止；
//! 重试间隔的等待本身可被取消令牌打断，立刻以取消错误返回，
//! 不会等到剩余重试跑完。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::constants::{
    DEFAULT_RETRY_BACKOFF_FACTOR, DEFAULT_RETRY_INITIAL_DELAY_MS, DEFAULT_RETRY_MAX_ATTEMPTS,
    DEFAULT_RETRY_MAX_DELAY_SECS, RETRY_JITTER_FRACTION,
};
use crate::error::{ErrorCode, OtpGuardError};

/// 每次重试前触发的回调（参数：尝试序号、本次错误）
pub type RetryHook = Arc<dyn Fn(u32, &OtpGuardError) + Send + Sync>;

/// 重试配置
#[derive(Clone)]
pub struct RetryConfig {
    /// 最大尝试次数
    pub max_attempts: u32,
    /// 初始延迟
    pub initial_delay: Duration,
    /// 延迟上限
    pub max_delay: Duration,
    /// 退避倍率
    pub backoff_factor: f64,
    /// 是否加入抖动（最多为计算延迟的10%）
    pub jitter: bool,
    /// 可重试错误码允许列表，空表示全部可重试
    pub retryable: Vec<ErrorCode>,
    /// 每次睡眠前触发的回调
    pub on_retry: Option<RetryHook>,
}

impl std::fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("jitter", &self.jitter)
            .field("retryable", &self.retryable)
            .field("on_retry", &self.on_retry.as_ref().map(|_| "..."))
            .finish()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(DEFAULT_RETRY_INITIAL_DELAY_MS),
            max_delay: Duration::from_secs(DEFAULT_RETRY_MAX_DELAY_SECS),
            backoff_factor: DEFAULT_RETRY_BACKOFF_FACTOR,
            jitter: true,
            retryable: Vec::new(),
            on_retry: None,
        }
    }
}

impl RetryConfig {
    /// 指数退避配置
    pub fn exponential_backoff(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            ..Default::default()
        }
    }

    /// 固定间隔配置
    pub fn fixed_delay(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            backoff_factor: 1.0,
            jitter: false,
            ..Default::default()
        }
    }

    /// 仅对给定错误码重试
    pub fn only_for(mut self, retryable: Vec<ErrorCode>) -> Self {
        self.retryable = retryable;
        self
    }

    /// 设置重试回调
    pub fn on_retry(mut self, hook: RetryHook) -> Self {
        self.on_retry = Some(hook);
        self
    }

    /// 为命名操作挂接日志回调
    pub fn with_logging(self, operation: &str) -> Self {
        let operation = operation.to_string();
        self.on_retry(Arc::new(move |attempt, error| {
            warn!(operation = %operation, attempt, "操作失败，准备重试: {}", error);
        }))
    }
}

/// 带重试地执行操作
pub async fn retry<F, Fut>(
    cancel: &CancellationToken,
    config: &RetryConfig,
    operation: F,
) -> Result<(), OtpGuardError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), OtpGuardError>>,
{
    retry_with_result(cancel, config, operation).await
}

/// 带重试地执行操作并返回结果
///
/// 操作失败且可重试时按`initial_delay × backoff_factor^(attempt-1)`
/// 退避（封顶`max_delay`，附加最多10%的均匀抖动），达到
/// `max_attempts`后返回最后一次错误。
pub async fn retry_with_result<T, F, Fut>(
    cancel: &CancellationToken,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, OtpGuardError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OtpGuardError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(OtpGuardError::Cancelled);
        }

        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !is_retryable(&error, &config.retryable) || attempt >= max_attempts {
                    return Err(error);
                }

                if let Some(hook) = &config.on_retry {
                    hook(attempt, &error);
                }

                let delay = calculate_delay(attempt, config);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(OtpGuardError::Cancelled),
                }
                attempt += 1;
            }
        }
    }
}

/// 计算第`attempt`次失败后的等待时间
fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let base =
        config.initial_delay.as_secs_f64() * config.backoff_factor.powi(attempt as i32 - 1);

    let mut delay = base;
    if config.jitter {
        delay += rand::rng().random::<f64>() * RETRY_JITTER_FRACTION * base;
    }

    let cap = config.max_delay.as_secs_f64();
    if delay > cap {
        delay = cap;
    }
    Duration::from_secs_f64(delay.max(0.0))
}

fn is_retryable(error: &OtpGuardError, retryable: &[ErrorCode]) -> bool {
    retryable.is_empty() || retryable.contains(&error.code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            jitter: false,
            ..Default::default()
        }
    }

    fn flaky(
        counter: Arc<AtomicU32>,
        fail_times: u32,
    ) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = Result<u32, OtpGuardError>> + Send>>
    {
        move || {
            let counter = counter.clone();
            Box::pin(async move {
                let calls = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if calls <= fail_times {
                    Err(OtpGuardError::ConnectionTimeout("尚未就绪".to_string()))
                } else {
                    Ok(calls)
                }
            })
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicU32::new(0));

        let result =
            retry_with_result(&cancel, &fast_config(3), flaky(counter.clone(), 2)).await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_attempts_and_returns_last_error() {
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicU32::new(0));

        let result =
            retry_with_result(&cancel, &fast_config(3), flaky(counter.clone(), 100)).await;

        assert!(matches!(result, Err(OtpGuardError::ConnectionTimeout(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicU32::new(0));
        let config = fast_config(5).only_for(vec![ErrorCode::ConnectionTimeout]);

        let counter_clone = counter.clone();
        let result = retry_with_result(&cancel, &config, move || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(OtpGuardError::InvalidInput("坏参数".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(OtpGuardError::InvalidInput(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_allow_listed_error_is_retried() {
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicU32::new(0));
        let config = fast_config(3)
            .only_for(vec![ErrorCode::ConnectionTimeout, ErrorCode::StorageError]);

        let counter_clone = counter.clone();
        let result = retry_with_result(&cancel, &config, move || {
            let counter = counter_clone.clone();
            async move {
                let calls = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if calls < 3 {
                    Err(OtpGuardError::StorageError(StorageError::ConnectionError(
                        "断连".to_string(),
                    )))
                } else {
                    Ok(calls)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_hook_fires_before_each_sleep() {
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicU32::new(0));
        let attempts: Arc<parking_lot::Mutex<Vec<u32>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));

        let attempts_clone = attempts.clone();
        let config = fast_config(3).on_retry(Arc::new(move |attempt, _error| {
            attempts_clone.lock().push(attempt);
        }));

        let _ = retry_with_result(&cancel, &config, flaky(counter, 100)).await;

        // 最后一次失败后不再回调
        assert_eq!(attempts.lock().as_slice(), [1, 2]);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_sleep() {
        let cancel = CancellationToken::new();
        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_secs(30),
            jitter: false,
            ..Default::default()
        };

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });

        let started = tokio::time::Instant::now();
        let result = retry_with_result(&cancel, &config, || async {
            Err::<(), _>(OtpGuardError::ConnectionTimeout("down".to_string()))
        })
        .await;

        assert!(matches!(result, Err(OtpGuardError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_already_cancelled_does_not_run_op() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let counter = Arc::new(AtomicU32::new(0));

        let result =
            retry_with_result(&cancel, &fast_config(3), flaky(counter.clone(), 0)).await;

        assert!(matches!(result, Err(OtpGuardError::Cancelled)));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_delay_progression_without_jitter() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            backoff_factor: 2.0,
            jitter: false,
            ..Default::default()
        };

        assert_eq!(calculate_delay(1, &config), Duration::from_millis(100));
        assert_eq!(calculate_delay(2, &config), Duration::from_millis(200));
        // 封顶在max_delay
        assert_eq!(calculate_delay(3, &config), Duration::from_millis(300));
        assert_eq!(calculate_delay(10, &config), Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_bounds() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            jitter: true,
            ..Default::default()
        };

        for _ in 0..50 {
            let delay = calculate_delay(1, &config);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(110));
        }
    }

    #[tokio::test]
    async fn test_retry_unit_variant() {
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = counter.clone();
        let result = retry(&cancel, &fast_config(2), move || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
