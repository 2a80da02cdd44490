//! 熔断器实现
//!
//! 提供熔断器功能，保护下游依赖（数据库、缓存），支持三状态转换和
//! 自动恢复。
//!
//! # 特性
//!
//! - **三状态**: Closed（关闭）、Open（打开）、HalfOpen（半开）
//! - **自动熔断**: 失败次数达到阈值自动熔断
//! - **惰性恢复**: 打开状态下每次调用检查超时，超时后进入半开
//! - **受限探测**: 半开状态下通过信号量限制并发探测数
//! - **后台状态管理**: 周期任务在无流量时推进状态并清理过期失败计数
//! - **状态快照**: 尽力而为地写入键值存储，仅作遥测，内存状态是唯一权威

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tracing::{info, trace, warn};

use crate::constants::{
    CIRCUIT_BREAKER_SNAPSHOT_TTL_SECS, DEFAULT_CIRCUIT_BREAKER_FAILURE_THRESHOLD,
    DEFAULT_CIRCUIT_BREAKER_MAX_CONCURRENT_PROBES, DEFAULT_CIRCUIT_BREAKER_MIN_REQUEST_COUNT,
    DEFAULT_CIRCUIT_BREAKER_SUCCESS_THRESHOLD, DEFAULT_CIRCUIT_BREAKER_TIMEOUT_SECS,
    DEFAULT_CIRCUIT_BREAKER_WINDOW_SECS,
};
use crate::error::{CircuitBreakerStats, CircuitState, OtpGuardError};
use crate::metrics::Metrics;
use crate::storage::KvStorage;

/// 熔断器配置
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CircuitBreakerConfig {
    /// 失败阈值（达到此值时熔断）
    pub failure_threshold: u32,
    /// 成功阈值（半开状态下达到此值时恢复）
    pub success_threshold: u32,
    /// 超时时间（打开状态等待此时间后允许探测）
    pub timeout: Duration,
    /// 半开状态的最大并发探测数
    pub max_concurrent_probes: u32,
    /// 失败统计窗口（窗口内无新失败则清零计数）
    pub window_size: Duration,
    /// 窗口内最小请求数
    pub min_request_count: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_CIRCUIT_BREAKER_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_CIRCUIT_BREAKER_SUCCESS_THRESHOLD,
            timeout: Duration::from_secs(DEFAULT_CIRCUIT_BREAKER_TIMEOUT_SECS),
            max_concurrent_probes: DEFAULT_CIRCUIT_BREAKER_MAX_CONCURRENT_PROBES,
            window_size: Duration::from_secs(DEFAULT_CIRCUIT_BREAKER_WINDOW_SECS),
            min_request_count: DEFAULT_CIRCUIT_BREAKER_MIN_REQUEST_COUNT,
        }
    }
}

impl CircuitBreakerConfig {
    /// 创建新的熔断器配置
    pub fn new(failure_threshold: u32, success_threshold: u32, timeout: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            timeout,
            ..Default::default()
        }
    }

    /// 设置半开状态的最大并发探测数
    pub fn max_concurrent_probes(mut self, probes: u32) -> Self {
        self.max_concurrent_probes = probes;
        self
    }

    /// 设置失败统计窗口
    pub fn window_size(mut self, window: Duration) -> Self {
        self.window_size = window;
        self
    }
}

/// 受锁保护的熔断器内部状态
///
/// 状态转换在同一把锁下完成，单实例内转换是全序的。
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    total_calls: u64,
    last_failure: Option<Instant>,
    last_state_change: Instant,
}

/// 熔断器
///
/// 每个受保护的依赖创建一个实例，随进程存活。
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    probes: Arc<Semaphore>,
    storage: Option<Arc<dyn KvStorage>>,
    metrics: Option<Arc<Metrics>>,
    state_manager: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl CircuitBreaker {
    /// 创建新的熔断器
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            name = %name,
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            timeout = ?config.timeout,
            "创建熔断器"
        );

        let probes = Arc::new(Semaphore::new(config.max_concurrent_probes.max(1) as usize));
        Self {
            name,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                total_calls: 0,
                last_failure: None,
                last_state_change: Instant::now(),
            }),
            probes,
            storage: None,
            metrics: None,
            state_manager: Mutex::new(None),
            config,
        }
    }

    /// 挂接键值存储用于状态快照（尽力而为）
    pub fn with_storage(mut self, storage: Arc<dyn KvStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// 挂接指标
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// 执行操作，自动处理熔断逻辑
    ///
    /// 关闭状态下操作总是执行；打开状态下立即以`CircuitOpen`拒绝，
    /// 除非超时已过（此时转入半开并作为探测放行）；半开状态下最多
    /// 允许`max_concurrent_probes`个并发探测，超出的调用被拒绝。
    /// 操作自身的错误原样返回，不与熔断拒绝混同。
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, OtpGuardError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, OtpGuardError>>,
    {
        let _permit = self.admit().await?;

        let result = operation().await;

        self.record(result.is_ok()).await;
        result
    }

    /// 异步执行变体
    ///
    /// 立即返回接收端，调用方稍后读取结果。
    pub fn execute_async<F, Fut, T>(
        self: &Arc<Self>,
        operation: F,
    ) -> oneshot::Receiver<Result<T, OtpGuardError>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, OtpGuardError>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let breaker = self.clone();
        tokio::spawn(async move {
            let result = breaker.execute(operation).await;
            let _ = tx.send(result);
        });
        rx
    }

    /// 准入检查
    ///
    /// 返回半开探测持有的许可（关闭状态下为`None`）。
    async fn admit(&self) -> Result<Option<OwnedSemaphorePermit>, OtpGuardError> {
        let mut changed_to = None;
        let admitted = {
            let mut inner = self.inner.lock();
            inner.total_calls += 1;

            match inner.state {
                CircuitState::Closed => Ok(None),
                CircuitState::Open => {
                    // 惰性转换：每次调用时检查超时
                    if inner.last_state_change.elapsed() >= self.config.timeout {
                        self.transition_locked(&mut inner, CircuitState::HalfOpen);
                        changed_to = Some(CircuitState::HalfOpen);
                        self.acquire_probe()
                    } else {
                        Err(OtpGuardError::CircuitOpen(format!(
                            "熔断器[{}]打开，请求被拒绝",
                            self.name
                        )))
                    }
                }
                CircuitState::HalfOpen => self.acquire_probe(),
            }
        };

        if let Some(state) = changed_to {
            self.publish_transition(state).await;
        }
        admitted
    }

    fn acquire_probe(&self) -> Result<Option<OwnedSemaphorePermit>, OtpGuardError> {
        match self.probes.clone().try_acquire_owned() {
            Ok(permit) => Ok(Some(permit)),
            Err(_) => Err(OtpGuardError::CircuitOpen(format!(
                "熔断器[{}]半开探测并发已达上限",
                self.name
            ))),
        }
    }

    /// 记录调用结果并推进状态机
    async fn record(&self, success: bool) {
        let mut changed_to = None;
        {
            let mut inner = self.inner.lock();
            if success {
                inner.successes += 1;
                match inner.state {
                    CircuitState::Closed => {
                        trace!(name = %self.name, successes = inner.successes, "操作成功");
                    }
                    CircuitState::HalfOpen => {
                        if inner.successes >= self.config.success_threshold {
                            self.transition_locked(&mut inner, CircuitState::Closed);
                            changed_to = Some(CircuitState::Closed);
                        } else {
                            trace!(
                                name = %self.name,
                                successes = inner.successes,
                                threshold = self.config.success_threshold,
                                "半开探测成功"
                            );
                        }
                    }
                    CircuitState::Open => {
                        warn!(name = %self.name, "熔断器打开状态下收到成功回报");
                    }
                }
            } else {
                inner.failures += 1;
                inner.last_failure = Some(Instant::now());
                match inner.state {
                    CircuitState::Closed | CircuitState::HalfOpen => {
                        if inner.failures >= self.config.failure_threshold {
                            self.transition_locked(&mut inner, CircuitState::Open);
                            changed_to = Some(CircuitState::Open);
                        } else {
                            trace!(
                                name = %self.name,
                                failures = inner.failures,
                                threshold = self.config.failure_threshold,
                                "操作失败"
                            );
                        }
                    }
                    CircuitState::Open => {
                        warn!(name = %self.name, "熔断器打开状态下收到失败回报");
                    }
                }
            }
        }

        if let Some(state) = changed_to {
            self.publish_transition(state).await;
        }
    }

    /// 状态转换（调用方持有锁）
    ///
    /// 每次转换都把两个计数器清零。
    fn transition_locked(&self, inner: &mut BreakerInner, new_state: CircuitState) {
        let old_state = inner.state;
        if old_state == new_state {
            return;
        }

        inner.state = new_state;
        inner.last_state_change = Instant::now();
        inner.failures = 0;
        inner.successes = 0;

        if new_state == CircuitState::Open {
            warn!(
                name = %self.name,
                "熔断器状态变更: {} -> {}", old_state, new_state
            );
        } else {
            info!(
                name = %self.name,
                "熔断器状态变更: {} -> {}", old_state, new_state
            );
        }
    }

    /// 转换后的旁路动作：指标与状态快照
    async fn publish_transition(&self, new_state: CircuitState) {
        if let Some(metrics) = &self.metrics {
            metrics.record_circuit_breaker_transition(&self.name, new_state.as_str());
        }
        self.persist_state().await;
    }

    /// 写入状态快照（尽力而为，失败只记录日志）
    async fn persist_state(&self) {
        let Some(storage) = &self.storage else {
            return;
        };

        let stats = self.stats();
        let key = format!("circuit_breaker:{}:state", self.name);
        let payload = match serde_json::to_string(&stats) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(name = %self.name, "序列化熔断器快照失败: {}", e);
                return;
            }
        };

        if let Err(e) = storage
            .set(
                &key,
                &payload,
                Some(Duration::from_secs(CIRCUIT_BREAKER_SNAPSHOT_TTL_SECS)),
            )
            .await
        {
            warn!(name = %self.name, "写入熔断器快照失败: {}", e);
        }
    }

    /// 启动后台状态管理任务
    ///
    /// 周期性地推进 Open -> HalfOpen 超时转换（即使没有流量），并在
    /// 失败窗口内没有新失败时清零失败计数，防止陈旧失败让熔断器
    /// 永久跳闸。重复调用无效果。
    pub fn start_state_manager(self: &Arc<Self>, interval: Duration) {
        let mut guard = self.state_manager.lock();
        if guard.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let breaker = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => breaker.sweep().await,
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        *guard = Some((shutdown_tx, handle));
    }

    /// 停止后台状态管理任务并等待其退出
    pub async fn stop_state_manager(&self) {
        let entry = self.state_manager.lock().take();
        if let Some((shutdown_tx, handle)) = entry {
            let _ = shutdown_tx.send(true);
            let _ = handle.await;
        }
    }

    /// 后台状态检查
    async fn sweep(&self) {
        let mut changed_to = None;
        {
            let mut inner = self.inner.lock();

            if inner.state == CircuitState::Open
                && inner.last_state_change.elapsed() >= self.config.timeout
            {
                self.transition_locked(&mut inner, CircuitState::HalfOpen);
                changed_to = Some(CircuitState::HalfOpen);
            }

            if inner.state == CircuitState::Closed && inner.failures > 0 {
                if let Some(last_failure) = inner.last_failure {
                    if last_failure.elapsed() > self.config.window_size {
                        inner.failures = 0;
                        info!(name = %self.name, "熔断器失败窗口重置");
                    }
                }
            }
        }

        if let Some(state) = changed_to {
            self.publish_transition(state).await;
        }
    }

    /// 强制打开
    pub async fn force_open(&self) {
        {
            let mut inner = self.inner.lock();
            self.transition_locked(&mut inner, CircuitState::Open);
        }
        self.publish_transition(CircuitState::Open).await;
    }

    /// 强制关闭
    pub async fn force_close(&self) {
        {
            let mut inner = self.inner.lock();
            self.transition_locked(&mut inner, CircuitState::Closed);
        }
        self.publish_transition(CircuitState::Closed).await;
    }

    /// 重置到初始状态
    pub async fn reset(&self) {
        info!(name = %self.name, "重置熔断器");
        {
            let mut inner = self.inner.lock();
            inner.failures = 0;
            inner.successes = 0;
            inner.total_calls = 0;
            inner.last_failure = None;
            self.transition_locked(&mut inner, CircuitState::Closed);
            inner.last_state_change = Instant::now();
        }
        self.publish_transition(CircuitState::Closed).await;
    }

    /// 当前状态
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// 是否打开
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// 是否半开
    pub fn is_half_open(&self) -> bool {
        self.state() == CircuitState::HalfOpen
    }

    /// 是否关闭
    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// 获取统计信息
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            total_calls: inner.total_calls,
            last_failure: inner.last_failure.map(instant_to_datetime),
            last_state_change: Some(instant_to_datetime(inner.last_state_change)),
        }
    }

    /// 熔断器名称
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 获取配置
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

fn instant_to_datetime(instant: Instant) -> chrono::DateTime<chrono::Utc> {
    let elapsed = instant.elapsed();
    chrono::Duration::from_std(elapsed)
        .map(|d| chrono::Utc::now() - d)
        .unwrap_or_else(|_| chrono::Utc::now())
}
