//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 指标模块
//!
//! 基于Prometheus的计数器集合。指标对象显式构造并注册到调用方
//! 传入的Registry，不依赖进程级全局注册表。

use prometheus::{IntCounterVec, Opts, Registry};

/// 指标集合
///
/// 通过`register`挂接到一个显式的[`Registry`]，随后在各组件间以
/// `Arc<Metrics>`传递。
#[derive(Clone)]
pub struct Metrics {
    /// OTP操作计数（operation: generate/validate, success: true/false）
    otp_operations_total: IntCounterVec,
    /// 用户操作计数（operation: registration/login）
    user_operations_total: IntCounterVec,
    /// 速率限制拒绝计数（scope: global/auth/otp/user）
    rate_limit_exceeded_total: IntCounterVec,
    /// 事件发布计数（event_type）
    events_published_total: IntCounterVec,
    /// 熔断器状态转换计数（name, state）
    circuit_breaker_transitions_total: IntCounterVec,
}

impl Metrics {
    /// 创建指标集合（未注册）
    pub fn new() -> Result<Self, prometheus::Error> {
        let otp_operations_total = IntCounterVec::new(
            Opts::new("otp_operations_total", "Total number of OTP operations"),
            &["operation", "success"],
        )?;

        let user_operations_total = IntCounterVec::new(
            Opts::new("user_operations_total", "Total number of user operations"),
            &["operation"],
        )?;

        let rate_limit_exceeded_total = IntCounterVec::new(
            Opts::new(
                "rate_limit_exceeded_total",
                "Total number of rate limit violations",
            ),
            &["scope"],
        )?;

        let events_published_total = IntCounterVec::new(
            Opts::new("events_published_total", "Total number of published events"),
            &["event_type"],
        )?;

        let circuit_breaker_transitions_total = IntCounterVec::new(
            Opts::new(
                "circuit_breaker_transitions_total",
                "Total number of circuit breaker state transitions",
            ),
            &["name", "state"],
        )?;

        Ok(Self {
            otp_operations_total,
            user_operations_total,
            rate_limit_exceeded_total,
            events_published_total,
            circuit_breaker_transitions_total,
        })
    }

    /// 注册所有指标到给定Registry
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.otp_operations_total.clone()))?;
        registry.register(Box::new(self.user_operations_total.clone()))?;
        registry.register(Box::new(self.rate_limit_exceeded_total.clone()))?;
        registry.register(Box::new(self.events_published_total.clone()))?;
        registry.register(Box::new(self.circuit_breaker_transitions_total.clone()))?;
        Ok(())
    }

    /// 记录OTP生成
    pub fn record_otp_generated(&self) {
        self.otp_operations_total
            .with_label_values(&["generate", "true"])
            .inc();
    }

    /// 记录OTP校验结果
    pub fn record_otp_verified(&self, success: bool) {
        let success = if success { "true" } else { "false" };
        self.otp_operations_total
            .with_label_values(&["validate", success])
            .inc();
    }

    /// 记录用户注册
    pub fn record_user_registration(&self) {
        self.user_operations_total
            .with_label_values(&["registration"])
            .inc();
    }

    /// 记录用户登录
    pub fn record_user_login(&self) {
        self.user_operations_total
            .with_label_values(&["login"])
            .inc();
    }

    /// 记录速率限制拒绝
    pub fn record_rate_limit_exceeded(&self, scope: &str) {
        self.rate_limit_exceeded_total
            .with_label_values(&[scope])
            .inc();
    }

    /// 记录事件发布
    pub fn record_event_published(&self, event_type: &str) {
        self.events_published_total
            .with_label_values(&[event_type])
            .inc();
    }

    /// 记录熔断器状态转换
    pub fn record_circuit_breaker_transition(&self, name: &str, state: &str) {
        self.circuit_breaker_transitions_total
            .with_label_values(&[name, state])
            .inc();
    }

    /// 读取速率限制拒绝计数
    pub fn rate_limit_exceeded_count(&self, scope: &str) -> u64 {
        self.rate_limit_exceeded_total
            .with_label_values(&[scope])
            .get()
    }

    /// 读取OTP操作计数
    pub fn otp_operation_count(&self, operation: &str, success: bool) -> u64 {
        let success = if success { "true" } else { "false" };
        self.otp_operations_total
            .with_label_values(&[operation, success])
            .get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register() {
        let registry = Registry::new();
        let metrics = Metrics::new().unwrap();
        metrics.register(&registry).unwrap();

        metrics.record_otp_generated();
        metrics.record_rate_limit_exceeded("otp");

        let families = registry.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"otp_operations_total"));
        assert!(names.contains(&"rate_limit_exceeded_total"));
    }

    #[test]
    fn test_metrics_counters() {
        let metrics = Metrics::new().unwrap();

        metrics.record_otp_generated();
        metrics.record_otp_verified(true);
        metrics.record_otp_verified(false);
        metrics.record_rate_limit_exceeded("otp");
        metrics.record_rate_limit_exceeded("otp");

        assert_eq!(metrics.otp_operation_count("generate", true), 1);
        assert_eq!(metrics.otp_operation_count("validate", true), 1);
        assert_eq!(metrics.otp_operation_count("validate", false), 1);
        assert_eq!(metrics.rate_limit_exceeded_count("otp"), 2);
        assert_eq!(metrics.rate_limit_exceeded_count("global"), 0);
    }

    #[test]
    fn test_duplicate_register_fails() {
        let registry = Registry::new();
        let metrics = Metrics::new().unwrap();
        metrics.register(&registry).unwrap();
        assert!(metrics.register(&registry).is_err());
    }
}
