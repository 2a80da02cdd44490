//! OTP引擎
//!
//! 按手机号生成、存储并校验短数字验证码。状态完全保存在键值存储中，
//! 过期由存储的TTL机制完成，没有进程内状态，也不需要清理任务。
//!
//! 状态机（每个手机号）:
//! - 不存在 -> 待验证: `generate`写入新验证码并覆盖旧码（同一手机号
//!   同时只有一个有效验证码）
//! - 待验证 -> 已消费: `validate`匹配成功后立即删除
//! - 待验证 -> 过期: 存储TTL到期，隐式发生
//!
//! 验证码错误不会使已存储的验证码失效，合法请求在过期前仍可重试；
//! 暴力尝试由上层的速率限制器拦截。

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::{
    DEFAULT_OTP_CHARSET, DEFAULT_OTP_EXPIRY_SECS, DEFAULT_OTP_KEY_PREFIX, DEFAULT_OTP_LENGTH,
};
use crate::error::OtpGuardError;
use crate::events::EventPublisher;
use crate::metrics::Metrics;
use crate::storage::KvStorage;

/// OTP配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtpConfig {
    /// 验证码位数
    pub length: usize,
    /// 有效期
    pub expiry: Duration,
    /// 存储键前缀，验证码保存在`{prefix}:{phone_number}`
    pub key_prefix: String,
    /// 字符集
    pub charset: String,
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            length: DEFAULT_OTP_LENGTH,
            expiry: Duration::from_secs(DEFAULT_OTP_EXPIRY_SECS),
            key_prefix: DEFAULT_OTP_KEY_PREFIX.to_string(),
            charset: DEFAULT_OTP_CHARSET.to_string(),
        }
    }
}

impl OtpConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<(), String> {
        if self.length == 0 {
            return Err("验证码位数不能为零".to_string());
        }
        if self.key_prefix.is_empty() {
            return Err("键前缀不能为空".to_string());
        }
        Ok(())
    }
}

/// OTP服务
pub struct OtpService {
    storage: Arc<dyn KvStorage>,
    config: OtpConfig,
    metrics: Option<Arc<Metrics>>,
    events: Option<Arc<EventPublisher>>,
}

impl OtpService {
    /// 创建OTP服务
    pub fn new(storage: Arc<dyn KvStorage>, config: OtpConfig) -> Self {
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

    fn otp_key(&self, phone_number: &str) -> String {
        format!("{}:{}", self.config.key_prefix, phone_number)
    }

    /// 生成新验证码
    ///
    /// 覆盖该手机号已有的待验证码并重置TTL。发送频率由速率限制器的
    /// `otp`作用域控制，不在本方法内处理。
    pub async fn generate(&self, phone_number: &str) -> Result<String, OtpGuardError> {
        let code = self.random_code();
        let key = self.otp_key(phone_number);

        self.storage
            .set(&key, &code, Some(self.config.expiry))
            .await?;

        if let Some(metrics) = &self.metrics {
            metrics.record_otp_generated();
        }

        // 带外投递（如短信网关）由事件消费方负责，发布失败只记录
        if let Some(events) = &self.events {
            if let Err(e) = events.publish_otp_generated(phone_number, &code).await {
                warn!(phone_number, "发布OTP生成事件失败: {}", e);
            }
        }

        debug!(phone_number, expiry = ?self.config.expiry, "OTP已生成");
        Ok(code)
    }

    /// 校验验证码
    ///
    /// 匹配成功后删除存储的验证码（一次性消费）；不匹配时验证码
    /// 保持待验证状态。
    pub async fn validate(&self, phone_number: &str, code: &str) -> Result<(), OtpGuardError> {
        let key = self.otp_key(phone_number);
        let stored = self.storage.get(&key).await?;

        match stored {
            None => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_otp_verified(false);
                }
                Err(OtpGuardError::OtpExpiredOrNotFound)
            }
            Some(stored) if stored != code => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_otp_verified(false);
                }
                debug!(phone_number, "OTP校验失败：验证码不匹配");
                Err(OtpGuardError::OtpInvalid)
            }
            Some(_) => {
                self.storage.delete(&[key.as_str()]).await?;
                if let Some(metrics) = &self.metrics {
                    metrics.record_otp_verified(true);
                }
                debug!(phone_number, "OTP校验成功");
                Ok(())
            }
        }
    }

    /// 是否存在待验证的验证码
    pub async fn is_pending(&self, phone_number: &str) -> Result<bool, OtpGuardError> {
        let key = self.otp_key(phone_number);
        Ok(self.storage.get(&key).await?.is_some())
    }

    /// 验证码剩余有效期
    pub async fn ttl(&self, phone_number: &str) -> Result<Option<Duration>, OtpGuardError> {
        let key = self.otp_key(phone_number);
        Ok(self.storage.ttl(&key).await?)
    }

    /// 从字符集均匀抽取生成验证码
    ///
    /// ThreadRng是加密安全的随机源。
    fn random_code(&self) -> String {
        let charset: Vec<char> = if self.config.charset.is_empty() {
            DEFAULT_OTP_CHARSET.chars().collect()
        } else {
            self.config.charset.chars().collect()
        };

        let mut rng = rand::rng();
        (0..self.config.length)
            .map(|_| charset[rng.random_range(0..charset.len())])
            .collect()
    }

    /// 获取配置
    pub fn config(&self) -> &OtpConfig {
        &self.config
    }
}
