//! 认证应用服务
//!
//! 编排OTP下发与校验流程：手机号校验 -> `otp`作用域限流 -> 验证码
//! 生成；校验成功后经熔断器访问用户仓储完成查找或注册。
//! JWT签发和HTTP路由属于外层胶水，不在本库内。

use std::sync::Arc;

use tracing::{info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::error::OtpGuardError;
use crate::events::EventPublisher;
use crate::metrics::Metrics;
use crate::otp::OtpService;
use crate::rate_limiter::{RateLimitDecision, RateLimitScope, RateLimiter};
use crate::user::{User, UserRepository};

/// 校验E.164格式手机号
///
/// 要求加号开头、首位国家码数字为1-9、总位数2到15。
pub fn validate_phone_number(phone_number: &str) -> Result<(), OtpGuardError> {
    let digits = phone_number
        .strip_prefix('+')
        .ok_or_else(|| OtpGuardError::InvalidInput("手机号必须以+开头".to_string()))?;

    if digits.len() < 2 || digits.len() > 15 {
        return Err(OtpGuardError::InvalidInput(
            "手机号长度必须为2到15位数字".to_string(),
        ));
    }
    if !digits.starts_with(|c: char| ('1'..='9').contains(&c)) {
        return Err(OtpGuardError::InvalidInput(
            "国家码不能以0开头".to_string(),
        ));
    }
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(OtpGuardError::InvalidInput(
            "手机号只能包含数字".to_string(),
        ));
    }
    Ok(())
}

/// 认证服务
pub struct AuthService {
    user_repo: Arc<dyn UserRepository>,
    otp: Arc<OtpService>,
    rate_limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    events: Option<Arc<EventPublisher>>,
    metrics: Option<Arc<Metrics>>,
}

impl AuthService {
    /// 创建认证服务
    pub fn new(
        user_repo: Arc<dyn UserRepository>,
        otp: Arc<OtpService>,
        rate_limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            user_repo,
            otp,
            rate_limiter,
            breaker,
            events: None,
            metrics: None,
        }
    }

    /// 挂接事件发布器
    pub fn with_events(mut self, events: Arc<EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// 挂接指标
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// 下发验证码
    ///
    /// 按手机号在`otp`作用域内限流，超限返回`RateLimitExceeded`。
    pub async fn send_otp(&self, phone_number: &str) -> Result<String, OtpGuardError> {
        validate_phone_number(phone_number)?;

        match self
            .rate_limiter
            .check_and_consume(RateLimitScope::Otp, phone_number)
            .await
        {
            RateLimitDecision::Denied { message, .. } => {
                Err(OtpGuardError::RateLimitExceeded(message))
            }
            RateLimitDecision::Allowed { .. } => self.otp.generate(phone_number).await,
        }
    }

    /// 校验验证码并完成登录或注册
    ///
    /// 验证码匹配后查找用户；不存在则注册新用户，存在则刷新最后
    /// 活跃时间。仓储访问经熔断器保护。
    pub async fn verify_otp(
        &self,
        phone_number: &str,
        code: &str,
        name: &str,
    ) -> Result<User, OtpGuardError> {
        validate_phone_number(phone_number)?;
        self.otp.validate(phone_number, code).await?;

        let existing = {
            let repo = self.user_repo.clone();
            let phone = phone_number.to_string();
            self.breaker
                .execute(|| async move { repo.get_by_phone_number(&phone).await })
                .await?
        };

        let user = match existing {
            Some(mut user) => {
                user.update_last_seen();
                {
                    let repo = self.user_repo.clone();
                    let user = user.clone();
                    self.breaker
                        .execute(|| async move { repo.update(&user).await })
                        .await?;
                }

                if let Some(metrics) = &self.metrics {
                    metrics.record_user_login();
                }
                if let Some(events) = &self.events {
                    if let Err(e) = events
                        .publish_user_logged_in(user.id, phone_number)
                        .await
                    {
                        warn!("发布用户登录事件失败: {}", e);
                    }
                }
                info!(user_id = user.id, phone_number, "用户登录");
                user
            }
            None => {
                let user = {
                    let repo = self.user_repo.clone();
                    let mut user = User::new(phone_number, name);
                    self.breaker
                        .execute(|| async move {
                            repo.create(&mut user).await?;
                            Ok(user)
                        })
                        .await?
                };

                if let Some(metrics) = &self.metrics {
                    metrics.record_user_registration();
                }
                if let Some(events) = &self.events {
                    if let Err(e) = events.publish_user_created(user.id, phone_number).await
                    {
                        warn!("发布用户创建事件失败: {}", e);
                    }
                }
                info!(user_id = user.id, phone_number, "用户注册");
                user
            }
        };

        if let Some(events) = &self.events {
            if let Err(e) = events.publish_otp_verified(phone_number, user.id).await {
                warn!("发布OTP校验事件失败: {}", e);
            }
        }

        Ok(user)
    }
}
