//! 事件总线
//!
//! 基于存储层发布/订阅通道的通知层，用于解耦OTP和用户生命周期事件
//! 与其消费者。投递语义为至多一次：无重放、无跨订阅者顺序保证，
//! 处理器失败只记录日志，不影响其他处理器和分发循环。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::{DEFAULT_EVENTS_CHANNEL, EVENT_SCHEMA_VERSION, EVENT_SOURCE};
use crate::error::OtpGuardError;
use crate::metrics::Metrics;
use crate::storage::KvStorage;

/// 事件
///
/// 发布后不可变。以JSON编码后在单一命名频道上传输。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// 事件ID
    pub id: uuid::Uuid,
    /// 事件类型
    #[serde(rename = "type")]
    pub event_type: String,
    /// 负载（键值映射）
    pub payload: HashMap<String, serde_json::Value>,
    /// 产生时间
    pub timestamp: DateTime<Utc>,
    /// 来源服务
    pub source: String,
    /// 负载格式版本
    #[serde(rename = "version")]
    pub schema_version: String,
}

impl Event {
    /// 创建新事件
    pub fn new(
        event_type: impl Into<String>,
        payload: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
            source: EVENT_SOURCE.to_string(),
            schema_version: EVENT_SCHEMA_VERSION.to_string(),
        }
    }

    /// 序列化为JSON
    pub fn to_json(&self) -> Result<String, OtpGuardError> {
        Ok(serde_json::to_string(self)?)
    }

    /// 从JSON反序列化
    pub fn from_json(data: &str) -> Result<Self, OtpGuardError> {
        Ok(serde_json::from_str(data)?)
    }
}

/// 单个事件类型的配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventTypeConfig {
    /// 线上事件类型名
    pub name: String,
    /// 是否启用发布
    pub enabled: bool,
}

impl EventTypeConfig {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
        }
    }
}

/// 事件系统配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// 总开关，关闭后发布与订阅都成为空操作
    pub enabled: bool,
    /// 发布频道
    pub channel: String,
    /// OTP生成事件
    pub otp_generated: EventTypeConfig,
    /// OTP校验成功事件
    pub otp_verified: EventTypeConfig,
    /// 用户创建事件
    pub user_created: EventTypeConfig,
    /// 用户登录事件
    pub user_logged_in: EventTypeConfig,
    /// 速率限制拒绝事件
    pub rate_limited: EventTypeConfig,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel: DEFAULT_EVENTS_CHANNEL.to_string(),
            otp_generated: EventTypeConfig::new("otp_generated"),
            otp_verified: EventTypeConfig::new("otp_verified"),
            user_created: EventTypeConfig::new("user_created"),
            user_logged_in: EventTypeConfig::new("user_logged_in"),
            rate_limited: EventTypeConfig::new("rate_limited"),
        }
    }
}

impl EventsConfig {
    /// 检查事件类型是否启用
    ///
    /// 未登记的类型默认启用。
    pub fn is_event_enabled(&self, event_type: &str) -> bool {
        for config in [
            &self.otp_generated,
            &self.otp_verified,
            &self.user_created,
            &self.user_logged_in,
            &self.rate_limited,
        ] {
            if config.name == event_type {
                return config.enabled;
            }
        }
        true
    }
}

/// 事件发布器
pub struct EventPublisher {
    storage: Arc<dyn KvStorage>,
    config: EventsConfig,
    metrics: Option<Arc<Metrics>>,
}

impl EventPublisher {
    /// 创建发布器
    pub fn new(
        storage: Arc<dyn KvStorage>,
        config: EventsConfig,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            storage,
            config,
            metrics,
        }
    }

    /// 发布事件
    ///
    /// 总开关或该事件类型被禁用时直接返回`Ok`。
    pub async fn publish(&self, event: &Event) -> Result<(), OtpGuardError> {
        if !self.config.enabled || !self.config.is_event_enabled(&event.event_type) {
            return Ok(());
        }

        let data = event.to_json()?;
        self.storage.publish(&self.config.channel, &data).await?;

        if let Some(metrics) = &self.metrics {
            metrics.record_event_published(&event.event_type);
        }

        debug!(
            event_type = %event.event_type,
            event_id = %event.id,
            "事件已发布"
        );
        Ok(())
    }

    /// 发布OTP生成事件
    pub async fn publish_otp_generated(
        &self,
        phone_number: &str,
        otp_code: &str,
    ) -> Result<(), OtpGuardError> {
        let event = Event::new(
            self.config.otp_generated.name.clone(),
            HashMap::from([
                ("phone_number".to_string(), json!(phone_number)),
                ("otp_code".to_string(), json!(otp_code)),
            ]),
        );
        self.publish(&event).await
    }

    /// 发布OTP校验成功事件
    pub async fn publish_otp_verified(
        &self,
        phone_number: &str,
        user_id: i64,
    ) -> Result<(), OtpGuardError> {
        let event = Event::new(
            self.config.otp_verified.name.clone(),
            HashMap::from([
                ("phone_number".to_string(), json!(phone_number)),
                ("user_id".to_string(), json!(user_id)),
            ]),
        );
        self.publish(&event).await
    }

    /// 发布用户创建事件
    pub async fn publish_user_created(
        &self,
        user_id: i64,
        phone_number: &str,
    ) -> Result<(), OtpGuardError> {
        let event = Event::new(
            self.config.user_created.name.clone(),
            HashMap::from([
                ("user_id".to_string(), json!(user_id)),
                ("phone_number".to_string(), json!(phone_number)),
            ]),
        );
        self.publish(&event).await
    }

    /// 发布用户登录事件
    pub async fn publish_user_logged_in(
        &self,
        user_id: i64,
        phone_number: &str,
    ) -> Result<(), OtpGuardError> {
        let event = Event::new(
            self.config.user_logged_in.name.clone(),
            HashMap::from([
                ("user_id".to_string(), json!(user_id)),
                ("phone_number".to_string(), json!(phone_number)),
            ]),
        );
        self.publish(&event).await
    }

    /// 发布速率限制拒绝事件
    pub async fn publish_rate_limited(
        &self,
        scope: &str,
        identifier: &str,
    ) -> Result<(), OtpGuardError> {
        let event = Event::new(
            self.config.rate_limited.name.clone(),
            HashMap::from([
                ("scope".to_string(), json!(scope)),
                ("identifier".to_string(), json!(identifier)),
            ]),
        );
        self.publish(&event).await
    }
}

/// 事件处理器
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// 处理一条事件
    async fn handle(&self, event: Event) -> Result<(), OtpGuardError>;
}

/// 事件订阅器
///
/// 按事件类型登记处理器，`"*"`匹配所有类型。每条消息对所有匹配的
/// 处理器并发扇出，等待全部完成后再处理下一条，失败逐个记录日志。
pub struct EventSubscriber {
    storage: Arc<dyn KvStorage>,
    config: EventsConfig,
    handlers: parking_lot::RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl EventSubscriber {
    /// 创建订阅器
    pub fn new(storage: Arc<dyn KvStorage>, config: EventsConfig) -> Self {
        Self {
            storage,
            config,
            handlers: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    /// 登记处理器
    pub fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        if !self.config.enabled {
            return;
        }
        self.handlers
            .write()
            .entry(event_type.to_string())
            .or_default()
            .push(handler);
    }

    /// 运行订阅循环，直到取消信号触发
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), OtpGuardError> {
        if !self.config.enabled {
            return Ok(());
        }

        let mut rx = self.storage.subscribe(&self.config.channel).await?;
        info!(channel = %self.config.channel, "事件订阅循环启动");

        loop {
            tokio::select! {
                message = rx.recv() => {
                    match message {
                        Some(payload) => {
                            let event = match Event::from_json(&payload) {
                                Ok(event) => event,
                                Err(e) => {
                                    warn!("丢弃无法解析的事件: {}", e);
                                    continue;
                                }
                            };
                            self.dispatch(event).await;
                        }
                        None => {
                            warn!("事件频道已关闭，订阅循环退出");
                            return Ok(());
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    info!("事件订阅循环已取消");
                    return Ok(());
                }
            }
        }
    }

    /// 并发分发一条事件到所有匹配的处理器
    async fn dispatch(&self, event: Event) {
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let map = self.handlers.read();
            match map.get(&event.event_type) {
                Some(list) if !list.is_empty() => list.clone(),
                _ => map.get("*").cloned().unwrap_or_default(),
            }
        };

        if handlers.is_empty() {
            return;
        }

        let event_type = event.event_type.clone();
        let mut tasks = JoinSet::new();
        for handler in handlers {
            let event = event.clone();
            tasks.spawn(async move { handler.handle(event).await });
        }

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(event_type = %event_type, "事件处理器失败: {}", e);
                }
                Err(e) => {
                    warn!(event_type = %event_type, "事件处理器任务异常: {}", e);
                }
            }
        }
    }
}

/// 事件服务
///
/// 发布器与订阅器的组合门面。
pub struct EventService {
    publisher: Arc<EventPublisher>,
    subscriber: Arc<EventSubscriber>,
}

impl EventService {
    /// 创建事件服务
    pub fn new(
        storage: Arc<dyn KvStorage>,
        config: EventsConfig,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            publisher: Arc::new(EventPublisher::new(
                storage.clone(),
                config.clone(),
                metrics,
            )),
            subscriber: Arc::new(EventSubscriber::new(storage, config)),
        }
    }

    /// 获取发布器
    pub fn publisher(&self) -> Arc<EventPublisher> {
        self.publisher.clone()
    }

    /// 获取订阅器
    pub fn subscriber(&self) -> Arc<EventSubscriber> {
        self.subscriber.clone()
    }

    /// 登记处理器
    pub fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        self.subscriber.subscribe(event_type, handler);
    }

    /// 启动订阅循环
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), OtpGuardError> {
        self.subscriber.run(cancel).await
    }
}

/// 日志事件处理器
///
/// 订阅`"*"`，把收到的事件按类型写入日志，用作默认的观察性消费者。
pub struct LogEventHandler {
    config: EventsConfig,
}

impl LogEventHandler {
    /// 创建日志处理器
    pub fn new(config: EventsConfig) -> Self {
        Self { config }
    }

    fn payload_str<'a>(event: &'a Event, key: &str) -> &'a str {
        event
            .payload
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventHandler for LogEventHandler {
    async fn handle(&self, event: Event) -> Result<(), OtpGuardError> {
        let event_type = event.event_type.as_str();
        if event_type == self.config.otp_generated.name
            || event_type == self.config.otp_verified.name
        {
            info!(
                event_type,
                event_id = %event.id,
                phone_number = Self::payload_str(&event, "phone_number"),
                "OTP事件"
            );
        } else if event_type == self.config.user_created.name
            || event_type == self.config.user_logged_in.name
        {
            info!(
                event_type,
                event_id = %event.id,
                phone_number = Self::payload_str(&event, "phone_number"),
                "用户事件"
            );
        } else if event_type == self.config.rate_limited.name {
            warn!(
                event_type,
                event_id = %event.id,
                scope = Self::payload_str(&event, "scope"),
                identifier = Self::payload_str(&event, "identifier"),
                "速率限制事件"
            );
        } else {
            debug!(event_type, event_id = %event.id, "未知事件类型");
        }
        Ok(())
    }
}
