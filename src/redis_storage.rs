//! Redis客户端封装
//!
//! 基于ConnectionManager的键值存储实现，带指数退避重试。
//! 发布/订阅使用独立连接，消息经mpsc通道转发给订阅方，
//! 接收端关闭后转发任务退出并随之退订。

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use secrecy::{ExposeSecret, Secret};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{get_env, get_env_as_u32, get_env_as_u64, get_env_as_duration};
use crate::constants::EVENT_SUBSCRIPTION_BUFFER;
use crate::error::StorageError;
use crate::storage::KvStorage;

/// 单次重试退避上限
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Redis配置
#[derive(Clone)]
pub struct RedisConfig {
    /// 连接URL
    pub url: String,
    /// 数据库索引
    pub db: i64,
    /// 密码（Secret包装，防止意外泄露到日志）
    pub password: Option<Secret<String>>,
    /// 连接超时
    pub connection_timeout: Duration,
    /// 命令最大重试次数
    pub max_retries: u32,
    /// 重试初始退避时间
    pub retry_initial_backoff: Duration,
}

impl std::fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConfig")
            .field("url", &self.url)
            .field("db", &self.db)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("connection_timeout", &self.connection_timeout)
            .field("max_retries", &self.max_retries)
            .field("retry_initial_backoff", &self.retry_initial_backoff)
            .finish()
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            db: 0,
            password: None,
            connection_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_initial_backoff: Duration::from_millis(100),
        }
    }
}

impl RedisConfig {
    /// 创建新的Redis配置
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// 从环境变量加载
    pub fn from_env() -> Self {
        let host = get_env("REDIS_HOST", "127.0.0.1");
        let port = get_env("REDIS_PORT", "6379");
        let url = get_env("REDIS_URL", &format!("redis://{}:{}", host, port));

        let password = match std::env::var("REDIS_PASSWORD") {
            Ok(password) if !password.is_empty() => Some(Secret::new(password)),
            _ => None,
        };

        Self {
            url,
            db: get_env_as_u64("REDIS_DB", 0) as i64,
            password,
            connection_timeout: get_env_as_duration(
                "REDIS_CONNECTION_TIMEOUT",
                Duration::from_secs(5),
            ),
            max_retries: get_env_as_u32("REDIS_MAX_RETRIES", 3),
            retry_initial_backoff: Duration::from_millis(100),
        }
    }

    /// 设置数据库索引
    pub fn db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    /// 设置密码
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Secret::new(password.into()));
        self
    }

    /// 设置最大重试次数
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

/// Redis存储实现
#[derive(Clone)]
pub struct RedisStorage {
    conn_manager: ConnectionManager,
    client: Client,
    config: RedisConfig,
}

impl RedisStorage {
    /// 创建Redis存储并验证连通性
    pub async fn new(config: RedisConfig) -> Result<Self, StorageError> {
        info!(url = %config.url, "创建Redis存储");

        let client = build_client(&config)?;
        let conn_manager = ConnectionManager::new(client.clone())
            .await
            .map_err(map_redis_error)?;

        let storage = Self {
            conn_manager,
            client,
            config,
        };
        storage.ping().await?;

        info!("Redis存储创建成功");
        Ok(storage)
    }

    /// 带重试地执行命令
    async fn execute_with_retry<T, F, Fut>(&self, operation: F) -> Result<T, StorageError>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: Future<Output = Result<T, redis::RedisError>>,
    {
        let mut attempt = 0;
        let mut backoff = self.config.retry_initial_backoff;

        loop {
            match operation(self.conn_manager.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return Err(map_redis_error(e));
                    }
                    warn!(attempt, backoff = ?backoff, "Redis命令失败，准备重试: {}", e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
                }
            }
        }
    }
}

#[async_trait]
impl KvStorage for RedisStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.execute_with_retry(|mut conn| async move {
            redis::cmd("GET")
                .arg(key)
                .query_async::<_, Option<String>>(&mut conn)
                .await
        })
        .await
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        self.execute_with_retry(|mut conn| async move {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("EX").arg(ttl.as_secs().max(1));
            }
            cmd.query_async::<_, ()>(&mut conn).await
        })
        .await
    }

    async fn delete(&self, keys: &[&str]) -> Result<(), StorageError> {
        if keys.is_empty() {
            return Ok(());
        }
        self.execute_with_retry(|mut conn| async move {
            let mut cmd = redis::cmd("DEL");
            for key in keys {
                cmd.arg(*key);
            }
            cmd.query_async::<_, i64>(&mut conn).await.map(|_| ())
        })
        .await
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, StorageError> {
        // SCAN游标遍历，避免KEYS阻塞服务器
        let mut removed: u64 = 0;
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = self
                .execute_with_retry(|mut conn| async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(100)
                        .query_async(&mut conn)
                        .await
                })
                .await?;

            if !keys.is_empty() {
                let deleted: i64 = self
                    .execute_with_retry(|mut conn| {
                        let keys = keys.clone();
                        async move {
                            let mut cmd = redis::cmd("DEL");
                            for key in &keys {
                                cmd.arg(key);
                            }
                            cmd.query_async(&mut conn).await
                        }
                    })
                    .await?;
                removed += deleted.max(0) as u64;
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        debug!(pattern, removed, "按模式删除完成");
        Ok(removed)
    }

    async fn incr(&self, key: &str) -> Result<i64, StorageError> {
        self.execute_with_retry(|mut conn| async move {
            redis::cmd("INCR").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError> {
        self.execute_with_retry(|mut conn| async move {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(ttl.as_secs().max(1))
                .query_async::<_, i64>(&mut conn)
                .await
        })
        .await
        .map(|updated| updated == 1)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StorageError> {
        let ttl: i64 = self
            .execute_with_retry(|mut conn| async move {
                redis::cmd("TTL").arg(key).query_async(&mut conn).await
            })
            .await?;

        // -2 键不存在，-1 未设置过期时间
        if ttl < 0 {
            return Ok(None);
        }
        Ok(Some(Duration::from_secs(ttl as u64)))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StorageError> {
        self.execute_with_retry(|mut conn| async move {
            redis::cmd("PUBLISH")
                .arg(channel)
                .arg(payload)
                .query_async::<_, i64>(&mut conn)
                .await
                .map(|_| ())
        })
        .await
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, StorageError> {
        // 发布/订阅需要独立连接
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(map_redis_error)?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(channel).await.map_err(map_redis_error)?;

        let (tx, rx) = mpsc::channel(EVENT_SUBSCRIPTION_BUFFER);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %channel, "读取订阅消息失败: {}", e);
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    // 接收端关闭，退出转发任务即退订
                    break;
                }
            }
            debug!(channel = %channel, "订阅转发任务退出");
        });

        Ok(rx)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.execute_with_retry(|mut conn| async move {
            redis::cmd("PING")
                .query_async::<_, String>(&mut conn)
                .await
                .map(|_| ())
        })
        .await
    }
}

/// 根据配置构造客户端
fn build_client(config: &RedisConfig) -> Result<Client, StorageError> {
    let (host, port) = parse_host_port(&config.url);
    let info = ConnectionInfo {
        addr: ConnectionAddr::Tcp(host, port),
        redis: RedisConnectionInfo {
            db: config.db,
            username: None,
            password: config
                .password
                .as_ref()
                .map(|password| password.expose_secret().clone()),
        },
    };
    Client::open(info).map_err(map_redis_error)
}

/// 从URL中提取主机和端口
fn parse_host_port(url: &str) -> (String, u16) {
    let stripped = url
        .trim_start_matches("rediss://")
        .trim_start_matches("redis://");

    // 去掉可能携带的认证信息
    let stripped = match stripped.find('@') {
        Some(at) => &stripped[at + 1..],
        None => stripped,
    };

    // 去掉数据库路径
    let stripped = match stripped.find('/') {
        Some(slash) => &stripped[..slash],
        None => stripped,
    };

    match stripped.rfind(':') {
        Some(colon) => {
            let host = stripped[..colon].to_string();
            let port = stripped[colon + 1..].parse().unwrap_or(6379);
            (host, port)
        }
        None => (stripped.to_string(), 6379),
    }
}

fn map_redis_error(e: redis::RedisError) -> StorageError {
    if e.is_timeout() {
        StorageError::TimeoutError(e.to_string())
    } else if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
        StorageError::ConnectionError(e.to_string())
    } else {
        StorageError::QueryError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::KvStorage;

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_host_port("redis://127.0.0.1:6379"),
            ("127.0.0.1".to_string(), 6379)
        );
        assert_eq!(
            parse_host_port("redis://:secret@cache.internal:6380/2"),
            ("cache.internal".to_string(), 6380)
        );
        assert_eq!(
            parse_host_port("redis://localhost"),
            ("localhost".to_string(), 6379)
        );
        assert_eq!(
            parse_host_port("rediss://cache:7000"),
            ("cache".to_string(), 7000)
        );
    }

    #[test]
    fn test_config_debug_masks_password() {
        let config = RedisConfig::default().password("hunter2");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("***"));
    }

    #[test]
    fn test_config_builder() {
        let config = RedisConfig::new("redis://cache:6379").db(3).max_retries(5);
        assert_eq!(config.url, "redis://cache:6379");
        assert_eq!(config.db, 3);
        assert_eq!(config.max_retries, 5);
    }

    // 以下测试需要本地Redis实例，默认跳过:
    // cargo test --features redis -- --ignored

    #[tokio::test]
    #[ignore]
    async fn test_roundtrip_against_local_redis() {
        let storage = RedisStorage::new(RedisConfig::default()).await.unwrap();

        storage
            .set("otpguard:test:key", "value", Some(Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(
            storage.get("otpguard:test:key").await.unwrap(),
            Some("value".to_string())
        );

        let ttl = storage.ttl("otpguard:test:key").await.unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(30));

        storage.delete(&["otpguard:test:key"]).await.unwrap();
        assert_eq!(storage.get("otpguard:test:key").await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore]
    async fn test_incr_and_pattern_against_local_redis() {
        let storage = RedisStorage::new(RedisConfig::default()).await.unwrap();

        storage.delete_pattern("otpguard:test:*").await.unwrap();
        assert_eq!(storage.incr("otpguard:test:counter").await.unwrap(), 1);
        assert_eq!(storage.incr("otpguard:test:counter").await.unwrap(), 2);
        assert!(storage
            .expire("otpguard:test:counter", Duration::from_secs(30))
            .await
            .unwrap());

        let removed = storage.delete_pattern("otpguard:test:*").await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    #[ignore]
    async fn test_pubsub_against_local_redis() {
        let storage = RedisStorage::new(RedisConfig::default()).await.unwrap();

        let mut rx = storage.subscribe("otpguard:test:events").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        storage
            .publish("otpguard:test:events", "hello")
            .await
            .unwrap();
        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message, "hello");
    }
}
