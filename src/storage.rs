//! 存储抽象层
//!
//! 定义键值存储接口和内存实现。所有键和值都是UTF-8字符串，
//! 结构化数据以JSON编码后存储。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::constants::EVENT_SUBSCRIPTION_BUFFER;
use crate::error::StorageError;

/// 键值存储接口
///
/// 过期由存储自身负责，调用方不需要额外的清理任务。
/// 计数器操作（incr/expire）是单键原子的。
#[async_trait]
pub trait KvStorage: Send + Sync {
    /// 获取值
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// 设置值（可选过期时间）
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError>;

    /// 删除键
    async fn delete(&self, keys: &[&str]) -> Result<(), StorageError>;

    /// 按通配符模式删除键，返回删除数量
    async fn delete_pattern(&self, pattern: &str) -> Result<u64, StorageError>;

    /// 原子自增，键不存在时从0开始
    async fn incr(&self, key: &str) -> Result<i64, StorageError>;

    /// 设置过期时间，键不存在时返回false
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError>;

    /// 获取剩余过期时间
    ///
    /// 键不存在或未设置过期时间时返回`None`。
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StorageError>;

    /// 向频道发布消息
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StorageError>;

    /// 订阅频道，返回消息接收端
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, StorageError>;

    /// 检查存储连通性
    async fn ping(&self) -> Result<(), StorageError>;
}

/// 内存条目
#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= now)
    }
}

/// 内存存储实现
///
/// 过期采用惰性清理：读取时检查并移除过期条目。
/// 发布/订阅基于有界mpsc通道，接收端关闭后自动退订。
pub struct MemoryStorage {
    data: dashmap::DashMap<String, MemoryEntry>,
    subscribers: dashmap::DashMap<String, Vec<mpsc::Sender<String>>>,
}

impl MemoryStorage {
    /// 创建新的内存存储
    pub fn new() -> Self {
        Self {
            data: dashmap::DashMap::new(),
            subscribers: dashmap::DashMap::new(),
        }
    }

    /// 当前存活的键数量（过期但尚未清理的条目不计入）
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.iter().filter(|e| !e.value().is_expired(now)).count()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let now = Instant::now();
        if let Some(entry) = self.data.get(key) {
            if entry.is_expired(now) {
                drop(entry);
                self.data.remove_if(key, |_, v| v.is_expired(now));
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        self.data.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[&str]) -> Result<(), StorageError> {
        for key in keys {
            self.data.remove(*key);
        }
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, StorageError> {
        let matched: Vec<String> = self
            .data
            .iter()
            .filter(|e| glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        let mut removed = 0;
        for key in matched {
            if self.data.remove(&key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn incr(&self, key: &str) -> Result<i64, StorageError> {
        use dashmap::mapref::entry::Entry;

        let now = Instant::now();
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired(now) {
                    // 过期条目视为不存在，计数从头开始
                    entry.value = "1".to_string();
                    entry.expires_at = None;
                    return Ok(1);
                }
                let current: i64 = entry.value.parse().map_err(|_| {
                    StorageError::QueryError(format!("值不是整数，无法自增: {}", key))
                })?;
                let next = current + 1;
                entry.value = next.to_string();
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MemoryEntry {
                    value: "1".to_string(),
                    expires_at: None,
                });
                Ok(1)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError> {
        let now = Instant::now();
        if let Some(mut entry) = self.data.get_mut(key) {
            if entry.is_expired(now) {
                return Ok(false);
            }
            entry.expires_at = Some(now + ttl);
            return Ok(true);
        }
        Ok(false)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StorageError> {
        let now = Instant::now();
        if let Some(entry) = self.data.get(key) {
            if entry.is_expired(now) {
                return Ok(None);
            }
            return Ok(entry.expires_at.map(|deadline| deadline - now));
        }
        Ok(None)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StorageError> {
        if let Some(mut senders) = self.subscribers.get_mut(channel) {
            senders.retain(|tx| match tx.try_send(payload.to_string()) {
                Ok(()) => true,
                // 缓冲区满时丢弃本条消息（至多一次投递），订阅保持
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, StorageError> {
        let (tx, rx) = mpsc::channel(EVENT_SUBSCRIPTION_BUFFER);
        self.subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// 通配符匹配，支持`*`（任意长度）和`?`（单字符）
fn glob_match(pattern: &str, text: &str) -> bool {
    fn matches(pattern: &[char], text: &[char]) -> bool {
        match pattern.first() {
            None => text.is_empty(),
            Some('*') => {
                matches(&pattern[1..], text)
                    || (!text.is_empty() && matches(pattern, &text[1..]))
            }
            Some('?') => !text.is_empty() && matches(&pattern[1..], &text[1..]),
            Some(c) => text.first() == Some(c) && matches(&pattern[1..], &text[1..]),
        }
    }

    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    matches(&pattern, &text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let storage = MemoryStorage::new();

        storage.set("key1", "value1", None).await.unwrap();
        assert_eq!(
            storage.get("key1").await.unwrap(),
            Some("value1".to_string())
        );

        storage.delete(&["key1"]).await.unwrap();
        assert_eq!(storage.get("key1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let storage = MemoryStorage::new();

        storage.set("key1", "old", None).await.unwrap();
        storage.set("key1", "new", None).await.unwrap();
        assert_eq!(storage.get("key1").await.unwrap(), Some("new".to_string()));
    }

    #[tokio::test]
    async fn test_expiry() {
        let storage = MemoryStorage::new();

        storage
            .set("key1", "value1", Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(storage.get("key1").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(storage.get("key1").await.unwrap(), None);
        assert_eq!(storage.ttl("key1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_reporting() {
        let storage = MemoryStorage::new();

        storage
            .set("key1", "value1", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        let ttl = storage.ttl("key1").await.unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(60));
        assert!(ttl > Duration::from_secs(58));

        // 未设置过期时间的键
        storage.set("key2", "value2", None).await.unwrap();
        assert_eq!(storage.ttl("key2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_sequence() {
        let storage = MemoryStorage::new();

        assert_eq!(storage.incr("counter").await.unwrap(), 1);
        assert_eq!(storage.incr("counter").await.unwrap(), 2);
        assert_eq!(storage.incr("counter").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_incr_restarts_after_expiry() {
        let storage = MemoryStorage::new();

        assert_eq!(storage.incr("counter").await.unwrap(), 1);
        assert!(storage
            .expire("counter", Duration::from_millis(50))
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(storage.incr("counter").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expire_missing_key() {
        let storage = MemoryStorage::new();
        assert!(!storage
            .expire("missing", Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_incr_non_integer() {
        let storage = MemoryStorage::new();
        storage.set("key1", "not-a-number", None).await.unwrap();
        assert!(storage.incr("key1").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_pattern() {
        let storage = MemoryStorage::new();

        storage.set("otp:+111", "123456", None).await.unwrap();
        storage.set("otp:+222", "654321", None).await.unwrap();
        storage.set("rate_limit:auth:1.2.3.4", "1", None).await.unwrap();

        let removed = storage.delete_pattern("otp:*").await.unwrap();
        assert_eq!(removed, 2);
        assert!(storage.get("otp:+111").await.unwrap().is_none());
        assert!(storage
            .get("rate_limit:auth:1.2.3.4")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let storage = MemoryStorage::new();

        let mut rx = storage.subscribe("events").await.unwrap();
        storage.publish("events", "hello").await.unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message, "hello");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let storage = MemoryStorage::new();
        // 没有订阅者时发布不报错
        storage.publish("events", "hello").await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_removed() {
        let storage = MemoryStorage::new();

        let rx = storage.subscribe("events").await.unwrap();
        drop(rx);

        storage.publish("events", "hello").await.unwrap();
        assert!(storage.subscribers.get("events").unwrap().is_empty());
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("otp:*", "otp:+1234567890"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("rate_limit:*:1.2.3.4", "rate_limit:auth:1.2.3.4"));
        assert!(glob_match("otp:?", "otp:x"));
        assert!(!glob_match("otp:*", "rate_limit:auth:x"));
        assert!(!glob_match("otp:?", "otp:xy"));
        assert!(glob_match("", ""));
    }
}
