//! 连接池
//!
//! 有界的通用资源池，空闲/活跃双集合加FIFO等待队列。获取时优先复用
//! 并校验空闲连接，其次在`max_open`内新建，否则登记等待者阻塞；
//! 释放时等待者优先于空闲集。阻塞的获取可以被调用方的取消令牌
//! 中断，被取消的等待者从队列移除，已送达的连接归还池中，不会泄漏。
//!
//! 不变式: 活跃数 + 空闲数 <= max_open；交给等待者的连接立即计入活跃。

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::{
    DEFAULT_POOL_MAX_IDLE, DEFAULT_POOL_MAX_OPEN, DEFAULT_POOL_SWEEP_INTERVAL_SECS,
};
use crate::error::OtpGuardError;

/// 可入池的连接
#[async_trait]
pub trait PoolableConnection: Send + Sync + 'static {
    /// 活性检查
    async fn ping(&self) -> Result<(), OtpGuardError>;

    /// 关闭连接
    async fn close(self);

    /// 快速有效性检查（不产生IO）
    fn is_valid(&self) -> bool;
}

/// 连接工厂
pub type ConnectionFactory<C> = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<C, OtpGuardError>> + Send>> + Send + Sync,
>;

/// 连接池配置
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PoolConfig {
    /// 最大打开连接数（活跃+空闲）
    pub max_open: usize,
    /// 保留的最大空闲连接数
    pub max_idle: usize,
    /// 后台清理间隔
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open: DEFAULT_POOL_MAX_OPEN,
            max_idle: DEFAULT_POOL_MAX_IDLE,
            sweep_interval: Duration::from_secs(DEFAULT_POOL_SWEEP_INTERVAL_SECS),
        }
    }
}

impl PoolConfig {
    /// 创建连接池配置
    pub fn new(max_open: usize, max_idle: usize) -> Self {
        Self {
            max_open,
            max_idle,
            ..Default::default()
        }
    }
}

/// 连接池统计
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// 活跃连接数
    pub active: usize,
    /// 空闲连接数
    pub idle: usize,
    /// 等待者数量
    pub waiting: usize,
    /// 配置的最大连接数
    pub max_open: usize,
    /// 配置的最大空闲数
    pub max_idle: usize,
}

struct Waiter<C> {
    id: u64,
    tx: oneshot::Sender<C>,
}

struct PoolInner<C> {
    idle: Vec<C>,
    active: usize,
    waiters: VecDeque<Waiter<C>>,
    closed: bool,
    next_waiter_id: u64,
}

enum Acquire<C> {
    Reused(C),
    Create,
    Wait(u64, oneshot::Receiver<C>),
}

/// 连接池
pub struct ConnectionPool<C: PoolableConnection> {
    factory: ConnectionFactory<C>,
    config: PoolConfig,
    inner: Arc<Mutex<PoolInner<C>>>,
    sweeper: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl<C: PoolableConnection> ConnectionPool<C> {
    /// 创建连接池
    pub fn new(factory: ConnectionFactory<C>, config: PoolConfig) -> Self {
        info!(
            max_open = config.max_open,
            max_idle = config.max_idle,
            "创建连接池"
        );
        Self {
            factory,
            config,
            inner: Arc::new(Mutex::new(PoolInner {
                idle: Vec::new(),
                active: 0,
                waiters: VecDeque::new(),
                closed: false,
                next_waiter_id: 0,
            })),
            sweeper: Mutex::new(None),
        }
    }

    /// 获取一个连接
    ///
    /// 池耗尽时阻塞等待释放；取消令牌触发时立刻以`Cancelled`返回，
    /// 等待者从队列移除。池已关闭时返回`PoolClosed`。
    pub async fn get(&self, cancel: &CancellationToken) -> Result<C, OtpGuardError> {
        let mut stale: Vec<C> = Vec::new();
        let acquire = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(OtpGuardError::PoolClosed);
            }

            loop {
                match inner.idle.pop() {
                    Some(conn) if conn.is_valid() => {
                        inner.active += 1;
                        break Acquire::Reused(conn);
                    }
                    // 无效的空闲连接丢弃后继续找
                    Some(conn) => stale.push(conn),
                    None => {
                        if inner.active + inner.idle.len() < self.config.max_open {
                            // 预留槽位，工厂调用在锁外进行
                            inner.active += 1;
                            break Acquire::Create;
                        }
                        let id = inner.next_waiter_id;
                        inner.next_waiter_id += 1;
                        let (tx, rx) = oneshot::channel();
                        inner.waiters.push_back(Waiter { id, tx });
                        break Acquire::Wait(id, rx);
                    }
                }
            }
        };

        for conn in stale {
            conn.close().await;
        }

        match acquire {
            Acquire::Reused(conn) => Ok(conn),
            Acquire::Create => match (self.factory)().await {
                Ok(conn) => Ok(conn),
                Err(e) => {
                    warn!("连接工厂失败: {}", e);
                    self.inner.lock().active -= 1;
                    Err(e)
                }
            },
            Acquire::Wait(id, mut rx) => {
                tokio::select! {
                    result = &mut rx => match result {
                        // 释放方已将连接计入活跃
                        Ok(conn) => Ok(conn),
                        Err(_) => Err(OtpGuardError::PoolClosed),
                    },
                    _ = cancel.cancelled() => {
                        {
                            let mut inner = self.inner.lock();
                            inner.waiters.retain(|w| w.id != id);
                        }
                        // 竞态下连接可能已经送达，归还而不是泄漏
                        if let Ok(conn) = rx.try_recv() {
                            self.put(conn).await;
                        }
                        Err(OtpGuardError::Cancelled)
                    }
                }
            }
        }
    }

    /// 归还一个连接
    ///
    /// 无效连接被丢弃；有等待者时直接交给最早的等待者，否则在
    /// `max_idle`内回到空闲集，超出则关闭。
    pub async fn put(&self, conn: C) {
        let to_close: Option<C> = {
            let mut inner = self.inner.lock();
            inner.active = inner.active.saturating_sub(1);

            if inner.closed || !conn.is_valid() {
                Some(conn)
            } else {
                let mut returned = Some(conn);
                while let Some(conn) = returned.take() {
                    match inner.waiters.pop_front() {
                        None => {
                            returned = Some(conn);
                            break;
                        }
                        Some(waiter) => match waiter.tx.send(conn) {
                            Ok(()) => {
                                inner.active += 1;
                                break;
                            }
                            // 等待者已取消，尝试下一个
                            Err(conn_back) => returned = Some(conn_back),
                        },
                    }
                }
                match returned {
                    None => None,
                    Some(conn) => {
                        if inner.idle.len() < self.config.max_idle {
                            inner.idle.push(conn);
                            None
                        } else {
                            Some(conn)
                        }
                    }
                }
            }
        };

        if let Some(conn) = to_close {
            conn.close().await;
        }
    }

    /// 关闭连接池
    ///
    /// 关闭所有空闲连接并让所有等待者以`PoolClosed`失败。
    /// 已借出的连接在下一次`put`时被关闭。
    pub async fn close(&self) {
        let (idle, waiters) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            (
                std::mem::take(&mut inner.idle),
                std::mem::take(&mut inner.waiters),
            )
        };

        // 丢弃发送端，等待者的接收端随即报错
        drop(waiters);
        for conn in idle {
            conn.close().await;
        }
        info!("连接池已关闭");
    }

    /// 启动后台清理任务
    ///
    /// 周期性地关闭失效的空闲连接。重复调用无效果。
    pub fn start_sweeper(&self) {
        let mut guard = self.sweeper.lock();
        if guard.is_some() {
            return;
        }

        let inner = self.inner.clone();
        let interval = self.config.sweep_interval;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stale = {
                            let mut inner = inner.lock();
                            if inner.closed {
                                None
                            } else {
                                let mut stale = Vec::new();
                                let mut index = 0;
                                while index < inner.idle.len() {
                                    if inner.idle[index].is_valid() {
                                        index += 1;
                                    } else {
                                        stale.push(inner.idle.swap_remove(index));
                                    }
                                }
                                Some(stale)
                            }
                        };
                        match stale {
                            None => break,
                            Some(stale) => {
                                if !stale.is_empty() {
                                    debug!(count = stale.len(), "清理失效的空闲连接");
                                }
                                for conn in stale {
                                    conn.close().await;
                                }
                            }
                        }
                    }
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

    /// 停止后台清理任务并等待其退出
    pub async fn stop_sweeper(&self) {
        let entry = self.sweeper.lock().take();
        if let Some((shutdown_tx, handle)) = entry {
            let _ = shutdown_tx.send(true);
            let _ = handle.await;
        }
    }

    /// 连接池统计
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            active: inner.active,
            idle: inner.idle.len(),
            waiting: inner.waiters.len(),
            max_open: self.config.max_open,
            max_idle: self.config.max_idle,
        }
    }
}
