//! 集成测试
//!
//! 覆盖组件之间的协作：启动阶段的重试连接、熔断器保护故障依赖、
//! 后台状态管理与状态快照、限流拒绝事件的端到端投递。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use otpguard::prelude::*;
use otpguard::ScopeLimit;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_startup_retry_until_storage_ready() {
    let attempts = Arc::new(AtomicU32::new(0));
    let cancel = CancellationToken::new();
    let config = RetryConfig {
        max_attempts: 5,
        initial_delay: Duration::from_millis(1),
        jitter: false,
        ..Default::default()
    }
    .with_logging("connect_storage");

    // 前两次连接失败，第三次成功
    let attempts_clone = attempts.clone();
    let storage = retry_with_result(&cancel, &config, move || {
        let attempts = attempts_clone.clone();
        async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(OtpGuardError::ConnectionTimeout(
                    "存储尚未就绪".to_string(),
                ))
            } else {
                Ok(Arc::new(MemoryStorage::new()))
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    storage.ping().await.unwrap();
}

#[tokio::test]
async fn test_breaker_trips_and_recovers_around_flaky_dependency() {
    let config = CircuitBreakerConfig::new(2, 1, Duration::from_millis(100));
    let breaker = CircuitBreaker::new("flaky-db", config);

    // 依赖故障期间熔断
    for _ in 0..2 {
        let _ = breaker
            .execute(|| async {
                Err::<(), _>(OtpGuardError::ConnectionTimeout("db down".to_string()))
            })
            .await;
    }
    assert!(breaker.is_open());

    let rejected = breaker
        .execute(|| async { Ok::<_, OtpGuardError>(()) })
        .await;
    assert!(matches!(rejected, Err(OtpGuardError::CircuitOpen(_))));

    // 依赖恢复后经半开探测回到关闭
    tokio::time::sleep(Duration::from_millis(150)).await;
    breaker
        .execute(|| async { Ok::<_, OtpGuardError>(()) })
        .await
        .unwrap();
    assert!(breaker.is_closed());
}

#[tokio::test]
async fn test_breaker_state_manager_and_snapshot() {
    let storage = Arc::new(MemoryStorage::new());
    let config = CircuitBreakerConfig::new(1, 1, Duration::from_millis(100));
    let breaker = Arc::new(CircuitBreaker::new("db", config).with_storage(storage.clone()));
    breaker.start_state_manager(Duration::from_millis(20));

    let _ = breaker
        .execute(|| async {
            Err::<(), _>(OtpGuardError::ConnectionTimeout("down".to_string()))
        })
        .await;
    assert!(breaker.is_open());

    let snapshot = storage
        .get("circuit_breaker:db:state")
        .await
        .unwrap()
        .unwrap();
    assert!(snapshot.contains("Open"));

    // 无流量时后台任务推进到半开，并刷新快照
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(breaker.is_half_open());
    let snapshot = storage
        .get("circuit_breaker:db:state")
        .await
        .unwrap()
        .unwrap();
    assert!(snapshot.contains("HalfOpen"));

    breaker.stop_state_manager().await;
}

struct Recorder {
    seen: Arc<parking_lot::Mutex<Vec<Event>>>,
}

#[async_trait::async_trait]
impl EventHandler for Recorder {
    async fn handle(&self, event: Event) -> Result<(), OtpGuardError> {
        self.seen.lock().push(event);
        Ok(())
    }
}

#[tokio::test]
async fn test_rate_limit_denial_reaches_subscriber() {
    let storage = Arc::new(MemoryStorage::new());
    let events = Arc::new(EventService::new(
        storage.clone(),
        EventsConfig::default(),
        None,
    ));

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    events.subscribe("rate_limited", Arc::new(Recorder { seen: seen.clone() }));

    let cancel = CancellationToken::new();
    let subscription = {
        let events = events.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { events.run(cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let limiter = RateLimiter::new(
        storage.clone(),
        RateLimitingConfig {
            otp: ScopeLimit::new(1, Duration::from_secs(60)),
            ..Default::default()
        },
    )
    .with_events(events.publisher());

    limiter
        .check_and_consume(RateLimitScope::Otp, "+1234567890")
        .await;
    limiter
        .check_and_consume(RateLimitScope::Otp, "+1234567890")
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    {
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].event_type, "rate_limited");
        assert_eq!(
            seen[0].payload.get("scope").unwrap().as_str().unwrap(),
            "otp"
        );
    }

    cancel.cancel();
    subscription.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_pool_with_retrying_factory() {
    // 工厂通过重试辅助建立连接，池只见到成功结果
    let attempts = Arc::new(AtomicU32::new(0));

    struct Conn;

    #[async_trait::async_trait]
    impl PoolableConnection for Conn {
        async fn ping(&self) -> Result<(), OtpGuardError> {
            Ok(())
        }
        async fn close(self) {}
        fn is_valid(&self) -> bool {
            true
        }
    }

    let attempts_clone = attempts.clone();
    let factory: otpguard::ConnectionFactory<Conn> = Arc::new(move || {
        let attempts = attempts_clone.clone();
        Box::pin(async move {
            let cancel = CancellationToken::new();
            let config = RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                jitter: false,
                ..Default::default()
            };
            retry_with_result(&cancel, &config, || {
                let attempts = attempts.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(OtpGuardError::ConnectionTimeout("冷启动".to_string()))
                    } else {
                        Ok(Conn)
                    }
                }
            })
            .await
        })
    });

    let pool = ConnectionPool::new(factory, PoolConfig::new(2, 2));
    let cancel = CancellationToken::new();

    let conn = pool.get(&cancel).await.unwrap();
    conn.ping().await.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    pool.put(conn).await;
    pool.close().await;
}
