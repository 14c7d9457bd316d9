//! End-to-end pool behaviour: startup fill, borrowing, retirement, shutdown.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tidepool_pool::{
    ConfigSource, ConnectionErrorKind, ConnectionFactory, Credentials, Error, HandleConfig, Pool,
    PoolBuilder, PoolConfig, PoolErrorKind, PreparedStatement, Result, SharedConfig, WatchEvent,
};

#[derive(Debug, PartialEq, Eq)]
struct MemoryConn {
    id: usize,
    url: String,
}

#[derive(Clone, Default)]
struct MemoryDriver {
    dials: Arc<AtomicUsize>,
    refuse: Arc<AtomicBool>,
}

impl MemoryDriver {
    fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

impl ConnectionFactory for MemoryDriver {
    type Connection = MemoryConn;

    fn connect(&self, credentials: &Credentials, _config: &HandleConfig) -> Result<MemoryConn> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::connection(
                ConnectionErrorKind::Refused,
                format!("{} refused the connection", credentials.url),
            ));
        }
        Ok(MemoryConn {
            id: self.dials.fetch_add(1, Ordering::SeqCst),
            url: credentials.url.clone(),
        })
    }
}

fn config(min: usize, max: usize) -> PoolConfig {
    PoolConfig::new(Credentials::new("mem://test").username("app"))
        .min_connections(min)
        .max_connections(max)
        .acquire_increment(1)
        .acquire_retry_delay(1)
        .acquire_timeout(2_000)
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn startup_fills_every_partition_then_grows_to_max() {
    let driver = MemoryDriver::default();
    let pool = Pool::new(config(2, 4).partition_count(3), driver.clone()).unwrap();

    for partition in pool.partitions() {
        assert!(partition.created_connections() >= 2);
    }

    wait_until("all partitions full", || pool.at_capacity());
    let stats = pool.stats();
    assert_eq!(stats.total_connections, 12);
    assert_eq!(stats.idle_connections, 12);
    assert_eq!(stats.active_connections, 0);
    assert_eq!(stats.partitions.len(), 3);
    assert_eq!(driver.dials(), 12);

    pool.shutdown().unwrap();
}

#[test]
fn startup_fails_when_the_minimum_cannot_be_created() {
    let driver = MemoryDriver::default();
    driver.refuse.store(true, Ordering::SeqCst);

    let err = Pool::new(config(1, 2), driver).unwrap_err();
    assert!(err.is_connection_error());
}

#[test]
fn invalid_bounds_are_rejected() {
    let err = Pool::new(config(3, 2), MemoryDriver::default()).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn borrowed_connections_return_on_drop() {
    let pool = Pool::new(config(1, 1), MemoryDriver::default()).unwrap();
    wait_until("partition full", || pool.at_capacity());

    let conn = pool.get().unwrap();
    assert_eq!(conn.url, "mem://test");
    assert_eq!(conn.partition(), 0);
    assert_eq!(pool.stats().active_connections, 1);
    assert_eq!(pool.stats().idle_connections, 0);

    drop(conn);
    assert_eq!(pool.stats().idle_connections, 1);
    assert_eq!(pool.stats().active_connections, 0);
}

#[test]
fn exhausted_pool_times_out() {
    let pool = Pool::new(config(1, 1), MemoryDriver::default()).unwrap();
    let _held = pool.get().unwrap();

    let err = pool.get_timeout(Duration::from_millis(20)).unwrap_err();
    assert_eq!(err.pool_kind(), Some(PoolErrorKind::Timeout));
    assert!(err.is_retryable());
    assert_eq!(pool.stats().pending_requests, 0);

    let err = pool.try_get().unwrap_err();
    assert_eq!(err.pool_kind(), Some(PoolErrorKind::Exhausted));
}

#[test]
fn unbounded_wait_is_served_when_a_connection_returns() {
    let pool = Arc::new(Pool::new(config(1, 1), MemoryDriver::default()).unwrap());
    let held = pool.get().unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.get_timeout(Duration::MAX).map(|conn| conn.id))
    };
    wait_until("waiter pending", || pool.stats().pending_requests == 1);

    drop(held);
    assert_eq!(waiter.join().unwrap().unwrap(), 0);
    assert_eq!(pool.stats().pending_requests, 0);
}

#[test]
fn discarded_connection_is_replaced() {
    let driver = MemoryDriver::default();
    let pool = Pool::new(config(1, 1), driver.clone()).unwrap();

    let conn = pool.get().unwrap();
    let first_id = conn.id;
    conn.discard();

    let replacement = pool.get_timeout(Duration::from_secs(2)).unwrap();
    assert_ne!(replacement.id, first_id);
    assert_eq!(driver.dials(), 2);
    assert_eq!(pool.stats().total_connections, 1);
}

#[test]
fn detached_connection_leaves_the_pool() {
    let driver = MemoryDriver::default();
    let pool = Pool::new(config(1, 1), driver.clone()).unwrap();

    let conn = pool.get().unwrap().detach().expect("connection");
    assert_eq!(conn.id, 0);

    let next = pool.get_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(next.id, 1);
}

#[test]
fn statement_cache_follows_live_config() {
    let shared = Arc::new(SharedConfig::new(config(1, 1).statements_cache_size(0)));
    let source: Arc<dyn ConfigSource> = shared.clone();
    let pool = PoolBuilder::new(config(1, 1))
        .config_source(source)
        .build(MemoryDriver::default())
        .unwrap();

    let mut conn = pool.get().unwrap();
    assert!(!conn.handle().statement_cache().is_enabled());
    let rejected = conn
        .handle_mut()
        .cache_statement(PreparedStatement::new(1, "SELECT 1", 0));
    assert!(rejected.is_some());

    shared.update(|cfg| cfg.statements_cache_size = 8).unwrap();
    conn.discard();

    let mut conn = pool.get_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(conn.handle().statement_cache().capacity(), 8);
    assert!(
        conn.handle_mut()
            .cache_statement(PreparedStatement::new(2, "SELECT 2", 0))
            .is_none()
    );
    assert!(conn.handle_mut().cached_statement("SELECT 2").is_some());
}

#[test]
fn availability_threshold_grows_on_demand() {
    let driver = MemoryDriver::default();
    let pool = Pool::new(config(1, 10).pool_availability_threshold(20), driver.clone()).unwrap();

    // One idle connection out of one is above the threshold: no growth.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(driver.dials(), 1);

    let _conn = pool.get().unwrap();
    wait_until("demand-driven growth", || driver.dials() == 2);

    thread::sleep(Duration::from_millis(50));
    assert_eq!(pool.stats().total_connections, 2);
    assert!(!pool.at_capacity());
}

#[test]
fn observer_sees_every_watcher() {
    let created = Arc::new(AtomicUsize::new(0));
    let observer = {
        let created = Arc::clone(&created);
        move |event: &WatchEvent<'_>| {
            if let WatchEvent::Created { .. } = event {
                created.fetch_add(1, Ordering::SeqCst);
            }
        }
    };

    let pool = PoolBuilder::new(config(1, 3).partition_count(2))
        .observer(Arc::new(observer))
        .build(MemoryDriver::default())
        .unwrap();

    wait_until("all partitions full", || pool.at_capacity());
    assert_eq!(created.load(Ordering::SeqCst), 6);
}

#[test]
fn failed_watcher_can_be_restarted() {
    let driver = MemoryDriver::default();
    let pool = Pool::new(config(1, 1), driver.clone()).unwrap();
    wait_until("partition full", || pool.at_capacity());
    let partition = Arc::clone(&pool.partitions()[0]);

    let poisoner = {
        let partition = Arc::clone(&partition);
        thread::spawn(move || {
            let _guard = partition.lock_almost_full().unwrap();
            panic!("lock holder failed");
        })
    };
    assert!(poisoner.join().is_err());
    partition.almost_full_signal();

    wait_until("watcher restart", || pool.restart_failed_watchers().unwrap() == 1);

    // The replacement watcher refills a retired slot.
    pool.get().unwrap().discard();
    wait_until("refill", || driver.dials() == 2);
    pool.shutdown().unwrap();
}

#[test]
fn shutdown_closes_the_pool() {
    let pool = Pool::new(config(1, 2), MemoryDriver::default()).unwrap();
    let conn = pool.get().unwrap();

    wait_until("partition full", || pool.at_capacity());
    pool.shutdown().unwrap();
    assert!(pool.is_closed());
    let stats = pool.stats();
    assert_eq!(stats.idle_connections, 0);
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 1);

    let err = pool.get().unwrap_err();
    assert_eq!(err.pool_kind(), Some(PoolErrorKind::Closed));
    assert_eq!(pool.restart_failed_watchers().unwrap(), 0);

    // A connection returned after shutdown is closed, not queued.
    drop(conn);
    let stats = pool.stats();
    assert_eq!(stats.total_connections, 0);
    assert_eq!(stats.idle_connections, 0);
    pool.shutdown().unwrap();
}
