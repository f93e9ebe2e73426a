// # Connection Pool Engine
//
// Maintains a pool of connections to the external key/value+pub/sub store
// between `min_connections` and `max_connections`, with FIFO acquisition
// queueing, least-used load balancing, periodic health checks, and idle
// reaping.

use crate::common::{now_millis, Component, HealthStatus};
use crate::config::PoolConfig;
use crate::error::{IngestError, Result};
use crate::external::KeyValueStore;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Role requested when acquiring a connection. `ReadWrite` connections
/// satisfy requests for either role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Read,
    Write,
    ReadWrite,
}

impl ConnectionRole {
    fn matches(&self, requested: ConnectionRole) -> bool {
        *self == ConnectionRole::ReadWrite || requested == ConnectionRole::ReadWrite || *self == requested
    }
}

/// A factory that opens new client connections to the external store.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(&self, role: ConnectionRole) -> Result<Arc<dyn KeyValueStore>>;
}

/// A single pooled connection and its lifecycle bookkeeping.
pub struct PooledConnection {
    pub id: u64,
    pub client: Arc<dyn KeyValueStore>,
    pub role: ConnectionRole,
    pub created_at: Instant,
    last_used_ms: AtomicU64,
    usage_count: AtomicU64,
    is_healthy: AtomicBool,
}

impl PooledConnection {
    fn touch(&self) {
        self.last_used_ms.store(now_millis(), Ordering::Relaxed);
        self.usage_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn usage_count(&self) -> u64 {
        self.usage_count.load(Ordering::Relaxed)
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy.load(Ordering::Relaxed)
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_used_ms.load(Ordering::Relaxed);
        Duration::from_millis(now_millis().saturating_sub(last))
    }
}

#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub waiting: usize,
    pub healthy: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    Running,
    ShuttingDown,
}

struct Waiter {
    role: ConnectionRole,
    sender: oneshot::Sender<Arc<PooledConnection>>,
}

struct PoolInner {
    idle: VecDeque<Arc<PooledConnection>>,
    waiters: VecDeque<Waiter>,
    total: usize,
}

/// Pooled, load-balanced, health-checked connections to the external store.
///
/// `acquire`/`release` are the low-level primitives; `execute` and
/// `transaction` are the ergonomic wrappers most callers should use since
/// they guarantee the connection is released on every exit path, including
/// error and cancellation.
pub struct ConnectionPool {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    inner: Mutex<PoolInner>,
    in_use: DashMap<u64, Arc<PooledConnection>>,
    next_id: AtomicUsize,
    status: Mutex<PoolStatus>,
}

impl ConnectionPool {
    pub async fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Arc<Self>> {
        let pool = Arc::new(Self {
            config,
            factory,
            inner: Mutex::new(PoolInner { idle: VecDeque::new(), waiters: VecDeque::new(), total: 0 }),
            in_use: DashMap::new(),
            next_id: AtomicUsize::new(1),
            status: Mutex::new(PoolStatus::Running),
        });

        for _ in 0..pool.config.min_connections {
            let conn = pool.create_connection(ConnectionRole::ReadWrite).await?;
            pool.inner.lock().idle.push_back(conn);
        }

        pool.clone().spawn_health_check();
        pool.clone().spawn_idle_reaper();

        info!(min = pool.config.min_connections, max = pool.config.max_connections, "connection pool started");
        Ok(pool)
    }

    async fn create_connection(&self, role: ConnectionRole) -> Result<Arc<PooledConnection>> {
        let client = self.factory.create(role).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) as u64;
        let conn = Arc::new(PooledConnection {
            id,
            client,
            role,
            created_at: Instant::now(),
            last_used_ms: AtomicU64::new(now_millis()),
            usage_count: AtomicU64::new(0),
            is_healthy: AtomicBool::new(true),
        });
        self.inner.lock().total += 1;
        Ok(conn)
    }

    /// Acquire a connection, preferring one matching `preferred_role`
    /// (`None` means any role is acceptable).
    pub async fn acquire(self: &Arc<Self>, preferred_role: Option<ConnectionRole>) -> Result<PooledConnectionGuard> {
        if *self.status.lock() == PoolStatus::ShuttingDown {
            return Err(IngestError::PoolShuttingDown { context: "acquire called during shutdown".into() });
        }
        let role = preferred_role.unwrap_or(ConnectionRole::ReadWrite);

        // Fast path: an idle, healthy, role-matching connection. Prefer the
        // least-used candidate for load balancing.
        {
            let mut inner = self.inner.lock();
            if let Some(pos) = inner
                .idle
                .iter()
                .enumerate()
                .filter(|(_, c)| c.is_healthy() && c.role.matches(role))
                .min_by_key(|(_, c)| c.usage_count())
                .map(|(i, _)| i)
            {
                let conn = inner.idle.remove(pos).unwrap();
                conn.touch();
                drop(inner);
                self.in_use.insert(conn.id, conn.clone());
                return Ok(PooledConnectionGuard { pool: self.clone(), conn: Some(conn) });
            }

            if inner.total < self.config.max_connections {
                // reserve the slot before releasing the lock so concurrent
                // acquirers don't all race past the capacity check
                inner.total += 1;
            } else {
                let (tx, rx) = oneshot::channel();
                inner.waiters.push_back(Waiter { role, sender: tx });
                drop(inner);
                let start = Instant::now();
                return match timeout(self.config.acquire_timeout, rx).await {
                    Ok(Ok(conn)) => {
                        self.in_use.insert(conn.id, conn.clone());
                        Ok(PooledConnectionGuard { pool: self.clone(), conn: Some(conn) })
                    }
                    _ => Err(IngestError::AcquireTimeout {
                        waited_ms: start.elapsed().as_millis() as u64,
                        context: "no idle connection became available".into(),
                    }),
                };
            }
        }

        // We reserved a slot above; create the connection outside the lock.
        let client = self.factory.create(role).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) as u64;
        let conn = Arc::new(PooledConnection {
            id,
            client,
            role,
            created_at: Instant::now(),
            last_used_ms: AtomicU64::new(now_millis()),
            usage_count: AtomicU64::new(1),
            is_healthy: AtomicBool::new(true),
        });
        self.in_use.insert(conn.id, conn.clone());
        Ok(PooledConnectionGuard { pool: self.clone(), conn: Some(conn) })
    }

    /// Return a connection to the pool. Handed directly to the longest-
    /// waiting acquirer if one is queued (FIFO), else returned to the idle
    /// set.
    fn release(&self, conn: Arc<PooledConnection>) {
        self.in_use.remove(&conn.id);
        let mut inner = self.inner.lock();
        while let Some(waiter) = inner.waiters.pop_front() {
            if conn.role.matches(waiter.role) {
                conn.touch();
                if waiter.sender.send(conn).is_ok() {
                    return;
                }
                // receiver dropped (caller timed out); try next waiter
                continue;
            } else {
                // role mismatch: put the waiter back and fall through to idle
                inner.waiters.push_front(waiter);
                break;
            }
        }
        inner.idle.push_back(conn);
    }

    /// Run `f` against an acquired connection, guaranteeing release on
    /// every exit path.
    pub async fn execute<F, Fut, T>(self: &Arc<Self>, preferred_role: Option<ConnectionRole>, f: F) -> Result<T>
    where
        F: FnOnce(Arc<PooledConnection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire(preferred_role).await?;
        f(guard.connection()).await
    }

    /// Run a sequence of operations against a single acquired connection,
    /// collecting their results in order. Modeled as a lightweight
    /// transaction: all steps share one connection so the external store
    /// can observe them as a causally ordered sequence.
    pub async fn transaction<F, Fut, T>(self: &Arc<Self>, fns: Vec<F>) -> Result<Vec<T>>
    where
        F: FnOnce(Arc<PooledConnection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire(Some(ConnectionRole::ReadWrite)).await?;
        let mut results = Vec::with_capacity(fns.len());
        for f in fns {
            results.push(f(guard.connection()).await?);
        }
        Ok(results)
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        let idle_healthy = inner.idle.iter().filter(|c| c.is_healthy()).count();
        let in_use_healthy = self.in_use.iter().filter(|c| c.is_healthy()).count();
        PoolStats {
            total: inner.total,
            idle: inner.idle.len(),
            in_use: self.in_use.len(),
            waiting: inner.waiters.len(),
            healthy: idle_healthy + in_use_healthy,
        }
    }

    pub fn status(&self) -> PoolStatus {
        *self.status.lock()
    }

    pub async fn shutdown(self: &Arc<Self>) -> Result<()> {
        *self.status.lock() = PoolStatus::ShuttingDown;
        let mut inner = self.inner.lock();
        for waiter in inner.waiters.drain(..) {
            let _ = waiter.sender; // dropping rejects the waiter; acquire() sees timeout/closed
        }
        for conn in inner.idle.drain(..) {
            let _ = conn.client.quit().await;
        }
        inner.total = 0;
        info!("connection pool shut down");
        Ok(())
    }

    fn spawn_health_check(self: Arc<Self>) {
        let interval = self.config.health_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if self.status() == PoolStatus::ShuttingDown {
                    break;
                }
                self.run_health_check().await;
            }
        });
    }

    async fn run_health_check(&self) {
        let candidates: Vec<Arc<PooledConnection>> = self.inner.lock().idle.iter().cloned().collect();
        for conn in candidates {
            let healthy = conn.client.ping().await.is_ok();
            conn.is_healthy.store(healthy, Ordering::Relaxed);
            if !healthy {
                warn!(conn_id = conn.id, "connection failed health check");
            }
        }

        let mut inner = self.inner.lock();
        let healthy_total =
            inner.idle.iter().filter(|c| c.is_healthy()).count() + self.in_use.iter().filter(|c| c.is_healthy()).count();
        if healthy_total > self.config.min_connections {
            let before = inner.idle.len();
            inner.idle.retain(|c| c.is_healthy());
            let removed = before - inner.idle.len();
            inner.total -= removed;
        }
    }

    fn spawn_idle_reaper(self: Arc<Self>) {
        let interval = self.config.reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if self.status() == PoolStatus::ShuttingDown {
                    break;
                }
                self.reap_idle();
            }
        });
    }

    fn reap_idle(&self) {
        let mut inner = self.inner.lock();
        let idle_timeout = self.config.idle_timeout;
        let min = self.config.min_connections;
        let mut kept = VecDeque::new();
        let mut reaped = 0usize;
        while let Some(conn) = inner.idle.pop_front() {
            let can_reap = conn.idle_for() > idle_timeout && (inner.total - reaped) > min;
            if can_reap {
                reaped += 1;
                debug!(conn_id = conn.id, "reaping idle connection");
            } else {
                kept.push_back(conn);
            }
        }
        inner.idle = kept;
        inner.total -= reaped;
    }
}

#[async_trait]
impl Component for ConnectionPool {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        *self.status.lock() = PoolStatus::ShuttingDown;
        Ok(())
    }

    fn health_check(&self) -> HealthStatus {
        let stats = self.stats();
        if stats.total < self.config.min_connections {
            HealthStatus::Degraded
        } else if stats.healthy == 0 {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        }
    }
}

/// RAII handle returned by `acquire`. The underlying connection is returned
/// to the pool when the guard is dropped.
pub struct PooledConnectionGuard {
    pool: Arc<ConnectionPool>,
    conn: Option<Arc<PooledConnection>>,
}

impl PooledConnectionGuard {
    pub fn connection(&self) -> Arc<PooledConnection> {
        self.conn.as_ref().expect("connection taken").clone()
    }
}

impl Drop for PooledConnectionGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::InMemoryKeyValueStore;

    struct TestFactory {
        store: Arc<InMemoryKeyValueStore>,
    }

    #[async_trait]
    impl ConnectionFactory for TestFactory {
        async fn create(&self, _role: ConnectionRole) -> Result<Arc<dyn KeyValueStore>> {
            Ok(self.store.clone())
        }
    }

    fn test_config() -> PoolConfig {
        PoolConfig {
            min_connections: 1,
            max_connections: 2,
            acquire_timeout: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(300),
            reap_interval: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(300),
            enable_load_balancing: true,
            prefer_write_connections: false,
        }
    }

    async fn make_pool() -> Arc<ConnectionPool> {
        let factory = Arc::new(TestFactory { store: Arc::new(InMemoryKeyValueStore::new()) });
        ConnectionPool::new(test_config(), factory).await.unwrap()
    }

    #[tokio::test]
    async fn acquire_and_release_reuses_connection() {
        let pool = make_pool().await;
        let stats_before = pool.stats();
        assert_eq!(stats_before.total, 1);

        let guard = pool.acquire(None).await.unwrap();
        let id = guard.connection().id;
        drop(guard);

        let guard2 = pool.acquire(None).await.unwrap();
        assert_eq!(guard2.connection().id, id, "should reuse the released connection");
    }

    #[tokio::test]
    async fn acquire_beyond_max_times_out() {
        let pool = make_pool().await;
        let _g1 = pool.acquire(None).await.unwrap();
        let _g2 = pool.acquire(None).await.unwrap();
        assert_eq!(pool.stats().total, 2);

        let err = pool.acquire(None).await.unwrap_err();
        assert_eq!(err.code(), "AcquireTimeout");
    }

    #[tokio::test]
    async fn waiter_is_served_fifo_on_release() {
        let pool = make_pool().await;
        let g1 = pool.acquire(None).await.unwrap();
        let _g2 = pool.acquire(None).await.unwrap();

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire(None).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(g1);

        let acquired = waiter.await.unwrap();
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn capacity_never_exceeds_max() {
        let pool = make_pool().await;
        let _g1 = pool.acquire(None).await.unwrap();
        let _g2 = pool.acquire(None).await.unwrap();
        assert!(pool.stats().total <= 2);
    }

    #[tokio::test]
    async fn shutdown_marks_pool_shutting_down() {
        let pool = make_pool().await;
        pool.shutdown().await.unwrap();
        assert_eq!(pool.status(), PoolStatus::ShuttingDown);
        let err = pool.acquire(None).await.unwrap_err();
        assert_eq!(err.code(), "PoolShuttingDown");
    }
}
