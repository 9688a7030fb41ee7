//! Backend connection pool.
//!
//! A bounded set of TCP connections to the backend server. Capacity is
//! enforced with a semaphore whose permits travel inside leased
//! connections; fresh dials go through the circuit breaker; a background
//! reaper evicts idle connections that grow stale.

mod backend;
mod circuit_breaker;

pub use backend::BackendConn;
pub use circuit_breaker::{
    BreakerStats, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use quotient_shared::config::{BackendSettings, BreakerSettings};
use quotient_shared::exception::{QuotientError, QuotientResult};
use quotient_shared::metrics::MetricsSink;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub backend_addr: String,
    /// Maximum concurrently leased connections.
    pub max_size: usize,
    /// Maximum idle connections retained for reuse.
    pub max_idle: usize,
    pub connect_timeout: Duration,
    pub acquire_timeout: Duration,
    pub max_idle_time: Duration,
    pub max_age: Duration,
    pub reap_interval: Duration,
}

impl PoolConfig {
    pub fn from_settings(settings: &BackendSettings) -> Self {
        Self {
            backend_addr: format!("{}:{}", settings.host, settings.port),
            max_size: settings.pool_size,
            max_idle: settings.max_idle,
            connect_timeout: settings.connect_timeout(),
            acquire_timeout: settings.acquire_timeout(),
            max_idle_time: settings.max_idle_time(),
            max_age: settings.max_age(),
            reap_interval: settings.reap_interval(),
        }
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    total_created: AtomicU64,
    total_acquired: AtomicU64,
    total_released: AtomicU64,
    total_evicted: AtomicU64,
}

/// Point-in-time pool statistics for the management surface.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total_created: u64,
    pub total_acquired: u64,
    pub total_released: u64,
    pub total_evicted: u64,
    pub current_idle: usize,
    pub current_active: usize,
    pub capacity: usize,
    pub circuit_breaker: BreakerStats,
}

pub struct BackendPool {
    config: PoolConfig,
    idle: Mutex<VecDeque<BackendConn>>,
    semaphore: Arc<Semaphore>,
    breaker: CircuitBreaker,
    conn_seq: AtomicU64,
    active: AtomicUsize,
    counters: PoolCounters,
    metrics: Arc<dyn MetricsSink>,
}

impl BackendPool {
    pub fn new(
        config: PoolConfig,
        breaker_settings: &BreakerSettings,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<Self> {
        let breaker_config = CircuitBreakerConfig {
            max_failures: breaker_settings.max_failures,
            cooldown: breaker_settings.cooldown(),
            max_probes: breaker_settings.max_probes,
        };
        info!(
            backend = %config.backend_addr,
            pool_size = config.max_size,
            threshold = breaker_config.max_failures,
            "backend connection pool created"
        );
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            breaker: CircuitBreaker::new(breaker_config, metrics.clone()),
            idle: Mutex::new(VecDeque::new()),
            conn_seq: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            counters: PoolCounters::default(),
            metrics,
            config,
        })
    }

    /// Lease a connection: an idle one that passes the liveness probe, or
    /// a fresh dial through the circuit breaker. Blocks up to the acquire
    /// timeout when the pool is at capacity.
    pub async fn acquire(&self) -> QuotientResult<BackendConn> {
        let permit = match tokio::time::timeout(
            self.config.acquire_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(QuotientError::internal("pool semaphore closed")),
            Err(_) => return Err(QuotientError::PoolExhausted),
        };

        let mut permit = Some(permit);
        loop {
            let candidate = { self.idle.lock().await.pop_front() };
            let Some(mut conn) = candidate else {
                break;
            };
            if conn.is_live() {
                conn.touch();
                if let Some(permit) = permit.take() {
                    conn.attach_permit(permit);
                }
                self.counters.total_acquired.fetch_add(1, Ordering::Relaxed);
                let active = self.active.fetch_add(1, Ordering::Relaxed) + 1;
                self.metrics.set_backend_connections(active);
                debug!(conn_id = conn.conn_id(), "reusing idle backend connection");
                return Ok(conn);
            }
            warn!(conn_id = conn.conn_id(), "evicting dead idle connection");
            self.counters.total_evicted.fetch_add(1, Ordering::Relaxed);
        }

        let permit = match permit.take() {
            Some(permit) => permit,
            None => return Err(QuotientError::internal("pool permit lost")),
        };
        self.dial(permit).await
    }

    async fn dial(
        &self,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) -> QuotientResult<BackendConn> {
        self.breaker.before_dial()?;

        let stream = match tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(&self.config.backend_addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.breaker.record_failure();
                return Err(QuotientError::Io(e));
            }
            Err(_) => {
                self.breaker.record_failure();
                return Err(QuotientError::timeout("backend dial"));
            }
        };
        self.breaker.record_success();

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not set TCP_NODELAY on backend connection");
        }

        let conn_id = self.conn_seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.counters.total_created.fetch_add(1, Ordering::Relaxed);
        self.counters.total_acquired.fetch_add(1, Ordering::Relaxed);
        let active = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        self.metrics.set_backend_connections(active);
        info!(conn_id, "created new backend connection");

        Ok(BackendConn::new(stream, conn_id, permit))
    }

    /// Return a leased connection. In-transaction connections and
    /// connections that fail the reset probe are closed instead of pooled.
    pub async fn release(&self, mut conn: BackendConn) {
        let active = self.active.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        self.metrics.set_backend_connections(active);

        if conn.in_transaction() {
            warn!(
                conn_id = conn.conn_id(),
                "closing connection released mid-transaction"
            );
            self.counters.total_evicted.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if !conn.reset() {
            debug!(conn_id = conn.conn_id(), "reset failed; closing connection");
            self.counters.total_evicted.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut idle = self.idle.lock().await;
        if idle.len() < self.config.max_idle {
            conn.detach_permit();
            debug!(conn_id = conn.conn_id(), "returned connection to pool");
            self.counters.total_released.fetch_add(1, Ordering::Relaxed);
            idle.push_back(conn);
        } else {
            debug!(conn_id = conn.conn_id(), "idle queue full; closing connection");
            self.counters.total_evicted.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Close a leased connection outright.
    pub fn discard(&self, conn: BackendConn) {
        let active = self.active.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        self.metrics.set_backend_connections(active);
        self.counters.total_evicted.fetch_add(1, Ordering::Relaxed);
        debug!(conn_id = conn.conn_id(), "discarding backend connection");
        drop(conn);
    }

    /// Spawn the periodic idle-connection reaper.
    pub fn start_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(pool.config.reap_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                pool.reap().await;
            }
        })
    }

    async fn reap(&self) {
        let mut idle = self.idle.lock().await;
        let before = idle.len();
        idle.retain(|conn| {
            let keep = conn.idle_for() <= self.config.max_idle_time
                && conn.age() <= self.config.max_age
                && conn.is_live();
            if !keep {
                debug!(conn_id = conn.conn_id(), "reaping stale idle connection");
            }
            keep
        });
        let evicted = before - idle.len();
        if evicted > 0 {
            self.counters
                .total_evicted
                .fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(evicted, remaining = idle.len(), "idle connection sweep");
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn stats(&self) -> PoolStats {
        PoolStats {
            total_created: self.counters.total_created.load(Ordering::Relaxed),
            total_acquired: self.counters.total_acquired.load(Ordering::Relaxed),
            total_released: self.counters.total_released.load(Ordering::Relaxed),
            total_evicted: self.counters.total_evicted.load(Ordering::Relaxed),
            current_idle: self.idle.lock().await.len(),
            current_active: self.active.load(Ordering::Relaxed),
            capacity: self.config.max_size,
            circuit_breaker: self.breaker.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotient_shared::metrics::NoopSink;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    struct FakeBackend {
        addr: String,
        _task: JoinHandle<()>,
    }

    /// Accepts connections and keeps them open without writing.
    async fn fake_backend() -> (FakeBackend, mpsc::UnboundedReceiver<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, _)) => {
                        if tx.send(socket).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });
        (FakeBackend { addr, _task: task }, rx)
    }

    fn pool_config(addr: &str, max_size: usize) -> PoolConfig {
        PoolConfig {
            backend_addr: addr.to_string(),
            max_size,
            max_idle: max_size,
            connect_timeout: Duration::from_millis(500),
            acquire_timeout: Duration::from_millis(200),
            max_idle_time: Duration::from_secs(300),
            max_age: Duration::from_secs(1800),
            reap_interval: Duration::from_secs(30),
        }
    }

    fn breaker_settings(max_failures: u32, cooldown_ms: u64) -> BreakerSettings {
        BreakerSettings {
            max_failures,
            cooldown_ms,
            max_probes: 2,
        }
    }

    #[tokio::test]
    async fn test_acquire_creates_distinct_connections() {
        let (backend, mut accepted) = fake_backend().await;
        let pool = BackendPool::new(
            pool_config(&backend.addr, 4),
            &breaker_settings(3, 1000),
            Arc::new(NoopSink),
        );

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a.conn_id(), b.conn_id());

        let _s1 = accepted.recv().await.unwrap();
        let _s2 = accepted.recv().await.unwrap();

        let stats = pool.stats().await;
        assert_eq!(stats.total_created, 2);
        assert_eq!(stats.current_active, 2);
    }

    #[tokio::test]
    async fn test_release_and_reuse() {
        let (backend, mut accepted) = fake_backend().await;
        let pool = BackendPool::new(
            pool_config(&backend.addr, 2),
            &breaker_settings(3, 1000),
            Arc::new(NoopSink),
        );

        let conn = pool.acquire().await.unwrap();
        let first_id = conn.conn_id();
        let _server_side = accepted.recv().await.unwrap();
        pool.release(conn).await;

        let again = pool.acquire().await.unwrap();
        assert_eq!(again.conn_id(), first_id);

        let stats = pool.stats().await;
        assert_eq!(stats.total_created, 1);
        assert_eq!(stats.total_released, 1);
    }

    #[tokio::test]
    async fn test_in_transaction_connection_is_not_pooled() {
        let (backend, mut accepted) = fake_backend().await;
        let pool = BackendPool::new(
            pool_config(&backend.addr, 2),
            &breaker_settings(3, 1000),
            Arc::new(NoopSink),
        );

        let mut conn = pool.acquire().await.unwrap();
        let first_id = conn.conn_id();
        let _server_side = accepted.recv().await.unwrap();
        conn.set_in_transaction(true);
        pool.release(conn).await;

        assert_eq!(pool.stats().await.current_idle, 0);
        let fresh = pool.acquire().await.unwrap();
        assert_ne!(fresh.conn_id(), first_id);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        let (backend, mut accepted) = fake_backend().await;
        let pool = BackendPool::new(
            pool_config(&backend.addr, 1),
            &breaker_settings(3, 1000),
            Arc::new(NoopSink),
        );

        let _held = pool.acquire().await.unwrap();
        let _server_side = accepted.recv().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, QuotientError::PoolExhausted));
    }

    #[tokio::test]
    async fn test_breaker_opens_after_dial_failures() {
        // Unroutable port: dials fail with connection refused.
        let pool = BackendPool::new(
            pool_config("127.0.0.1:1", 4),
            &breaker_settings(2, 60_000),
            Arc::new(NoopSink),
        );

        assert!(pool.acquire().await.is_err());
        assert!(pool.acquire().await.is_err());
        assert_eq!(pool.breaker().state(), CircuitState::Open);

        // Next acquire is rejected by the breaker without dialing.
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, QuotientError::BackendUnavailable { .. }));
        assert_eq!(pool.breaker().stats().total_rejections, 1);
    }

    #[tokio::test]
    async fn test_breaker_probes_after_cooldown() {
        let pool = BackendPool::new(
            pool_config("127.0.0.1:1", 4),
            &breaker_settings(1, 50),
            Arc::new(NoopSink),
        );
        assert!(pool.acquire().await.is_err());
        assert_eq!(pool.breaker().state(), CircuitState::Open);

        // After the cooldown the next acquire is allowed to dial once;
        // the probe still fails and reopens the circuit.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(pool.acquire().await.is_err());
        assert_eq!(pool.breaker().state(), CircuitState::Open);
        assert!(pool.breaker().stats().total_failures >= 2);
    }

    #[tokio::test]
    async fn test_reaper_evicts_stale_idle_connections() {
        let (backend, mut accepted) = fake_backend().await;
        let mut config = pool_config(&backend.addr, 2);
        config.max_idle_time = Duration::from_millis(20);
        let pool = BackendPool::new(config, &breaker_settings(3, 1000), Arc::new(NoopSink));

        let conn = pool.acquire().await.unwrap();
        let _server_side = accepted.recv().await.unwrap();
        pool.release(conn).await;
        assert_eq!(pool.stats().await.current_idle, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.reap().await;
        assert_eq!(pool.stats().await.current_idle, 0);
    }

    #[tokio::test]
    async fn test_dead_idle_connection_evicted_on_acquire() {
        let (backend, mut accepted) = fake_backend().await;
        let pool = BackendPool::new(
            pool_config(&backend.addr, 2),
            &breaker_settings(3, 1000),
            Arc::new(NoopSink),
        );

        let conn = pool.acquire().await.unwrap();
        let first_id = conn.conn_id();
        let mut server_side = accepted.recv().await.unwrap();
        pool.release(conn).await;

        // Kill the server side so the pooled socket goes dead.
        server_side.shutdown().await.unwrap();
        drop(server_side);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let fresh = pool.acquire().await.unwrap();
        assert_ne!(fresh.conn_id(), first_id);
        let _s2 = accepted.recv().await.unwrap();
    }
}
