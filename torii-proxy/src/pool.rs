//! Per-worker upstream connection pool. Each worker thread owns one pool
//! behind `Rc<RefCell<_>>`, so bookkeeping is borrow-scoped and never
//! crosses an await; only the dial itself suspends.

use crate::server::UpstreamServer;
use monoio::net::TcpStream;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use torii_core::config::PoolConfig;
use torii_core::upstream::Scheme;
use torii_core::GatewayError;
use torii_http::{ClientConn, Limits};
use torii_observability::Metrics;
use tracing::{debug, warn};

/// Pools are keyed by `(scheme, host, port)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl PoolKey {
    pub fn from_server(server: &UpstreamServer) -> PoolKey {
        PoolKey {
            scheme: server.scheme,
            host: server.host.clone(),
            port: server.port,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Metric label, e.g. `http://10.0.0.1:8080`.
    pub fn label(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Anything the pool can hold. The cleanliness check gates re-entry to
/// the idle queue: a connection with unread bytes is never reused.
pub trait Poolable {
    fn is_clean(&self) -> bool;
}

impl Poolable for ClientConn<TcpStream> {
    fn is_clean(&self) -> bool {
        self.is_drained()
    }
}

pub struct PooledConn<C> {
    pub conn: C,
    pub key: PoolKey,
    pub created_at: Instant,
    pub last_used: Instant,
    pub use_count: u32,
}

impl<C> PooledConn<C> {
    pub fn new(conn: C, key: PoolKey, now: Instant) -> Self {
        Self {
            conn,
            key,
            created_at: now,
            last_used: now,
            use_count: 0,
        }
    }
}

struct KeyPool<C> {
    idle: VecDeque<PooledConn<C>>,
    in_flight: usize,
}

impl<C> Default for KeyPool<C> {
    fn default() -> Self {
        Self {
            idle: VecDeque::new(),
            in_flight: 0,
        }
    }
}

/// What a caller should do next. The enum keeps every `RefCell` borrow
/// short: the caller drops the borrow before dialling or sleeping.
pub enum TryAcquire<C> {
    /// An idle connection, already counted in-flight.
    Idle(PooledConn<C>),
    /// Capacity available: dial, then the reserved slot is yours
    /// (`forfeit` it if the dial fails).
    Connect,
    /// Both per-key and global budgets are full; wait for a return.
    Wait,
}

pub struct ConnPool<C> {
    keys: HashMap<PoolKey, KeyPool<C>>,
    global_in_flight: usize,
    cfg: PoolConfig,
    metrics: Arc<Metrics>,
}

impl<C: Poolable> ConnPool<C> {
    pub fn new(cfg: PoolConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            keys: HashMap::with_capacity(16),
            global_in_flight: 0,
            cfg,
            metrics,
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.acquire_timeout_ms)
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn try_acquire(&mut self, key: &PoolKey, now: Instant) -> TryAcquire<C> {
        let idle_timeout = Duration::from_millis(self.cfg.idle_timeout_ms);
        let max_lifetime = Duration::from_millis(self.cfg.max_lifetime_ms);
        let pool = self.keys.entry(key.clone()).or_default();

        while let Some(conn) = pool.idle.pop_front() {
            if now.duration_since(conn.last_used) >= idle_timeout
                || now.duration_since(conn.created_at) >= max_lifetime
            {
                continue; // dropping closes the fd
            }
            pool.in_flight += 1;
            self.global_in_flight += 1;
            self.metrics.pool_reuse.with_label_values(&[&key.label()]).inc();
            return TryAcquire::Idle(conn);
        }

        if pool.in_flight < self.cfg.max_in_flight_per_key
            && self.global_in_flight < self.cfg.max_in_flight_global
        {
            pool.in_flight += 1;
            self.global_in_flight += 1;
            self.metrics.pool_miss.with_label_values(&[&key.label()]).inc();
            return TryAcquire::Connect;
        }

        TryAcquire::Wait
    }

    /// Give back a reserved slot without a connection (dial failure, or
    /// the connection was consumed by an error/timeout).
    pub fn forfeit(&mut self, key: &PoolKey) {
        if let Some(pool) = self.keys.get_mut(key) {
            pool.in_flight = pool.in_flight.saturating_sub(1);
        }
        self.global_in_flight = self.global_in_flight.saturating_sub(1);
    }

    /// Return a checked-out connection. Re-enters the idle queue only if
    /// the caller says it is reusable, it is clean, and neither lifetime
    /// bound has elapsed.
    pub fn release(&mut self, mut conn: PooledConn<C>, reusable: bool, now: Instant) {
        let key = conn.key.clone();
        self.forfeit(&key);

        let idle_timeout = Duration::from_millis(self.cfg.idle_timeout_ms);
        let max_lifetime = Duration::from_millis(self.cfg.max_lifetime_ms);
        if !reusable
            || !conn.conn.is_clean()
            || now.duration_since(conn.created_at) >= max_lifetime
            || now.duration_since(conn.last_used) >= idle_timeout
        {
            return; // dropped, closing the stream
        }

        let pool = self.keys.entry(key).or_default();
        if pool.idle.len() < self.cfg.max_idle_per_key {
            conn.last_used = now;
            conn.use_count += 1;
            pool.idle.push_back(conn);
        }
    }

    /// Insert a pre-dialled connection as idle (pool pre-warming).
    pub fn register_idle(&mut self, conn: PooledConn<C>) {
        let pool = self.keys.entry(conn.key.clone()).or_default();
        if pool.idle.len() < self.cfg.max_idle_per_key {
            pool.idle.push_back(conn);
        }
    }

    /// Close idle connections past their idle timeout or max lifetime.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let idle_timeout = Duration::from_millis(self.cfg.idle_timeout_ms);
        let max_lifetime = Duration::from_millis(self.cfg.max_lifetime_ms);
        let mut closed = 0;
        for pool in self.keys.values_mut() {
            let before = pool.idle.len();
            pool.idle.retain(|conn| {
                now.duration_since(conn.last_used) < idle_timeout
                    && now.duration_since(conn.created_at) < max_lifetime
            });
            closed += before - pool.idle.len();
        }
        closed
    }

    pub fn idle_count(&self, key: &PoolKey) -> usize {
        self.keys.get(key).map(|p| p.idle.len()).unwrap_or(0)
    }

    pub fn in_flight_count(&self, key: &PoolKey) -> usize {
        self.keys.get(key).map(|p| p.in_flight).unwrap_or(0)
    }
}

/// A pooled upstream connection as the dispatch path sees it.
pub type UpstreamConn = PooledConn<ClientConn<TcpStream>>;
pub type WorkerPool = ConnPool<ClientConn<TcpStream>>;

/// Acquire a connection for `key`: reuse idle, dial within budget, or
/// wait (bounded) for a return. Fails with `PoolExhausted` when the wait
/// budget runs out.
pub async fn acquire(
    pool: &Rc<RefCell<WorkerPool>>,
    key: &PoolKey,
    connect_timeout: Duration,
    limits: &Limits,
) -> Result<UpstreamConn, GatewayError> {
    let started = Instant::now();
    let (deadline, metrics) = {
        let p = pool.borrow();
        (started + p.acquire_timeout(), Arc::clone(p.metrics()))
    };

    loop {
        let attempt = pool.borrow_mut().try_acquire(key, Instant::now());
        match attempt {
            TryAcquire::Idle(conn) => {
                metrics
                    .pool_wait_seconds
                    .with_label_values(&[&key.label()])
                    .observe(started.elapsed().as_secs_f64());
                return Ok(conn);
            }
            TryAcquire::Connect => {
                let addr = key.addr();
                match monoio::time::timeout(connect_timeout, TcpStream::connect(addr.as_str())).await
                {
                    Ok(Ok(stream)) => {
                        let _ = stream.set_nodelay(true);
                        metrics
                            .pool_wait_seconds
                            .with_label_values(&[&key.label()])
                            .observe(started.elapsed().as_secs_f64());
                        debug!(key = %key.label(), "Upstream connected");
                        return Ok(PooledConn::new(
                            ClientConn::new(stream, limits.clone()),
                            key.clone(),
                            Instant::now(),
                        ));
                    }
                    Ok(Err(e)) => {
                        pool.borrow_mut().forfeit(key);
                        metrics.pool_errors.with_label_values(&[&key.label()]).inc();
                        warn!(key = %key.label(), error = %e, "Upstream connect failed");
                        return Err(GatewayError::UpstreamConnect(e.to_string()));
                    }
                    Err(_) => {
                        pool.borrow_mut().forfeit(key);
                        metrics.pool_errors.with_label_values(&[&key.label()]).inc();
                        return Err(GatewayError::UpstreamConnect("connect timed out".into()));
                    }
                }
            }
            TryAcquire::Wait => {
                if Instant::now() >= deadline {
                    metrics.pool_errors.with_label_values(&[&key.label()]).inc();
                    return Err(GatewayError::PoolExhausted);
                }
                monoio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

/// Open `count` connections to every key before accepting traffic.
pub async fn prewarm(
    pool: &Rc<RefCell<WorkerPool>>,
    keys: &[PoolKey],
    count: usize,
    limits: &Limits,
) {
    for key in keys {
        let addr = key.addr();
        for _ in 0..count {
            match TcpStream::connect(addr.as_str()).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    let conn = PooledConn::new(
                        ClientConn::new(stream, limits.clone()),
                        key.clone(),
                        Instant::now(),
                    );
                    pool.borrow_mut().register_idle(conn);
                }
                Err(e) => {
                    warn!(key = %key.label(), error = %e, "Pool pre-warm connect failed");
                    break; // upstream not up yet, stop trying this key
                }
            }
        }
        let idle = pool.borrow().idle_count(key);
        if idle > 0 {
            tracing::info!(key = %key.label(), conns = idle, "Pool pre-warmed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeConn {
        clean: bool,
    }

    impl Poolable for FakeConn {
        fn is_clean(&self) -> bool {
            self.clean
        }
    }

    fn key() -> PoolKey {
        PoolKey {
            scheme: Scheme::Http,
            host: "10.0.0.1".into(),
            port: 8080,
        }
    }

    fn pool(overrides: serde_json::Value) -> ConnPool<FakeConn> {
        let cfg: PoolConfig = serde_json::from_value(overrides).unwrap();
        ConnPool::new(cfg, Arc::new(Metrics::new().unwrap()))
    }

    fn clean_conn(now: Instant) -> PooledConn<FakeConn> {
        PooledConn::new(FakeConn { clean: true }, key(), now)
    }

    #[test]
    fn empty_pool_says_connect() {
        let mut p = pool(serde_json::json!({}));
        assert!(matches!(p.try_acquire(&key(), Instant::now()), TryAcquire::Connect));
        assert_eq!(p.in_flight_count(&key()), 1);
    }

    #[test]
    fn released_connection_is_reused() {
        let mut p = pool(serde_json::json!({}));
        let now = Instant::now();
        assert!(matches!(p.try_acquire(&key(), now), TryAcquire::Connect));
        p.release(clean_conn(now), true, now);
        assert_eq!(p.idle_count(&key()), 1);
        assert!(matches!(p.try_acquire(&key(), now), TryAcquire::Idle(_)));
        assert_eq!(p.idle_count(&key()), 0);
    }

    #[test]
    fn per_key_budget_forces_wait() {
        let mut p = pool(serde_json::json!({ "max_in_flight_per_key": 2 }));
        let now = Instant::now();
        assert!(matches!(p.try_acquire(&key(), now), TryAcquire::Connect));
        assert!(matches!(p.try_acquire(&key(), now), TryAcquire::Connect));
        assert!(matches!(p.try_acquire(&key(), now), TryAcquire::Wait));
        p.forfeit(&key());
        assert!(matches!(p.try_acquire(&key(), now), TryAcquire::Connect));
    }

    #[test]
    fn global_budget_spans_keys() {
        let mut p = pool(serde_json::json!({ "max_in_flight_global": 1 }));
        let other = PoolKey {
            scheme: Scheme::Http,
            host: "10.0.0.2".into(),
            port: 8080,
        };
        let now = Instant::now();
        assert!(matches!(p.try_acquire(&key(), now), TryAcquire::Connect));
        assert!(matches!(p.try_acquire(&other, now), TryAcquire::Wait));
    }

    #[test]
    fn dirty_connection_is_not_pooled() {
        let mut p = pool(serde_json::json!({}));
        let now = Instant::now();
        assert!(matches!(p.try_acquire(&key(), now), TryAcquire::Connect));
        p.release(PooledConn::new(FakeConn { clean: false }, key(), now), true, now);
        assert_eq!(p.idle_count(&key()), 0);
    }

    #[test]
    fn non_reusable_release_closes() {
        let mut p = pool(serde_json::json!({}));
        let now = Instant::now();
        assert!(matches!(p.try_acquire(&key(), now), TryAcquire::Connect));
        p.release(clean_conn(now), false, now);
        assert_eq!(p.idle_count(&key()), 0);
        assert_eq!(p.in_flight_count(&key()), 0);
    }

    #[test]
    fn idle_timeout_expires_pooled_connections() {
        let mut p = pool(serde_json::json!({ "idle_timeout_ms": 1000 }));
        let t0 = Instant::now();
        assert!(matches!(p.try_acquire(&key(), t0), TryAcquire::Connect));
        p.release(clean_conn(t0), true, t0);
        // past the idle timeout the stale conn is dropped and we dial anew
        let later = t0 + Duration::from_secs(2);
        assert!(matches!(p.try_acquire(&key(), later), TryAcquire::Connect));
    }

    #[test]
    fn max_lifetime_expires_even_active_connections() {
        let mut p = pool(serde_json::json!({ "max_lifetime_ms": 1000, "idle_timeout_ms": 60000 }));
        let t0 = Instant::now();
        assert!(matches!(p.try_acquire(&key(), t0), TryAcquire::Connect));
        let conn = clean_conn(t0);
        let later = t0 + Duration::from_secs(2);
        p.release(conn, true, later);
        assert_eq!(p.idle_count(&key()), 0, "past max lifetime must not re-enter");
    }

    #[test]
    fn max_idle_caps_the_queue() {
        let mut p = pool(serde_json::json!({ "max_idle_per_key": 1 }));
        let now = Instant::now();
        assert!(matches!(p.try_acquire(&key(), now), TryAcquire::Connect));
        assert!(matches!(p.try_acquire(&key(), now), TryAcquire::Connect));
        p.release(clean_conn(now), true, now);
        p.release(clean_conn(now), true, now);
        assert_eq!(p.idle_count(&key()), 1);
    }

    #[test]
    fn sweep_closes_expired_idle() {
        let mut p = pool(serde_json::json!({ "idle_timeout_ms": 1000 }));
        let t0 = Instant::now();
        p.register_idle(clean_conn(t0));
        assert_eq!(p.sweep(t0 + Duration::from_secs(2)), 1);
        assert_eq!(p.idle_count(&key()), 0);
    }
}
