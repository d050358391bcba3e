//! Thread-per-core worker runtime. Each worker thread runs its own
//! monoio runtime and listener (SO_REUSEPORT spreads accepts across
//! them); cross-thread state lives in one shared, mostly-immutable
//! `SharedGateway`.

use crate::cluster::UpstreamCluster;
use crate::connection::{handle_connection, WorkerState};
use crate::pool::{self, ConnPool, PoolKey};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use torii_cache::HttpCache;
use torii_core::{GatewayConfig, Router};
use torii_http::Limits;
use torii_middleware::MiddlewareChain;
use torii_observability::Metrics;
use tracing::{error, info};

/// Cross-thread gateway state: configuration, compiled router, clusters,
/// the middleware chain, the response cache, and metrics. Everything here
/// is either immutable after startup or internally synchronised.
pub struct SharedGateway {
    pub config: GatewayConfig,
    pub router: Router,
    pub clusters: HashMap<String, Arc<UpstreamCluster>>,
    pub chain: MiddlewareChain,
    pub cache: Option<HttpCache>,
    pub metrics: Arc<Metrics>,
    pub limits: Limits,
    pub active_connections: AtomicUsize,
}

impl SharedGateway {
    pub fn new(
        config: GatewayConfig,
        router: Router,
        clusters: HashMap<String, Arc<UpstreamCluster>>,
        chain: MiddlewareChain,
        cache: Option<HttpCache>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let limits = Limits {
            max_head_bytes: config.proxy.max_head_bytes,
            max_header_count: 100,
            max_body_bytes: config.proxy.max_body_bytes,
            allowed_trailers: config.proxy.allowed_trailers.clone(),
        };
        Arc::new(Self {
            config,
            router,
            clusters,
            chain,
            cache,
            metrics,
            limits,
            active_connections: AtomicUsize::new(0),
        })
    }

    pub fn cluster(&self, id: &str) -> Option<&Arc<UpstreamCluster>> {
        self.clusters.get(id)
    }

    /// Every pool key the configured clusters can dial.
    pub fn pool_keys(&self) -> Vec<PoolKey> {
        let mut keys = Vec::new();
        for cluster in self.clusters.values() {
            for server in &cluster.servers {
                let key = PoolKey::from_server(server);
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }
}

/// Spawn `num_workers` OS threads, each with its own monoio runtime,
/// listener, and connection pool.
pub fn spawn_workers(
    shared: Arc<SharedGateway>,
    num_workers: usize,
) -> Vec<std::thread::JoinHandle<()>> {
    let addr = shared.config.proxy.listen_addr.to_string();
    let mut handles = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        let shared = Arc::clone(&shared);
        let addr = addr.clone();

        let handle = std::thread::Builder::new()
            .name(format!("torii-worker-{worker_id}"))
            .spawn(move || {
                let mut rt = monoio::RuntimeBuilder::<monoio::FusionDriver>::new()
                    .enable_all()
                    .build()
                    .expect("failed to build monoio runtime");
                rt.block_on(worker_loop(worker_id, shared, addr));
            })
            .expect("failed to spawn worker thread");

        handles.push(handle);
    }

    info!(workers = num_workers, addr = %addr, "Workers spawned");
    handles
}

async fn worker_loop(worker_id: usize, shared: Arc<SharedGateway>, addr: String) {
    use monoio::net::TcpListener;

    let listener = TcpListener::bind(&addr)
        .unwrap_or_else(|e| panic!("worker {worker_id} failed to bind {addr}: {e}"));
    info!(worker = worker_id, addr = %addr, "Worker listening");

    let pool = Rc::new(RefCell::new(ConnPool::new(
        shared.config.proxy.pool.clone(),
        Arc::clone(&shared.metrics),
    )));

    let prewarm_count = shared.config.proxy.pool.prewarm;
    if prewarm_count > 0 {
        let keys = shared.pool_keys();
        pool::prewarm(&pool, &keys, prewarm_count, &shared.limits).await;
    }

    // the pool is thread-local, so its sweeper runs on this worker too
    {
        let pool = Rc::clone(&pool);
        let interval = std::time::Duration::from_millis(
            shared.config.proxy.pool.sweep_interval_ms.max(100),
        );
        monoio::spawn(async move {
            loop {
                monoio::time::sleep(interval).await;
                let closed = pool.borrow_mut().sweep(std::time::Instant::now());
                if closed > 0 {
                    tracing::debug!(closed, "Pool sweep");
                }
            }
        });
    }

    let state = Rc::new(WorkerState {
        shared: Arc::clone(&shared),
        pool,
    });
    let max_connections = shared.config.proxy.max_connections;

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                // beyond the connection budget, accepts are closed at once
                if max_connections > 0
                    && shared.active_connections.load(Ordering::Relaxed) >= max_connections
                {
                    drop(stream);
                    continue;
                }
                let _ = stream.set_nodelay(true);

                shared.active_connections.fetch_add(1, Ordering::Relaxed);
                shared.metrics.active_connections.inc();

                let state = Rc::clone(&state);
                let shared = Arc::clone(&shared);
                monoio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer_addr, state).await {
                        tracing::debug!(error = %e, "Connection closed");
                    }
                    shared.active_connections.fetch_sub(1, Ordering::Relaxed);
                    shared.metrics.active_connections.dec();
                });
            }
            Err(e) => {
                error!(worker = worker_id, error = %e, "Accept error");
            }
        }
    }
}
