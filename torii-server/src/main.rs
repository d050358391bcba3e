// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  torii — HTTP/1.1 reverse proxy / API gateway
//
//  Dataplane:  monoio thread-per-core workers
//  Background: tokio current-thread runtime (health probes, sweepers)
//  Config:     YAML + TORII_* environment overrides, fixed at startup
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use torii_cache::store::CacheSettings;
use torii_cache::HttpCache;
use torii_core::{GatewayConfig, Router};
use torii_middleware::{MiddlewareChain, MiddlewareRegistry};
use torii_middlewares::auth::ConsumerValidator;
use torii_observability::Metrics;
use torii_proxy::{spawn_workers, SharedGateway, UpstreamCluster};
use tracing::info;

/// Global shutdown flag, set by the signal handler.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = "torii", version, about = "torii — HTTP/1.1 reverse proxy / API gateway")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/etc/torii/torii.yaml")]
    config: PathBuf,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "torii starting");

    let config = if cli.config.exists() {
        info!(path = %cli.config.display(), "Loading config file");
        GatewayConfig::load(&cli.config)?
    } else {
        info!("No config file found, using defaults");
        GatewayConfig::default()
    };

    if let Some(tls) = &config.tls {
        anyhow::ensure!(
            tls.cert_path.exists() && tls.key_path.exists(),
            "tls cert/key not found: {} / {}",
            tls.cert_path.display(),
            tls.key_path.display()
        );
    }

    let num_workers = config.effective_workers();
    info!(workers = num_workers, "Worker count");

    // ── Metrics ──
    let metrics = Arc::new(Metrics::new()?);

    // ── Middleware chain ──
    let validator = Arc::new(ConsumerValidator::new(config.consumers.clone()));
    let mut registry = MiddlewareRegistry::new();
    torii_middlewares::register_all(&mut registry, validator, Arc::clone(&metrics));
    let chain = MiddlewareChain::from_config(&registry, &config.middlewares)?;
    info!(middlewares = chain.len(), "Middleware chain built");

    // ── Router ──
    let router = Router::build(&config.routes)?;
    info!(routes = router.route_count(), "Router built");

    // ── Upstream clusters ──
    let mut clusters: HashMap<String, Arc<UpstreamCluster>> = HashMap::new();
    for upstream in &config.upstreams {
        clusters.insert(
            upstream.id.clone(),
            Arc::new(UpstreamCluster::build(upstream)?),
        );
    }
    info!(clusters = clusters.len(), "Upstream clusters built");

    // ── Response cache ──
    let cache = if config.cache.enabled {
        Some(HttpCache::new(CacheSettings {
            max_bytes: config.cache.max_bytes,
            max_entries: config.cache.max_entries,
            default_ttl: Duration::from_millis(config.cache.default_ttl_ms),
            max_ttl: Duration::from_millis(config.cache.max_ttl_ms),
        }))
    } else {
        None
    };

    let shared = SharedGateway::new(config.clone(), router, clusters, chain, cache, metrics);

    // ── Background plane: health probes + sweepers on tokio ──
    spawn_background(Arc::clone(&shared));

    // ── Data plane: monoio workers ──
    let worker_handles = spawn_workers(Arc::clone(&shared), num_workers);

    info!(
        addr = %config.proxy.listen_addr,
        workers = num_workers,
        "torii is ready — serving traffic"
    );

    setup_signal_handler();
    while !SHUTDOWN.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("Shutdown signal received, draining");
    let drain_deadline = Instant::now() + Duration::from_secs(10);
    while shared.active_connections.load(Ordering::Relaxed) > 0
        && Instant::now() < drain_deadline
    {
        std::thread::sleep(Duration::from_millis(50));
    }
    // Workers run infinite accept loops; the OS reclaims them at exit.
    drop(worker_handles);
    info!("torii stopped");
    Ok(())
}

/// One dedicated OS thread with a current-thread tokio runtime hosts the
/// health checkers and the periodic sweepers (cache TTL, rate-limit idle
/// keys, affinity bindings, pool has its own per-worker bookkeeping).
fn spawn_background(shared: Arc<SharedGateway>) {
    std::thread::Builder::new()
        .name("torii-background".to_string())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build tokio runtime for background tasks");

            rt.block_on(async move {
                let clusters: Vec<Arc<UpstreamCluster>> =
                    shared.clusters.values().cloned().collect();
                let _checkers = torii_proxy::health::spawn_checkers(clusters.clone());

                let cache_interval =
                    Duration::from_millis(shared.config.cache.sweep_interval_ms.max(1000));
                let sweeper = {
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        let mut tick = tokio::time::interval(cache_interval);
                        loop {
                            tick.tick().await;
                            let now = Instant::now();
                            if let Some(cache) = &shared.cache {
                                let removed = cache.sweep(now);
                                if removed > 0 {
                                    tracing::debug!(removed, "Cache sweep");
                                }
                                shared
                                    .metrics
                                    .cache_bytes
                                    .set(cache.stats().total_bytes as i64);
                            }
                            shared.chain.sweep();
                            for cluster in &clusters {
                                cluster.sweep_affinity(now);
                            }
                        }
                    })
                };

                let _ = sweeper.await;
            });
        })
        .expect("failed to spawn background thread");
}

fn setup_signal_handler() {
    // SIGTERM (docker stop) + SIGINT (Ctrl+C)
    for sig in [libc::SIGTERM, libc::SIGINT] {
        unsafe {
            libc::signal(sig, signal_handler as libc::sighandler_t);
        }
    }
}

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}
