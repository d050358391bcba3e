use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Gateway metrics, constructed once at startup and passed by handle —
/// never reached through ambient state.
pub struct Metrics {
    registry: Registry,

    pub total_requests: IntCounter,
    pub total_errors: IntCounter,
    pub active_connections: IntGauge,
    pub bytes_in: IntCounter,
    pub bytes_out: IntCounter,

    /// Request latency by route.
    pub request_duration: HistogramVec,

    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    pub cache_evictions: IntCounter,
    pub cache_bytes: IntGauge,

    /// Pool behaviour per `(scheme, host, port)` key.
    pub pool_reuse: IntCounterVec,
    pub pool_miss: IntCounterVec,
    pub pool_errors: IntCounterVec,
    pub pool_wait_seconds: HistogramVec,

    /// Rate-limit decisions per key class (`principal` / `client_ip`).
    pub ratelimit_allowed: IntCounterVec,
    pub ratelimit_denied: IntCounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let total_requests =
            IntCounter::with_opts(Opts::new("torii_requests_total", "Total HTTP requests"))?;
        let total_errors =
            IntCounter::with_opts(Opts::new("torii_errors_total", "Total error responses"))?;
        let active_connections = IntGauge::new(
            "torii_active_connections",
            "Currently open client connections",
        )?;
        let bytes_in =
            IntCounter::with_opts(Opts::new("torii_bytes_in_total", "Request bytes read"))?;
        let bytes_out =
            IntCounter::with_opts(Opts::new("torii_bytes_out_total", "Response bytes written"))?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new("torii_request_duration_seconds", "Request latency").buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["route"],
        )?;

        let cache_hits =
            IntCounter::with_opts(Opts::new("torii_cache_hits_total", "Cache hits"))?;
        let cache_misses =
            IntCounter::with_opts(Opts::new("torii_cache_misses_total", "Cache misses"))?;
        let cache_evictions =
            IntCounter::with_opts(Opts::new("torii_cache_evictions_total", "Cache evictions"))?;
        let cache_bytes = IntGauge::new("torii_cache_bytes", "Bytes held by the cache")?;

        let pool_reuse = IntCounterVec::new(
            Opts::new("torii_pool_reuse_total", "Pooled connections reused"),
            &["key"],
        )?;
        let pool_miss = IntCounterVec::new(
            Opts::new("torii_pool_miss_total", "Pool misses (new connection opened)"),
            &["key"],
        )?;
        let pool_errors = IntCounterVec::new(
            Opts::new("torii_pool_errors_total", "Pool connect/reuse errors"),
            &["key"],
        )?;
        let pool_wait_seconds = HistogramVec::new(
            HistogramOpts::new("torii_pool_wait_seconds", "Time spent acquiring a connection")
                .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["key"],
        )?;

        let ratelimit_allowed = IntCounterVec::new(
            Opts::new("torii_ratelimit_allowed_total", "Requests under the limit"),
            &["class"],
        )?;
        let ratelimit_denied = IntCounterVec::new(
            Opts::new("torii_ratelimit_denied_total", "Requests rejected by the limit"),
            &["class"],
        )?;

        registry.register(Box::new(total_requests.clone()))?;
        registry.register(Box::new(total_errors.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(bytes_in.clone()))?;
        registry.register(Box::new(bytes_out.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(cache_evictions.clone()))?;
        registry.register(Box::new(cache_bytes.clone()))?;
        registry.register(Box::new(pool_reuse.clone()))?;
        registry.register(Box::new(pool_miss.clone()))?;
        registry.register(Box::new(pool_errors.clone()))?;
        registry.register(Box::new(pool_wait_seconds.clone()))?;
        registry.register(Box::new(ratelimit_allowed.clone()))?;
        registry.register(Box::new(ratelimit_denied.clone()))?;

        Ok(Self {
            registry,
            total_requests,
            total_errors,
            active_connections,
            bytes_in,
            bytes_out,
            request_duration,
            cache_hits,
            cache_misses,
            cache_evictions,
            cache_bytes,
            pool_reuse,
            pool_miss,
            pool_errors,
            pool_wait_seconds,
            ratelimit_allowed,
            ratelimit_denied,
        })
    }

    /// Prometheus text exposition, served on the metrics path.
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer).unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}
