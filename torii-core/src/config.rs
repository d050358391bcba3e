use crate::route::RouteConfig;
use crate::upstream::UpstreamConfig;
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Top-level gateway configuration. Routes and upstreams are provided at
/// startup; there is no live reconfiguration surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway node ID (auto-generated if not set).
    #[serde(default = "default_node_id")]
    pub node_id: String,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// TLS listener settings. Absent = plaintext only.
    #[serde(default)]
    pub tls: Option<TlsServerConfig>,

    /// Gateway-wide middleware chain, in config order.
    #[serde(default)]
    pub middlewares: Vec<MiddlewareEntry>,

    /// Known API consumers, validated by the auth middleware.
    #[serde(default)]
    pub consumers: Vec<ConsumerConfig>,

    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// HTTP listener address.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Worker threads (0 = one per core).
    #[serde(default)]
    pub workers: usize,

    /// Accepts beyond this are closed immediately (0 = unlimited).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Keep-alive idle timeout between requests on one connection.
    #[serde(default = "default_keepalive_idle")]
    pub keepalive_idle_ms: u64,

    /// Global per-request deadline.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Per-stage deadlines for upstream exchanges.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_first_byte_timeout")]
    pub first_byte_timeout_ms: u64,

    #[serde(default = "default_max_head_bytes")]
    pub max_head_bytes: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Trailer names forwarded instead of discarded.
    #[serde(default)]
    pub allowed_trailers: Vec<String>,

    #[serde(default)]
    pub pool: PoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_max_idle")]
    pub max_idle_per_key: usize,

    #[serde(default = "default_pool_max_in_flight")]
    pub max_in_flight_per_key: usize,

    #[serde(default = "default_pool_max_global")]
    pub max_in_flight_global: usize,

    /// How long `acquire` waits for a connection to come back before
    /// failing with PoolExhausted.
    #[serde(default = "default_pool_acquire_timeout")]
    pub acquire_timeout_ms: u64,

    #[serde(default = "default_pool_idle_timeout")]
    pub idle_timeout_ms: u64,

    #[serde(default = "default_pool_max_lifetime")]
    pub max_lifetime_ms: u64,

    /// Idle connections used more recently than this skip the liveness
    /// check on reuse.
    #[serde(default = "default_pool_reuse_probe")]
    pub reuse_probe_idle_ms: u64,

    /// Connections opened per upstream before accepting traffic.
    #[serde(default)]
    pub prewarm: usize,

    #[serde(default = "default_pool_sweep_interval")]
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: u64,

    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,

    /// TTL when the response carries no freshness information.
    #[serde(default = "default_cache_default_ttl")]
    pub default_ttl_ms: u64,

    /// Upper bound on any computed TTL.
    #[serde(default = "default_cache_max_ttl")]
    pub max_ttl_ms: u64,

    #[serde(default = "default_cache_sweep_interval")]
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_path")]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsServerConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// One middleware chain entry: `(middleware, enabled, priority)` plus its
/// free-form config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareEntry {
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Chain position; ascending, stable for ties. Absent = the
    /// middleware's own default.
    #[serde(default)]
    pub priority: Option<i32>,

    #[serde(default = "default_middleware_config")]
    pub config: serde_json::Value,
}

fn default_middleware_config() -> serde_json::Value {
    serde_json::json!({})
}

/// A consumer the auth middleware can authenticate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsumerConfig {
    pub id: String,

    #[serde(default)]
    pub roles: Vec<String>,

    /// Basic credentials.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,

    /// Bearer token.
    #[serde(default)]
    pub token: Option<String>,
}

impl GatewayConfig {
    /// Load from a YAML file merged with `TORII_`-prefixed environment
    /// overrides (`TORII_PROXY__LISTEN_ADDR`, ...).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config: Self = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("TORII_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that serde cannot express: unique ids, resolvable
    /// upstream references, positive weights, parseable affinity keys.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut upstream_ids = HashSet::new();
        for ups in &self.upstreams {
            if !upstream_ids.insert(ups.id.as_str()) {
                anyhow::bail!("duplicate upstream id {:?}", ups.id);
            }
            if ups.servers.is_empty() {
                anyhow::bail!("upstream {:?} has no servers", ups.id);
            }
            let mut server_ids = HashSet::new();
            for server in &ups.servers {
                if !server_ids.insert(server.id.as_str()) {
                    anyhow::bail!("upstream {:?}: duplicate server id {:?}", ups.id, server.id);
                }
                if server.weight == 0 {
                    anyhow::bail!("upstream {:?}: server {:?} has zero weight", ups.id, server.id);
                }
            }
            if let Some(aff) = &ups.affinity {
                validate_affinity_key(&aff.key)
                    .map_err(|e| anyhow::anyhow!("upstream {:?}: {e}", ups.id))?;
            }
        }

        let mut route_ids = HashSet::new();
        for route in &self.routes {
            if !route_ids.insert(route.id.as_str()) {
                anyhow::bail!("duplicate route id {:?}", route.id);
            }
            if !upstream_ids.contains(route.upstream.as_str()) {
                anyhow::bail!(
                    "route {:?} references unknown upstream {:?}",
                    route.id,
                    route.upstream
                );
            }
            if let Some(overrides) = &route.overrides {
                if let Some(aff) = &overrides.affinity {
                    validate_affinity_key(&aff.key)
                        .map_err(|e| anyhow::anyhow!("route {:?}: {e}", route.id))?;
                }
            }
        }
        Ok(())
    }

    pub fn effective_workers(&self) -> usize {
        if self.proxy.workers > 0 {
            self.proxy.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

fn validate_affinity_key(key: &str) -> Result<(), String> {
    let valid = key == "client_ip"
        || key
            .strip_prefix("cookie:")
            .map(|n| !n.is_empty())
            .unwrap_or(false)
        || key
            .strip_prefix("header:")
            .map(|n| !n.is_empty())
            .unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(format!(
            "invalid affinity key {key:?} (expected cookie:<name>, header:<name>, or client_ip)"
        ))
    }
}

// Default implementations

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            proxy: ProxyConfig::default(),
            cache: CacheConfig::default(),
            metrics: MetricsConfig::default(),
            tls: None,
            middlewares: Vec::new(),
            consumers: Vec::new(),
            routes: Vec::new(),
            upstreams: Vec::new(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            workers: 0,
            max_connections: default_max_connections(),
            keepalive_idle_ms: default_keepalive_idle(),
            request_timeout_ms: default_request_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            write_timeout_ms: default_write_timeout(),
            first_byte_timeout_ms: default_first_byte_timeout(),
            max_head_bytes: default_max_head_bytes(),
            max_body_bytes: default_max_body_bytes(),
            allowed_trailers: Vec::new(),
            pool: PoolConfig::default(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_key: default_pool_max_idle(),
            max_in_flight_per_key: default_pool_max_in_flight(),
            max_in_flight_global: default_pool_max_global(),
            acquire_timeout_ms: default_pool_acquire_timeout(),
            idle_timeout_ms: default_pool_idle_timeout(),
            max_lifetime_ms: default_pool_max_lifetime(),
            reuse_probe_idle_ms: default_pool_reuse_probe(),
            prewarm: 0,
            sweep_interval_ms: default_pool_sweep_interval(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: default_cache_max_bytes(),
            max_entries: default_cache_max_entries(),
            default_ttl_ms: default_cache_default_ttl(),
            max_ttl_ms: default_cache_max_ttl(),
            sweep_interval_ms: default_cache_sweep_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
        }
    }
}

// Serde default functions

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_keepalive_idle() -> u64 {
    60_000
}

fn default_request_timeout() -> u64 {
    30_000
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_write_timeout() -> u64 {
    10_000
}

fn default_first_byte_timeout() -> u64 {
    15_000
}

fn default_max_head_bytes() -> usize {
    32 * 1024
}

fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_pool_max_idle() -> usize {
    16
}

fn default_pool_max_in_flight() -> usize {
    64
}

fn default_pool_max_global() -> usize {
    1024
}

fn default_pool_acquire_timeout() -> u64 {
    1_000
}

fn default_pool_idle_timeout() -> u64 {
    30_000
}

fn default_pool_max_lifetime() -> u64 {
    300_000
}

fn default_pool_reuse_probe() -> u64 {
    2_000
}

fn default_pool_sweep_interval() -> u64 {
    5_000
}

fn default_cache_max_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_cache_default_ttl() -> u64 {
    60_000
}

fn default_cache_max_ttl() -> u64 {
    86_400_000
}

fn default_cache_sweep_interval() -> u64 {
    10_000
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.proxy.listen_addr.port(), 8080);
        assert!(cfg.cache.enabled);
        assert!(cfg.metrics.enabled);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn yaml_roundtrip_with_routes() {
        let yaml = r#"
proxy:
  listen_addr: "127.0.0.1:9999"
  workers: 2
routes:
  - id: api
    pattern: "/api/*"
    upstream: backend
upstreams:
  - id: backend
    strategy: least_connections
    servers:
      - { id: a, host: "10.0.0.1", port: 8080, weight: 2 }
      - { id: b, host: "10.0.0.2", port: 8080 }
"#;
        let cfg: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.proxy.listen_addr.port(), 9999);
        assert_eq!(cfg.proxy.workers, 2);
        assert_eq!(cfg.routes.len(), 1);
        assert_eq!(cfg.upstreams[0].servers.len(), 2);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn unresolved_upstream_ref_fails_validation() {
        let yaml = r#"
routes:
  - { id: r1, pattern: "/", upstream: ghost }
"#;
        let cfg: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duplicate_ids_fail_validation() {
        let yaml = r#"
upstreams:
  - { id: b, servers: [{ id: a, host: h, port: 1 }] }
  - { id: b, servers: [{ id: a, host: h, port: 1 }] }
"#;
        let cfg: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_weight_fails_validation() {
        let yaml = r#"
upstreams:
  - { id: b, servers: [{ id: a, host: h, port: 1, weight: 0 }] }
"#;
        let cfg: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn affinity_key_forms() {
        assert!(validate_affinity_key("client_ip").is_ok());
        assert!(validate_affinity_key("cookie:session").is_ok());
        assert!(validate_affinity_key("header:x-user").is_ok());
        assert!(validate_affinity_key("cookie:").is_err());
        assert!(validate_affinity_key("ip").is_err());
    }

    #[test]
    fn unknown_route_key_rejected_at_parse() {
        let yaml = r#"
routes:
  - { id: r1, pattern: "/", upstream: b, sticky: true }
upstreams:
  - { id: b, servers: [{ id: a, host: h, port: 1 }] }
"#;
        assert!(serde_yaml::from_str::<GatewayConfig>(yaml).is_err());
    }
}
