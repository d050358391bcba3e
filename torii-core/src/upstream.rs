use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Upstream cluster definition. Unknown keys are rejected at load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    pub id: String,

    /// Load-balancing strategy.
    #[serde(default)]
    pub strategy: Strategy,

    pub servers: Vec<ServerConfig>,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub affinity: Option<AffinityConfig>,

    #[serde(default)]
    pub failover: Option<FailoverConfig>,

    /// TLS client settings for https servers.
    #[serde(default)]
    pub tls: Option<TlsClientConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    Random,
    Hash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub scheme: Scheme,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Active health checking. Probes run per server on a fixed interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    #[serde(rename = "type", default)]
    pub probe: ProbeKind,

    /// Probe path for http probes.
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default = "default_hc_interval")]
    pub interval_ms: u64,

    #[serde(default = "default_hc_timeout")]
    pub timeout_ms: u64,

    /// Consecutive probe successes before an Unhealthy server is reinstated.
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,

    /// Consecutive probe failures before a Healthy server is taken out.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Expected status for http probes.
    #[serde(default = "default_expect_status")]
    pub expect_status: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe: ProbeKind::Tcp,
            path: None,
            interval_ms: default_hc_interval(),
            timeout_ms: default_hc_timeout(),
            healthy_threshold: default_healthy_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
            expect_status: default_expect_status(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    #[default]
    Tcp,
    Http,
}

/// Session affinity: a deterministic request key pins a client to one
/// server while the mapping lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AffinityConfig {
    /// `cookie:<name>`, `header:<name>`, or `client_ip`.
    pub key: String,
    #[serde(default = "default_affinity_ttl")]
    pub ttl_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FailoverConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_ms: u64,

    #[serde(default)]
    pub retry_on: Vec<RetryOn>,

    /// Non-idempotent methods are only retried when this is set.
    #[serde(default)]
    pub retry_non_idempotent: bool,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            attempt_timeout_ms: default_attempt_timeout(),
            retry_on: vec![RetryOn::Connect],
            retry_non_idempotent: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryOn {
    Connect,
    Timeout,
    #[serde(rename = "5xx")]
    Status5xx,
}

/// TLS client knobs for upstream https connections. The engine itself is
/// stream-agnostic; these only configure the wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsClientConfig {
    #[serde(default)]
    pub sni: Option<String>,
    #[serde(default)]
    pub ca_bundle: Option<PathBuf>,
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_key: Option<PathBuf>,
    #[serde(default)]
    pub alpn: Vec<String>,
}

fn default_weight() -> u32 {
    1
}
fn default_hc_interval() -> u64 {
    5000
}
fn default_hc_timeout() -> u64 {
    2000
}
fn default_healthy_threshold() -> u32 {
    2
}
fn default_unhealthy_threshold() -> u32 {
    3
}
fn default_expect_status() -> u16 {
    200
}
fn default_affinity_ttl() -> u64 {
    300_000
}
fn default_max_attempts() -> u32 {
    2
}
fn default_attempt_timeout() -> u64 {
    5000
}

impl ServerConfig {
    /// Pre-formatted `host:port` address.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
