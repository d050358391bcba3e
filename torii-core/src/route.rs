use crate::upstream::{AffinityConfig, FailoverConfig};
use serde::{Deserialize, Serialize};
use torii_http::Method;

/// Route definition as it appears in config. Unknown keys are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    pub id: String,

    /// Path pattern: exact (`/foo/bar`), prefix (`/foo/*`), or
    /// parameterized (`/foo/:id/bar`, `/files/*rest`).
    pub pattern: String,

    /// Host predicate: exact (`api.example.com`) or wildcard
    /// (`*.example.com`). Absent = any host.
    #[serde(default)]
    pub host: Option<String>,

    /// Allowed methods. Empty = all methods.
    #[serde(default)]
    pub methods: Vec<String>,

    /// Upstream cluster reference.
    pub upstream: String,

    /// Matching priority; higher wins, ties by config order.
    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub overrides: Option<RouteOverrides>,
}

/// Per-route overrides of the cluster's policies.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RouteOverrides {
    #[serde(default)]
    pub affinity: Option<AffinityConfig>,

    #[serde(default)]
    pub failover: Option<FailoverConfig>,

    #[serde(default)]
    pub timeout: Option<TimeoutOverrides>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TimeoutOverrides {
    #[serde(default)]
    pub connect_ms: Option<u64>,
    #[serde(default)]
    pub request_ms: Option<u64>,
}

/// A compiled route: methods parsed, host predicate split into exact and
/// wildcard-suffix forms so the hot path never re-parses strings.
#[derive(Debug, Clone)]
pub struct Route {
    pub id: String,
    pub pattern: String,
    pub methods: Vec<Method>,
    pub host: HostPredicate,
    pub upstream_id: String,
    pub priority: i32,
    pub overrides: RouteOverrides,
}

impl Route {
    pub fn compile(cfg: &RouteConfig) -> anyhow::Result<Route> {
        let mut methods = Vec::with_capacity(cfg.methods.len());
        for m in &cfg.methods {
            let method = Method::parse(m)
                .ok_or_else(|| anyhow::anyhow!("route {}: unknown method {m:?}", cfg.id))?;
            methods.push(method);
        }
        Ok(Route {
            id: cfg.id.clone(),
            pattern: cfg.pattern.clone(),
            methods,
            host: HostPredicate::parse(cfg.host.as_deref()),
            upstream_id: cfg.upstream.clone(),
            priority: cfg.priority,
            overrides: cfg.overrides.clone().unwrap_or_default(),
        })
    }

    pub fn method_allowed(&self, method: Method) -> bool {
        self.methods.is_empty() || self.methods.contains(&method)
    }
}

/// Host predicate, pre-split so matching is a string compare.
#[derive(Debug, Clone, Default)]
pub struct HostPredicate {
    exact: Option<String>,
    wildcard_suffix: Option<String>,
}

impl HostPredicate {
    fn parse(host: Option<&str>) -> Self {
        match host {
            None => Self::default(),
            Some(h) if h.starts_with('*') => Self {
                exact: None,
                wildcard_suffix: Some(h[1..].to_string()),
            },
            Some(h) => Self {
                exact: Some(h.to_string()),
                wildcard_suffix: None,
            },
        }
    }

    pub fn is_any(&self) -> bool {
        self.exact.is_none() && self.wildcard_suffix.is_none()
    }

    /// Check the request `host` header value (port stripped) against the
    /// predicate. A constrained route never matches a host-less request.
    pub fn matches(&self, request_host: Option<&str>) -> bool {
        if self.is_any() {
            return true;
        }
        let Some(host) = request_host else {
            return false;
        };
        let host = host.split(':').next().unwrap_or(host);
        if let Some(exact) = &self.exact {
            return exact.eq_ignore_ascii_case(host);
        }
        if let Some(suffix) = &self.wildcard_suffix {
            return host.len() > suffix.len()
                && host[host.len() - suffix.len()..].eq_ignore_ascii_case(suffix);
        }
        false
    }
}
