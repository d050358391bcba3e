use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use torii_core::route::Route;

/// Listener protocol the request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Plain,
    Tls,
}

impl Protocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Plain => "http",
            Protocol::Tls => "https",
        }
    }
}

/// Authenticated identity placed in the context by the auth middleware.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: String,
    pub roles: Vec<String>,
}

/// How the cache participated in this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Bypass,
    Hit,
    Miss,
    Revalidated,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Bypass => "BYPASS",
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Revalidated => "REVALIDATED",
        }
    }
}

/// Per-request state threaded through the middleware chain and the
/// dispatch path. Owned exclusively by the request task; created when the
/// request head is accepted, dropped after the response phase completes.
pub struct RequestContext {
    pub request_id: String,
    pub client_addr: SocketAddr,
    pub arrived_at: Instant,
    pub protocol: Protocol,

    /// Mutable scratch shared between middlewares.
    pub vars: HashMap<String, Value>,

    pub principal: Option<Principal>,

    /// Selected route and its extracted path parameters.
    pub route: Option<Arc<Route>>,
    pub params: Vec<(String, String)>,

    /// Selected upstream cluster / server, once dispatch picked them.
    pub upstream_id: Option<String>,
    pub server_id: Option<String>,

    pub cache: Option<CacheStatus>,

    pub bytes_in: u64,
}

impl RequestContext {
    pub fn new(request_id: String, client_addr: SocketAddr, protocol: Protocol) -> Self {
        Self {
            request_id,
            client_addr,
            arrived_at: Instant::now(),
            protocol,
            vars: HashMap::new(),
            principal: None,
            route: None,
            params: Vec::new(),
            upstream_id: None,
            server_id: None,
            cache: None,
            bytes_in: 0,
        }
    }

    pub fn client_ip(&self) -> String {
        self.client_addr.ip().to_string()
    }

    pub fn set_var(&mut self, key: impl Into<String>, value: Value) {
        self.vars.insert(key.into(), value);
    }

    pub fn get_var(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.arrived_at.elapsed().as_secs_f64() * 1000.0
    }

    /// Extracted path parameter by name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::new(
            "req-1".into(),
            "10.1.2.3:55555".parse().unwrap(),
            Protocol::Plain,
        )
    }

    #[test]
    fn client_ip_drops_port() {
        assert_eq!(ctx().client_ip(), "10.1.2.3");
    }

    #[test]
    fn vars_roundtrip() {
        let mut c = ctx();
        c.set_var("cors.origin", Value::String("https://a.test".into()));
        assert_eq!(
            c.get_var("cors.origin").and_then(|v| v.as_str()),
            Some("https://a.test")
        );
        assert!(c.get_var("missing").is_none());
    }

    #[test]
    fn param_lookup() {
        let mut c = ctx();
        c.params = vec![("id".into(), "42".into())];
        assert_eq!(c.param("id"), Some("42"));
        assert_eq!(c.param("other"), None);
    }

    #[test]
    fn protocol_scheme() {
        assert_eq!(Protocol::Plain.scheme(), "http");
        assert_eq!(Protocol::Tls.scheme(), "https");
    }
}
