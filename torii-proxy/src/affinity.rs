//! Session affinity: a deterministic request key (cookie, header, or
//! client IP) maps to a server id with a TTL; unhealthy targets are
//! remapped through the base strategy.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use torii_http::Request;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AffinityKey {
    Cookie(String),
    Header(String),
    ClientIp,
}

impl AffinityKey {
    /// Parse the config form: `cookie:<name>`, `header:<name>`, `client_ip`.
    pub fn parse(s: &str) -> Option<AffinityKey> {
        if s == "client_ip" {
            return Some(AffinityKey::ClientIp);
        }
        if let Some(name) = s.strip_prefix("cookie:") {
            if !name.is_empty() {
                return Some(AffinityKey::Cookie(name.to_string()));
            }
        }
        if let Some(name) = s.strip_prefix("header:") {
            if !name.is_empty() {
                return Some(AffinityKey::Header(name.to_string()));
            }
        }
        None
    }

    /// The affinity value for this request, if present.
    pub fn extract(&self, req: &Request, client_ip: &str) -> Option<String> {
        match self {
            AffinityKey::ClientIp => Some(client_ip.to_string()),
            AffinityKey::Header(name) => req.headers.get(name).map(str::to_string),
            AffinityKey::Cookie(name) => {
                for value in req.headers.get_all("cookie") {
                    for pair in value.split(';') {
                        if let Some((k, v)) = pair.trim().split_once('=') {
                            if k == name {
                                return Some(v.to_string());
                            }
                        }
                    }
                }
                None
            }
        }
    }
}

struct Binding {
    server_id: String,
    expires_at: Instant,
}

/// Key → server bindings with TTL. Shared across workers.
pub struct AffinityTable {
    bindings: DashMap<String, Binding>,
    ttl: Duration,
}

impl AffinityTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            bindings: DashMap::new(),
            ttl,
        }
    }

    pub fn lookup(&self, key: &str, now: Instant) -> Option<String> {
        let binding = self.bindings.get(key)?;
        if now < binding.expires_at {
            Some(binding.server_id.clone())
        } else {
            None
        }
    }

    /// Bind (or rebind) a key; the TTL restarts.
    pub fn bind(&self, key: &str, server_id: &str, now: Instant) {
        self.bindings.insert(
            key.to_string(),
            Binding {
                server_id: server_id.to_string(),
                expires_at: now + self.ttl,
            },
        );
    }

    pub fn sweep(&self, now: Instant) {
        self.bindings.retain(|_, b| now < b.expires_at);
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
