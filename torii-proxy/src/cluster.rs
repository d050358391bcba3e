//! An upstream cluster: its servers, balancing strategy, affinity table
//! and failover policy, resolved from config at startup.

use crate::affinity::{AffinityKey, AffinityTable};
use crate::balance::Balancer;
use crate::server::UpstreamServer;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use torii_core::upstream::{FailoverConfig, HealthConfig, Strategy, TlsClientConfig, UpstreamConfig};
use torii_http::Request;

pub struct UpstreamCluster {
    pub id: String,
    pub servers: Vec<Arc<UpstreamServer>>,
    pub health: HealthConfig,
    pub failover: Option<FailoverConfig>,
    pub tls: Option<TlsClientConfig>,
    strategy: Strategy,
    balancer: Balancer,
    affinity: Option<(AffinityKey, AffinityTable)>,
}

impl UpstreamCluster {
    pub fn build(cfg: &UpstreamConfig) -> anyhow::Result<UpstreamCluster> {
        let servers: Vec<Arc<UpstreamServer>> = cfg
            .servers
            .iter()
            .map(|s| Arc::new(UpstreamServer::new(s, &cfg.health)))
            .collect();
        let balancer = Balancer::new(cfg.strategy, &servers);
        let affinity = match &cfg.affinity {
            Some(aff) => {
                let key = AffinityKey::parse(&aff.key).ok_or_else(|| {
                    anyhow::anyhow!("upstream {}: invalid affinity key {:?}", cfg.id, aff.key)
                })?;
                let table = AffinityTable::new(Duration::from_millis(aff.ttl_ms));
                Some((key, table))
            }
            None => None,
        };
        Ok(UpstreamCluster {
            id: cfg.id.clone(),
            servers,
            health: cfg.health.clone(),
            failover: cfg.failover.clone(),
            tls: cfg.tls.clone(),
            strategy: cfg.strategy,
            balancer,
            affinity,
        })
    }

    /// The Healthy subset, in config order.
    pub fn healthy(&self) -> Vec<Arc<UpstreamServer>> {
        self.servers
            .iter()
            .filter(|s| s.is_healthy())
            .cloned()
            .collect()
    }

    pub fn server_by_id(&self, id: &str) -> Option<&Arc<UpstreamServer>> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// Select a server for this request: affinity binding when configured
    /// and still healthy, otherwise the base strategy (which also creates
    /// or replaces the binding).
    pub fn pick(
        &self,
        req: &Request,
        client_ip: &str,
        now: Instant,
    ) -> Option<Arc<UpstreamServer>> {
        let key = self.hash_key(client_ip);
        if let Some((affinity_key, table)) = &self.affinity {
            if let Some(raw) = affinity_key.extract(req, client_ip) {
                if let Some(server_id) = table.lookup(&raw, now) {
                    if let Some(server) = self.server_by_id(&server_id) {
                        if server.is_healthy() {
                            return Some(Arc::clone(server));
                        }
                    }
                }
                let picked = self.balancer.pick(&self.healthy(), key)?;
                table.bind(&raw, &picked.id, now);
                return Some(picked);
            }
        }
        self.balancer.pick(&self.healthy(), key)
    }

    /// Select avoiding already-tried servers (failover retries go to
    /// distinct servers).
    pub fn pick_excluding(
        &self,
        exclude: &[String],
        client_ip: &str,
    ) -> Option<Arc<UpstreamServer>> {
        let candidates: Vec<Arc<UpstreamServer>> = self
            .servers
            .iter()
            .filter(|s| s.is_healthy() && !exclude.iter().any(|e| e == &s.id))
            .cloned()
            .collect();
        self.balancer.pick(&candidates, self.hash_key(client_ip))
    }

    pub fn sweep_affinity(&self, now: Instant) {
        if let Some((_, table)) = &self.affinity {
            table.sweep(now);
        }
    }

    fn hash_key(&self, client_ip: &str) -> Option<u64> {
        if self.strategy != Strategy::Hash {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        client_ip.hash(&mut hasher);
        Some(hasher.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::HealthState;
    use torii_http::Method;

    fn cluster(json: serde_json::Value) -> UpstreamCluster {
        let cfg: UpstreamConfig = serde_json::from_value(json).unwrap();
        UpstreamCluster::build(&cfg).unwrap()
    }

    fn two_server_cluster(affinity: Option<serde_json::Value>) -> UpstreamCluster {
        let mut cfg = serde_json::json!({
            "id": "backend",
            "servers": [
                { "id": "a", "host": "10.0.0.1", "port": 80 },
                { "id": "b", "host": "10.0.0.2", "port": 80 }
            ]
        });
        if let Some(aff) = affinity {
            cfg["affinity"] = aff;
        }
        cluster(cfg)
    }

    fn req() -> Request {
        Request::new(Method::Get, "/")
    }

    #[test]
    fn only_healthy_servers_are_picked() {
        let c = two_server_cluster(None);
        c.servers[0].set_health(HealthState::Unhealthy);
        for _ in 0..10 {
            assert_eq!(c.pick(&req(), "1.1.1.1", Instant::now()).unwrap().id, "b");
        }
    }

    #[test]
    fn no_healthy_servers_picks_none() {
        let c = two_server_cluster(None);
        c.servers[0].set_health(HealthState::Unhealthy);
        c.servers[1].set_health(HealthState::Draining);
        assert!(c.pick(&req(), "1.1.1.1", Instant::now()).is_none());
    }

    #[test]
    fn affinity_sticks_to_one_server() {
        let c = two_server_cluster(Some(serde_json::json!({
            "key": "header:x-user", "ttl_ms": 60000
        })));
        let mut r = req();
        r.headers.set("x-user", "u1");
        let now = Instant::now();
        let first = c.pick(&r, "1.1.1.1", now).unwrap().id.clone();
        for _ in 0..10 {
            assert_eq!(c.pick(&r, "1.1.1.1", now).unwrap().id, first);
        }
    }

    #[test]
    fn affinity_remaps_when_bound_server_unhealthy() {
        let c = two_server_cluster(Some(serde_json::json!({
            "key": "header:x-user", "ttl_ms": 60000
        })));
        let mut r = req();
        r.headers.set("x-user", "u1");
        let now = Instant::now();
        let first = c.pick(&r, "1.1.1.1", now).unwrap();
        first.set_health(HealthState::Unhealthy);

        let second = c.pick(&r, "1.1.1.1", now).unwrap();
        assert_ne!(second.id, first.id);
        // the new binding sticks even after the old server recovers
        first.set_health(HealthState::Healthy);
        assert_eq!(c.pick(&r, "1.1.1.1", now).unwrap().id, second.id);
    }

    #[test]
    fn requests_without_affinity_value_use_base_strategy() {
        let c = two_server_cluster(Some(serde_json::json!({
            "key": "cookie:session", "ttl_ms": 60000
        })));
        // no cookie header: round-robin alternates
        let now = Instant::now();
        let first = c.pick(&req(), "1.1.1.1", now).unwrap().id.clone();
        let second = c.pick(&req(), "1.1.1.1", now).unwrap().id.clone();
        assert_ne!(first, second);
    }

    #[test]
    fn pick_excluding_skips_tried_servers() {
        let c = two_server_cluster(None);
        let picked = c.pick_excluding(&["a".to_string()], "1.1.1.1").unwrap();
        assert_eq!(picked.id, "b");
        assert!(c
            .pick_excluding(&["a".to_string(), "b".to_string()], "1.1.1.1")
            .is_none());
    }

    #[test]
    fn hash_strategy_pins_by_client_ip() {
        let c = cluster(serde_json::json!({
            "id": "backend",
            "strategy": "hash",
            "servers": [
                { "id": "a", "host": "10.0.0.1", "port": 80 },
                { "id": "b", "host": "10.0.0.2", "port": 80 },
                { "id": "c", "host": "10.0.0.3", "port": 80 }
            ]
        }));
        let now = Instant::now();
        let first = c.pick(&req(), "9.9.9.9", now).unwrap().id.clone();
        for _ in 0..10 {
            assert_eq!(c.pick(&req(), "9.9.9.9", now).unwrap().id, first);
        }
    }

    #[test]
    fn bad_affinity_key_fails_build() {
        let cfg: UpstreamConfig = serde_json::from_value(serde_json::json!({
            "id": "backend",
            "servers": [{ "id": "a", "host": "h", "port": 80 }],
            "affinity": { "key": "nonsense" }
        }))
        .unwrap();
        assert!(UpstreamCluster::build(&cfg).is_err());
    }
}
