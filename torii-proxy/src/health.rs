//! Active health checking. One background task per cluster probes every
//! server on a fixed interval (TCP connect or HTTP GET) and drives the
//! threshold state machine on each `UpstreamServer`.

use crate::cluster::UpstreamCluster;
use crate::server::{HealthState, UpstreamServer};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, timeout};
use torii_core::upstream::{HealthConfig, ProbeKind};
use tracing::debug;

/// Spawn one checker task per cluster on the background runtime.
pub fn spawn_checkers(clusters: Vec<Arc<UpstreamCluster>>) -> Vec<tokio::task::JoinHandle<()>> {
    clusters
        .into_iter()
        .map(|cluster| tokio::spawn(run_checker(cluster)))
        .collect()
}

async fn run_checker(cluster: Arc<UpstreamCluster>) {
    let cfg = cluster.health.clone();
    let probe_timeout = Duration::from_millis(cfg.timeout_ms);
    let client = reqwest::Client::builder()
        .timeout(probe_timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new());

    let mut tick = interval(Duration::from_millis(cfg.interval_ms));
    loop {
        tick.tick().await;
        for server in &cluster.servers {
            // Draining is a manual state; probes must not touch it.
            if server.health() == HealthState::Draining {
                continue;
            }
            let healthy = probe(&client, &cfg, server, probe_timeout).await;
            debug!(cluster = %cluster.id, server = %server.id, healthy, "Probe");
            if healthy {
                server.probe_success();
            } else {
                server.probe_failure();
            }
        }
    }
}

async fn probe(
    client: &reqwest::Client,
    cfg: &HealthConfig,
    server: &UpstreamServer,
    probe_timeout: Duration,
) -> bool {
    match cfg.probe {
        ProbeKind::Tcp => {
            matches!(
                timeout(probe_timeout, tokio::net::TcpStream::connect(&server.addr)).await,
                Ok(Ok(_))
            )
        }
        ProbeKind::Http => {
            let path = cfg.path.as_deref().unwrap_or("/");
            let url = format!("{}://{}{}", server.scheme, server.addr, path);
            match client.get(&url).send().await {
                Ok(resp) => resp.status().as_u16() == cfg.expect_status,
                Err(_) => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use torii_core::upstream::UpstreamConfig;

    fn cluster_for(port: u16, probe: &str) -> Arc<UpstreamCluster> {
        let cfg: UpstreamConfig = serde_json::from_value(serde_json::json!({
            "id": "backend",
            "servers": [{ "id": "a", "host": "127.0.0.1", "port": port }],
            "health": {
                "type": probe,
                "interval_ms": 20,
                "timeout_ms": 200,
                "healthy_threshold": 1,
                "unhealthy_threshold": 1
            }
        }))
        .unwrap();
        Arc::new(UpstreamCluster::build(&cfg).unwrap())
    }

    #[tokio::test]
    async fn tcp_probe_succeeds_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // keep accepting so probes connect
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let cluster = cluster_for(port, "tcp");
        let cfg = cluster.health.clone();
        let client = reqwest::Client::new();
        assert!(probe(&client, &cfg, &cluster.servers[0], Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn tcp_probe_fails_against_closed_port() {
        // bind-then-drop guarantees a port with no listener
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let cluster = cluster_for(port, "tcp");
        let cfg = cluster.health.clone();
        let client = reqwest::Client::new();
        assert!(!probe(&client, &cfg, &cluster.servers[0], Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn checker_marks_dead_server_unhealthy() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let cluster = cluster_for(port, "tcp");
        let handle = tokio::spawn(run_checker(Arc::clone(&cluster)));
        tokio::time::sleep(Duration::from_millis(400)).await;
        handle.abort();
        assert_eq!(cluster.servers[0].health(), HealthState::Unhealthy);
    }
}
