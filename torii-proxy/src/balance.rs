//! Load-balancing strategies over the Healthy subset of a cluster.
//! Strategy state is owned by the balancer; tie-breaks are fixed so pick
//! sequences are deterministic.

use crate::server::UpstreamServer;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use torii_core::upstream::Strategy;

/// Strategy-tagged balancer. `pick` receives the candidate slice (already
/// filtered to Healthy, possibly minus servers excluded by failover) and
/// an optional hash key for the `hash` strategy.
pub enum Balancer {
    RoundRobin { next: AtomicUsize },
    WeightedRoundRobin { state: Mutex<WrrState> },
    LeastConnections,
    Random,
    Hash,
}

/// Smooth weighted round-robin: per pick, every candidate gains its
/// weight, the largest current weight wins and pays back the total. Over
/// any window of Σweight picks each server is chosen weight times.
pub struct WrrState {
    /// Current weight per server id (ids are stable; candidate slices
    /// change as health flips).
    current: Vec<(String, i64)>,
}

impl Balancer {
    pub fn new(strategy: Strategy, servers: &[Arc<UpstreamServer>]) -> Balancer {
        match strategy {
            Strategy::RoundRobin => Balancer::RoundRobin {
                next: AtomicUsize::new(0),
            },
            Strategy::WeightedRoundRobin => Balancer::WeightedRoundRobin {
                state: Mutex::new(WrrState {
                    current: servers.iter().map(|s| (s.id.clone(), 0)).collect(),
                }),
            },
            Strategy::LeastConnections => Balancer::LeastConnections,
            Strategy::Random => Balancer::Random,
            Strategy::Hash => Balancer::Hash,
        }
    }

    pub fn pick(
        &self,
        candidates: &[Arc<UpstreamServer>],
        key: Option<u64>,
    ) -> Option<Arc<UpstreamServer>> {
        if candidates.is_empty() {
            return None;
        }
        match self {
            Balancer::RoundRobin { next } => {
                let idx = next.fetch_add(1, Ordering::Relaxed) % candidates.len();
                Some(Arc::clone(&candidates[idx]))
            }
            Balancer::WeightedRoundRobin { state } => {
                let mut state = state.lock().unwrap();
                Some(Arc::clone(state.pick(candidates)))
            }
            Balancer::LeastConnections => {
                let chosen = candidates.iter().min_by(|a, b| {
                    a.in_flight()
                        .cmp(&b.in_flight())
                        .then(b.weight.cmp(&a.weight))
                        .then(a.id.cmp(&b.id))
                })?;
                Some(Arc::clone(chosen))
            }
            Balancer::Random => {
                let idx = rand::thread_rng().gen_range(0..candidates.len());
                Some(Arc::clone(&candidates[idx]))
            }
            Balancer::Hash => {
                let idx = (key.unwrap_or(0) % candidates.len() as u64) as usize;
                Some(Arc::clone(&candidates[idx]))
            }
        }
    }
}

impl WrrState {
    fn pick<'a>(&mut self, candidates: &'a [Arc<UpstreamServer>]) -> &'a Arc<UpstreamServer> {
        let total: i64 = candidates.iter().map(|s| s.weight as i64).sum();
        let mut best: usize = 0;
        let mut best_weight = i64::MIN;
        for (i, server) in candidates.iter().enumerate() {
            let current = self.bump(&server.id, server.weight as i64);
            // strict > keeps the earliest candidate on ties
            if current > best_weight {
                best_weight = current;
                best = i;
            }
        }
        self.charge(&candidates[best].id, total);
        &candidates[best]
    }

    fn bump(&mut self, id: &str, weight: i64) -> i64 {
        match self.current.iter_mut().find(|(sid, _)| sid == id) {
            Some((_, w)) => {
                *w += weight;
                *w
            }
            None => {
                self.current.push((id.to_string(), weight));
                weight
            }
        }
    }

    fn charge(&mut self, id: &str, total: i64) {
        if let Some((_, w)) = self.current.iter_mut().find(|(sid, _)| sid == id) {
            *w -= total;
        }
    }
}
