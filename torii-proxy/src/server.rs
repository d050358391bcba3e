use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use torii_core::upstream::{HealthConfig, Scheme, ServerConfig};
use tracing::{info, warn};

const STATE_HEALTHY: u8 = 0;
const STATE_UNHEALTHY: u8 = 1;
const STATE_DRAINING: u8 = 2;

/// Passive failures older than this no longer count as consecutive.
const FAILURE_DECAY_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Draining,
}

impl HealthState {
    fn from_u8(v: u8) -> HealthState {
        match v {
            STATE_UNHEALTHY => HealthState::Unhealthy,
            STATE_DRAINING => HealthState::Draining,
            _ => HealthState::Healthy,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            HealthState::Healthy => STATE_HEALTHY,
            HealthState::Unhealthy => STATE_UNHEALTHY,
            HealthState::Draining => STATE_DRAINING,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Draining => "draining",
        }
    }
}

/// One upstream server: immutable identity plus atomically-updated health
/// state and rolling counters. Pickers read a consistent snapshot; the
/// health checker and the dispatch path feed the same consecutive
/// counters, so traffic failures and probe failures accumulate together.
pub struct UpstreamServer {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub scheme: Scheme,
    pub weight: u32,
    /// Pre-formatted `host:port`.
    pub addr: String,

    state: AtomicU8,
    in_flight: AtomicUsize,
    successes: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    last_failure_ms: AtomicU64,
    last_check_ms: AtomicU64,

    healthy_threshold: u32,
    unhealthy_threshold: u32,
}

impl UpstreamServer {
    pub fn new(cfg: &ServerConfig, health: &HealthConfig) -> Self {
        Self {
            id: cfg.id.clone(),
            host: cfg.host.clone(),
            port: cfg.port,
            scheme: cfg.scheme,
            weight: cfg.weight.max(1),
            addr: cfg.addr(),
            state: AtomicU8::new(STATE_HEALTHY),
            in_flight: AtomicUsize::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
            last_check_ms: AtomicU64::new(0),
            healthy_threshold: health.healthy_threshold.max(1),
            unhealthy_threshold: health.unhealthy_threshold.max(1),
        }
    }

    pub fn health(&self) -> HealthState {
        HealthState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_healthy(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_HEALTHY
    }

    /// Manual state change (draining for maintenance, forced recovery).
    pub fn set_health(&self, state: HealthState) {
        let prev = self.state.swap(state.as_u8(), Ordering::AcqRel);
        if prev != state.as_u8() {
            info!(server = %self.id, state = state.as_str(), "Server health set");
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn inc_in_flight(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_in_flight(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    // ── traffic outcomes (dispatch path) ─────────────────────────

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// A failed exchange. Consecutive failures within the decay window
    /// accumulate toward the unhealthy threshold, exactly like probe
    /// failures.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let now = epoch_ms();
        let last = self.last_failure_ms.swap(now, Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last) > FAILURE_DECAY_MS {
            self.consecutive_failures.store(0, Ordering::Relaxed);
        }
        self.note_failure();
    }

    // ── probe outcomes (health checker) ──────────────────────────

    pub fn probe_success(&self) {
        self.last_check_ms.store(epoch_ms(), Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let count = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
        if self.health() == HealthState::Unhealthy && count >= self.healthy_threshold {
            self.state.store(STATE_HEALTHY, Ordering::Release);
            info!(server = %self.id, successes = count, "Server reinstated");
        }
    }

    pub fn probe_failure(&self) {
        self.last_check_ms.store(epoch_ms(), Ordering::Relaxed);
        self.note_failure();
    }

    fn note_failure(&self) {
        self.consecutive_successes.store(0, Ordering::Relaxed);
        let count = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if self.health() == HealthState::Healthy && count >= self.unhealthy_threshold {
            self.state.store(STATE_UNHEALTHY, Ordering::Release);
            warn!(server = %self.id, failures = count, "Server marked unhealthy");
        }
    }

    pub fn counters(&self) -> (u64, u64) {
        (
            self.successes.load(Ordering::Relaxed),
            self.failures.load(Ordering::Relaxed),
        )
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(healthy_threshold: u32, unhealthy_threshold: u32) -> UpstreamServer {
        let cfg: ServerConfig = serde_json::from_value(serde_json::json!({
            "id": "a", "host": "10.0.0.1", "port": 8080
        }))
        .unwrap();
        let health: HealthConfig = serde_json::from_value(serde_json::json!({
            "healthy_threshold": healthy_threshold,
            "unhealthy_threshold": unhealthy_threshold
        }))
        .unwrap();
        UpstreamServer::new(&cfg, &health)
    }

    #[test]
    fn starts_healthy() {
        let s = server(2, 3);
        assert!(s.is_healthy());
        assert_eq!(s.health(), HealthState::Healthy);
    }

    #[test]
    fn unhealthy_after_threshold_consecutive_failures() {
        let s = server(2, 3);
        s.probe_failure();
        s.probe_failure();
        assert!(s.is_healthy(), "below threshold stays healthy");
        s.probe_failure();
        assert_eq!(s.health(), HealthState::Unhealthy);
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let s = server(2, 3);
        s.probe_failure();
        s.probe_failure();
        s.probe_success();
        s.probe_failure();
        s.probe_failure();
        assert!(s.is_healthy(), "streak was broken by a success");
    }

    #[test]
    fn reinstated_after_healthy_threshold() {
        let s = server(2, 1);
        s.probe_failure();
        assert_eq!(s.health(), HealthState::Unhealthy);
        s.probe_success();
        assert_eq!(s.health(), HealthState::Unhealthy, "one success is not enough");
        s.probe_success();
        assert_eq!(s.health(), HealthState::Healthy);
    }

    #[test]
    fn traffic_failures_feed_the_same_counters() {
        let s = server(2, 2);
        s.record_failure();
        s.probe_failure();
        assert_eq!(s.health(), HealthState::Unhealthy);
        let (ok, failed) = s.counters();
        assert_eq!(ok, 0);
        assert_eq!(failed, 1); // probe failures are not traffic failures
    }

    #[test]
    fn draining_only_changes_manually() {
        let s = server(1, 1);
        s.set_health(HealthState::Draining);
        s.probe_success();
        assert_eq!(s.health(), HealthState::Draining, "probe success must not undrain");
        s.probe_failure();
        assert_eq!(s.health(), HealthState::Draining, "probe failure must not undrain");
        s.set_health(HealthState::Healthy);
        assert!(s.is_healthy());
    }

    #[test]
    fn in_flight_tracks_both_directions() {
        let s = server(1, 1);
        s.inc_in_flight();
        s.inc_in_flight();
        s.dec_in_flight();
        assert_eq!(s.in_flight(), 1);
    }
}
