//! Single-flight coordination: per fingerprint, at most one concurrent
//! origin fetch; everyone else waits for the leader's outcome.

use crate::entry::StoredResponse;
use crate::fingerprint::Fingerprint;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// What the leader hands to its waiters. Failures are delivered verbatim;
/// nothing is negatively cached.
pub type FlightResult = Result<Arc<StoredResponse>, String>;

pub enum FlightRole {
    /// This task performs the origin fetch and must call
    /// `FlightGuard::complete` (dropping the guard delivers a failure).
    Leader(FlightGuard),
    /// Another task is already fetching; await its outcome.
    Waiter(oneshot::Receiver<FlightResult>),
}

type InflightMap = Mutex<HashMap<Fingerprint, Vec<oneshot::Sender<FlightResult>>>>;

#[derive(Default)]
pub struct SingleFlight {
    inflight: Arc<InflightMap>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join or start the flight for `fp`.
    pub fn begin(&self, fp: Fingerprint) -> FlightRole {
        let mut inflight = self.inflight.lock().unwrap();
        if let Some(waiters) = inflight.get_mut(&fp) {
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            return FlightRole::Waiter(rx);
        }
        inflight.insert(fp, Vec::new());
        FlightRole::Leader(FlightGuard {
            inflight: Arc::clone(&self.inflight),
            fp,
            done: false,
        })
    }
}

pub struct FlightGuard {
    inflight: Arc<InflightMap>,
    fp: Fingerprint,
    done: bool,
}

impl FlightGuard {
    /// Deliver the fetch outcome to every waiter and close the flight.
    pub fn complete(mut self, outcome: FlightResult) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: FlightResult) {
        if self.done {
            return;
        }
        self.done = true;
        let waiters = self
            .inflight
            .lock()
            .unwrap()
            .remove(&self.fp)
            .unwrap_or_default();
        for waiter in waiters {
            // A waiter that gave up (deadline, disconnect) is fine to skip.
            let _ = waiter.send(outcome.clone());
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.finish(Err("origin fetch abandoned".to_string()));
    }
}
