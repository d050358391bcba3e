//! Upstream dispatch: pick a server, acquire a pooled connection, run the
//! exchange under per-stage deadlines, and fail over across distinct
//! servers on retryable errors.

use crate::cluster::UpstreamCluster;
use crate::pool::{self, PoolKey, UpstreamConn, WorkerPool};
use crate::server::UpstreamServer;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use torii_core::upstream::{FailoverConfig, RetryOn};
use torii_core::GatewayError;
use torii_http::engine::response_reusable;
use torii_http::{HttpError, Limits, Request, Response};
use tracing::{debug, warn};

pub struct DispatchParams<'a> {
    pub cluster: &'a UpstreamCluster,
    pub failover: Option<&'a FailoverConfig>,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    /// Cap on the response-read stage of any single attempt.
    pub first_byte_timeout: Duration,
    /// Global per-request deadline; every stage is clamped to it.
    pub deadline: Instant,
    /// Pooled connections idle for less than this are trusted as live; a
    /// write failure on one counts as a real reset instead of earning a
    /// silent redial.
    pub reuse_probe_idle: Duration,
    pub limits: &'a Limits,
}

impl DispatchParams<'_> {
    /// Read budget for one attempt: the first-byte timeout and (when
    /// failover is configured) the per-attempt timeout, clamped to the
    /// time left before the global deadline.
    fn attempt_budget(&self, now: Instant) -> Duration {
        let remaining = self.deadline.saturating_duration_since(now);
        let capped = remaining.min(self.first_byte_timeout);
        match self.failover {
            Some(f) => capped.min(Duration::from_millis(f.attempt_timeout_ms)),
            None => capped,
        }
    }
}

/// Whether `err` belongs to a retry class the failover config opted into.
pub(crate) fn retryable_class(err: &GatewayError, retry_on: &[RetryOn]) -> bool {
    match err {
        GatewayError::UpstreamConnect(_)
        | GatewayError::UpstreamReset(_)
        | GatewayError::PoolExhausted => retry_on.contains(&RetryOn::Connect),
        GatewayError::UpstreamTimeout => retry_on.contains(&RetryOn::Timeout),
        _ => false,
    }
}

/// Exchange `req` with the cluster. Retries (on distinct servers) are
/// bounded by `max_attempts`, the per-attempt timeout, and the global
/// deadline; outcomes feed each server's failure tracking.
pub async fn dispatch(
    params: &DispatchParams<'_>,
    pool: &Rc<RefCell<WorkerPool>>,
    req: &Request,
    client_ip: &str,
) -> Result<(Response, String), GatewayError> {
    let max_attempts = params.failover.map(|f| f.max_attempts.max(1)).unwrap_or(1);
    let retry_on: &[RetryOn] = params.failover.map(|f| f.retry_on.as_slice()).unwrap_or(&[]);
    let method_retryable = req.method.is_idempotent()
        || params.failover.map(|f| f.retry_non_idempotent).unwrap_or(false);

    let mut tried: Vec<String> = Vec::new();
    let mut last_err: Option<GatewayError> = None;

    for attempt in 0..max_attempts {
        let now = Instant::now();
        if now >= params.deadline {
            return Err(last_err.take().unwrap_or(GatewayError::UpstreamTimeout));
        }

        let server = if tried.is_empty() {
            params.cluster.pick(req, client_ip, now)
        } else {
            params.cluster.pick_excluding(&tried, client_ip)
        };
        let Some(server) = server else {
            return Err(last_err
                .take()
                .unwrap_or_else(|| GatewayError::UpstreamConnect("no healthy upstream".into())));
        };
        tried.push(server.id.clone());

        server.inc_in_flight();
        let result = attempt_exchange(params, pool, req, &server).await;
        server.dec_in_flight();

        match result {
            Ok(resp) => {
                if resp.status >= 500 {
                    server.record_failure();
                    if retry_on.contains(&RetryOn::Status5xx)
                        && method_retryable
                        && attempt + 1 < max_attempts
                    {
                        debug!(server = %server.id, status = resp.status,
                               "Retrying 5xx on another server");
                        last_err = Some(GatewayError::UpstreamReset(format!(
                            "upstream returned {}",
                            resp.status
                        )));
                        continue;
                    }
                } else {
                    server.record_success();
                }
                return Ok((resp, server.id.clone()));
            }
            Err(err) => {
                server.record_failure();
                if retryable_class(&err, retry_on) && method_retryable && attempt + 1 < max_attempts
                {
                    warn!(server = %server.id, error = %err, "Upstream attempt failed, failing over");
                    last_err = Some(err);
                    continue;
                }
                return Err(err);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| GatewayError::UpstreamConnect("no attempts possible".into())))
}

/// One attempt against one server: acquire, write (with a single fresh
/// retry when a pooled connection turns out stale), read. A timed-out or
/// broken connection is closed, never returned to the pool.
async fn attempt_exchange(
    params: &DispatchParams<'_>,
    pool: &Rc<RefCell<WorkerPool>>,
    req: &Request,
    server: &Arc<UpstreamServer>,
) -> Result<Response, GatewayError> {
    let key = PoolKey::from_server(server);
    let mut conn: UpstreamConn =
        pool::acquire(pool, &key, params.connect_timeout, params.limits).await?;

    let mut stale_retry_left = conn.use_count > 0
        && Instant::now().duration_since(conn.last_used) >= params.reuse_probe_idle;
    loop {
        match monoio::time::timeout(params.write_timeout, conn.conn.write_request(req)).await {
            Ok(Ok(())) => break,
            Ok(Err(e)) => {
                drop(conn);
                pool.borrow_mut().forfeit(&key);
                if stale_retry_left {
                    // pooled connection died between uses; one fresh dial
                    debug!(key = %key.label(), error = %e, "Stale pooled connection, redialling");
                    conn = pool::acquire(pool, &key, params.connect_timeout, params.limits).await?;
                    stale_retry_left = false;
                    continue;
                }
                return Err(GatewayError::UpstreamReset(e.to_string()));
            }
            Err(_elapsed) => {
                drop(conn);
                pool.borrow_mut().forfeit(&key);
                return Err(GatewayError::UpstreamTimeout);
            }
        }
    }

    let budget = params.attempt_budget(Instant::now());
    if budget.is_zero() {
        drop(conn);
        pool.borrow_mut().forfeit(&key);
        return Err(GatewayError::UpstreamTimeout);
    }
    match monoio::time::timeout(budget, conn.conn.read_response(req.method)).await {
        Ok(Ok(resp)) => {
            let reusable = response_reusable(&resp);
            pool.borrow_mut().release(conn, reusable, Instant::now());
            Ok(resp)
        }
        Ok(Err(e)) => {
            drop(conn);
            pool.borrow_mut().forfeit(&key);
            Err(match e {
                HttpError::PrematureClose => {
                    GatewayError::UpstreamReset("connection closed before response".into())
                }
                other => GatewayError::UpstreamReset(other.to_string()),
            })
        }
        Err(_elapsed) => {
            drop(conn);
            pool.borrow_mut().forfeit(&key);
            Err(GatewayError::UpstreamTimeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_class_covers_dial_reset_and_pool() {
        let on = [RetryOn::Connect];
        assert!(retryable_class(&GatewayError::UpstreamConnect("refused".into()), &on));
        assert!(retryable_class(&GatewayError::UpstreamReset("rst".into()), &on));
        assert!(retryable_class(&GatewayError::PoolExhausted, &on));
        assert!(!retryable_class(&GatewayError::UpstreamTimeout, &on));
    }

    #[test]
    fn timeout_class_is_separate() {
        let on = [RetryOn::Timeout];
        assert!(retryable_class(&GatewayError::UpstreamTimeout, &on));
        assert!(!retryable_class(&GatewayError::UpstreamConnect("refused".into()), &on));
    }

    #[test]
    fn nothing_retries_without_opt_in() {
        assert!(!retryable_class(&GatewayError::UpstreamConnect("refused".into()), &[]));
        assert!(!retryable_class(&GatewayError::UpstreamTimeout, &[]));
    }

    #[test]
    fn non_upstream_kinds_never_retry() {
        let all = [RetryOn::Connect, RetryOn::Timeout, RetryOn::Status5xx];
        assert!(!retryable_class(&GatewayError::NotFound, &all));
        assert!(!retryable_class(&GatewayError::Internal("x".into()), &all));
    }

    #[test]
    fn attempt_budget_takes_the_tightest_bound() {
        let cluster_cfg: torii_core::upstream::UpstreamConfig =
            serde_json::from_value(serde_json::json!({
                "id": "backend",
                "servers": [{ "id": "a", "host": "10.0.0.1", "port": 80 }]
            }))
            .unwrap();
        let cluster = UpstreamCluster::build(&cluster_cfg).unwrap();
        let failover: FailoverConfig =
            serde_json::from_value(serde_json::json!({ "attempt_timeout_ms": 2000 })).unwrap();
        let limits = Limits::default();
        let now = Instant::now();

        let mut params = DispatchParams {
            cluster: &cluster,
            failover: Some(&failover),
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            first_byte_timeout: Duration::from_secs(15),
            deadline: now + Duration::from_secs(30),
            reuse_probe_idle: Duration::from_secs(2),
            limits: &limits,
        };
        // attempt timeout (2s) is the tightest
        assert_eq!(params.attempt_budget(now), Duration::from_secs(2));

        // near the global deadline, the remainder wins
        assert_eq!(
            params.attempt_budget(now + Duration::from_millis(29_500)),
            Duration::from_millis(500)
        );
        assert_eq!(params.attempt_budget(now + Duration::from_secs(31)), Duration::ZERO);

        // without failover, the first-byte cap bounds the read
        params.failover = None;
        assert_eq!(params.attempt_budget(now), Duration::from_secs(15));
    }
}
