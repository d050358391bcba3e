//! Per-connection request loop: framed read, middleware request phase,
//! routing, cache, upstream dispatch, middleware response phase, framed
//! write, then keep-alive or close.

use crate::dispatch::{dispatch, DispatchParams};
use crate::pool::WorkerPool;
use crate::worker::SharedGateway;
use chrono::Utc;
use monoio::net::TcpStream;
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use torii_cache::entry::{request_cacheable, StoredResponse};
use torii_cache::{CacheKey, FlightRole, HttpCache, Lookup};
use torii_core::route::Route;
use torii_core::GatewayError;
use torii_http::engine::keep_alive;
use torii_http::{HttpError, Method, Request, Response, ServerConn};
use torii_middleware::{CacheStatus, Flow, Protocol, RequestContext};
use tracing::{debug, warn};
use uuid::Uuid;

/// Everything one worker thread owns: the cross-thread shared gateway
/// plus its thread-local connection pool.
pub struct WorkerState {
    pub shared: Arc<SharedGateway>,
    pub pool: Rc<RefCell<WorkerPool>>,
}

/// Service one client connection until close, error, or idle timeout.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Rc<WorkerState>,
) -> Result<(), HttpError> {
    let shared = Arc::clone(&state.shared);
    let mut engine = ServerConn::new(stream, shared.limits.clone());
    let keepalive_idle = Duration::from_millis(shared.config.proxy.keepalive_idle_ms);

    loop {
        let req = match monoio::time::timeout(keepalive_idle, engine.read_request()).await {
            Err(_elapsed) => break, // keep-alive idle timeout
            Ok(Ok(Some(req))) => req,
            Ok(Ok(None)) => break, // clean close between requests
            Ok(Err(e)) => {
                match &e {
                    HttpError::Malformed(_) => {
                        shared.metrics.total_errors.inc();
                        warn!(client = %peer, error = %e, "Malformed request");
                        let mut resp = GatewayError::Malformed(e.to_string()).to_response();
                        let _ = engine.write_response(&mut resp).await;
                    }
                    // a peer that vanished before sending anything is not an event
                    HttpError::PrematureClose if engine.requests_handled() == 0 => {}
                    other => debug!(client = %peer, error = %other, "Connection error"),
                }
                break;
            }
        };

        match process_request(&mut engine, req, peer, &state).await {
            Ok(true) => continue,
            Ok(false) => break,
            Err(e) => {
                debug!(client = %peer, error = %e, "Response write failed");
                break;
            }
        }
    }
    Ok(())
}

async fn process_request(
    engine: &mut ServerConn<TcpStream>,
    mut req: Request,
    peer: SocketAddr,
    state: &Rc<WorkerState>,
) -> Result<bool, HttpError> {
    let shared = &state.shared;
    let metrics = &shared.metrics;
    metrics.total_requests.inc();
    metrics.bytes_in.inc_by(req.body.len() as u64);

    // The metrics endpoint is answered by the gateway itself, before
    // middleware or routing.
    if shared.config.metrics.enabled
        && req.method == Method::Get
        && req.path() == shared.config.metrics.path
    {
        let mut resp = Response::with_body(
            200,
            "text/plain; version=0.0.4",
            metrics.gather_text().into_bytes(),
        );
        let keep = keep_alive(req.version, &req.headers, &resp);
        engine.write_response(&mut resp).await?;
        return Ok(keep);
    }

    let mut ctx = RequestContext::new(Uuid::new_v4().to_string(), peer, Protocol::Plain);
    ctx.bytes_in = req.body.len() as u64;

    let mut fatal = false;
    let mut response = match shared.chain.run_request(&mut ctx, &mut req) {
        Flow::Respond(resp) => resp,
        Flow::Fail(err) => {
            metrics.total_errors.inc();
            fatal = err.is_fatal();
            err.to_response()
        }
        Flow::Continue => {
            match shared
                .router
                .match_route(req.method, req.path(), req.headers.get("host"))
            {
                None => {
                    metrics.total_errors.inc();
                    GatewayError::NotFound.to_response()
                }
                Some(matched) => {
                    ctx.route = Some(Arc::clone(&matched.route));
                    ctx.params = matched.params;
                    ctx.upstream_id = Some(matched.route.upstream_id.clone());
                    let route = Arc::clone(&matched.route);
                    match forward(state, &mut ctx, &req, &route).await {
                        Ok(resp) => resp,
                        Err(err) => {
                            metrics.total_errors.inc();
                            fatal = fatal || err.is_fatal();
                            err.to_response()
                        }
                    }
                }
            }
        }
    };

    shared.chain.run_response(&mut ctx, &mut response);

    if let Some(status) = ctx.cache {
        response.headers.set("x-cache", status.as_str());
    }
    response.headers.set("x-request-id", ctx.request_id.clone());

    let route_label = ctx
        .route
        .as_ref()
        .map(|r| r.id.clone())
        .unwrap_or_else(|| "-".to_string());
    let written = engine.write_response(&mut response).await?;
    metrics.bytes_out.inc_by(written as u64);
    metrics
        .request_duration
        .with_label_values(&[&route_label])
        .observe(ctx.arrived_at.elapsed().as_secs_f64());

    Ok(!fatal && keep_alive(req.version, &req.headers, &response))
}

/// Steps 6–7 of the request loop: cache admission, then upstream
/// dispatch with failover.
async fn forward(
    state: &Rc<WorkerState>,
    ctx: &mut RequestContext,
    req: &Request,
    route: &Arc<Route>,
) -> Result<Response, GatewayError> {
    let shared = &state.shared;
    let cluster = shared
        .cluster(&route.upstream_id)
        .ok_or_else(|| GatewayError::Internal(format!("unknown upstream {}", route.upstream_id)))?;

    let overrides = &route.overrides;
    let request_ms = overrides
        .timeout
        .as_ref()
        .and_then(|t| t.request_ms)
        .unwrap_or(shared.config.proxy.request_timeout_ms);
    let connect_ms = overrides
        .timeout
        .as_ref()
        .and_then(|t| t.connect_ms)
        .unwrap_or(shared.config.proxy.connect_timeout_ms);

    let params = DispatchParams {
        cluster,
        failover: overrides.failover.as_ref().or(cluster.failover.as_ref()),
        connect_timeout: Duration::from_millis(connect_ms),
        write_timeout: Duration::from_millis(shared.config.proxy.write_timeout_ms),
        first_byte_timeout: Duration::from_millis(shared.config.proxy.first_byte_timeout_ms),
        deadline: ctx.arrived_at + Duration::from_millis(request_ms),
        reuse_probe_idle: Duration::from_millis(shared.config.proxy.pool.reuse_probe_idle_ms),
        limits: &shared.limits,
    };

    let upstream_req = build_upstream_request(req, ctx);

    if let Some(cache) = &shared.cache {
        if request_cacheable(req.method, &req.headers) {
            return forward_with_cache(state, cache, &params, ctx, req, &upstream_req).await;
        }
        ctx.cache = Some(CacheStatus::Bypass);
    }

    let client_ip = ctx.client_ip();
    let (resp, server_id) = dispatch(&params, &state.pool, &upstream_req, &client_ip).await?;
    ctx.server_id = Some(server_id);
    Ok(resp)
}

async fn forward_with_cache(
    state: &Rc<WorkerState>,
    cache: &HttpCache,
    params: &DispatchParams<'_>,
    ctx: &mut RequestContext,
    req: &Request,
    upstream_req: &Request,
) -> Result<Response, GatewayError> {
    let metrics = &state.shared.metrics;
    let client_ip = ctx.client_ip();
    let key = CacheKey {
        method: req.method,
        scheme: ctx.protocol.scheme(),
        host: req.headers.get("host").unwrap_or(""),
        path: req.path(),
        query: req.query(),
    };
    let fp = cache.fingerprint_for(&key, &req.headers);

    match cache.lookup(fp, Instant::now()) {
        Lookup::Fresh { response, age_secs } => {
            metrics.cache_hits.inc();
            ctx.cache = Some(CacheStatus::Hit);
            Ok(response.to_response(age_secs))
        }

        Lookup::Stale { etag, last_modified } => {
            // conditional revalidation against the origin
            let mut conditional = upstream_req.clone();
            if let Some(etag) = etag {
                conditional.headers.set("if-none-match", etag);
            }
            if let Some(lm) = last_modified {
                conditional.headers.set("if-modified-since", lm);
            }
            let (resp, server_id) = dispatch(params, &state.pool, &conditional, &client_ip).await?;
            ctx.server_id = Some(server_id);

            if resp.status == 304 {
                if let Some(stored) =
                    cache.refresh(fp, &resp.headers, Instant::now(), Utc::now())
                {
                    metrics.cache_hits.inc();
                    ctx.cache = Some(CacheStatus::Revalidated);
                    return Ok(stored.to_response(0));
                }
                // entry swept since lookup; fall back to a full fetch
                let (resp, server_id) =
                    dispatch(params, &state.pool, upstream_req, &client_ip).await?;
                ctx.server_id = Some(server_id);
                store_response(state, cache, &key, req, &resp);
                metrics.cache_misses.inc();
                ctx.cache = Some(CacheStatus::Miss);
                return Ok(resp);
            }
            if resp.status == 200 {
                store_response(state, cache, &key, req, &resp);
                metrics.cache_misses.inc();
                ctx.cache = Some(CacheStatus::Miss);
                return Ok(resp);
            }
            // any other status surfaces without touching the entry
            ctx.cache = Some(CacheStatus::Bypass);
            Ok(resp)
        }

        Lookup::Miss => match cache.begin_fetch(fp) {
            FlightRole::Leader(guard) => {
                match dispatch(params, &state.pool, upstream_req, &client_ip).await {
                    Ok((resp, server_id)) => {
                        ctx.server_id = Some(server_id);
                        guard.complete(Ok(Arc::new(StoredResponse::snapshot(&resp))));
                        store_response(state, cache, &key, req, &resp);
                        metrics.cache_misses.inc();
                        ctx.cache = Some(CacheStatus::Miss);
                        Ok(resp)
                    }
                    Err(err) => {
                        guard.complete(Err(err.to_string()));
                        Err(err)
                    }
                }
            }
            FlightRole::Waiter(rx) => match rx.await {
                Ok(Ok(stored)) => {
                    metrics.cache_hits.inc();
                    ctx.cache = Some(CacheStatus::Hit);
                    Ok(stored.to_response(0))
                }
                Ok(Err(message)) => Err(GatewayError::UpstreamConnect(message)),
                Err(_) => Err(GatewayError::Internal("cache flight abandoned".into())),
            },
        },
    }
}

fn store_response(
    state: &Rc<WorkerState>,
    cache: &HttpCache,
    key: &CacheKey<'_>,
    req: &Request,
    resp: &Response,
) {
    let tags = resp
        .headers
        .get("x-cache-tags")
        .map(|v| v.split(',').map(|t| t.trim().to_string()).collect())
        .unwrap_or_default();
    if let torii_cache::store::InsertOutcome::Stored { evicted } =
        cache.try_insert(key, &req.headers, resp, tags, Instant::now(), Utc::now())
    {
        let metrics = &state.shared.metrics;
        metrics.cache_evictions.inc_by(evicted as u64);
        metrics.cache_bytes.set(cache.stats().total_bytes as i64);
    }
}

/// Clone the client request into its upstream form: hop-by-hop headers
/// stripped, forwarding identity attached.
pub fn build_upstream_request(req: &Request, ctx: &RequestContext) -> Request {
    let mut out = req.clone();
    for name in [
        "connection",
        "keep-alive",
        "proxy-connection",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "upgrade",
    ] {
        out.headers.remove(name);
    }
    out.headers.set("connection", "keep-alive");

    let client_ip = ctx.client_ip();
    let xff = match out.headers.get("x-forwarded-for") {
        Some(prev) => format!("{prev}, {client_ip}"),
        None => client_ip,
    };
    out.headers.set("x-forwarded-for", xff);
    out.headers.set("x-forwarded-proto", ctx.protocol.scheme());
    out.headers.set("x-request-id", ctx.request_id.clone());

    if !out.body.is_empty() && !out.headers.contains("content-length") {
        let mut itoa_buf = itoa::Buffer::new();
        out.headers.set("content-length", itoa_buf.format(out.body.len()));
    }
    out
}
