//! Full-chain tests: the built-in middlewares assembled through the
//! registry exactly as the server does it, driven without sockets.

use std::sync::Arc;
use torii_core::config::{ConsumerConfig, MiddlewareEntry};
use torii_core::GatewayError;
use torii_http::{Method, Request, Response};
use torii_middleware::{Flow, MiddlewareChain, MiddlewareRegistry, Protocol, RequestContext};
use torii_middlewares::auth::ConsumerValidator;
use torii_observability::Metrics;

fn registry() -> MiddlewareRegistry {
    let consumers: Vec<ConsumerConfig> = serde_json::from_value(serde_json::json!([
        { "id": "alice", "roles": ["admin"], "username": "alice", "password": "pw" }
    ]))
    .unwrap();
    let mut registry = MiddlewareRegistry::new();
    torii_middlewares::register_all(
        &mut registry,
        Arc::new(ConsumerValidator::new(consumers)),
        Arc::new(Metrics::new().unwrap()),
    );
    registry
}

fn chain(entries: serde_json::Value) -> MiddlewareChain {
    let entries: Vec<MiddlewareEntry> = serde_json::from_value(entries).unwrap();
    MiddlewareChain::from_config(&registry(), &entries).unwrap()
}

fn ctx() -> RequestContext {
    RequestContext::new(
        "req-1".into(),
        "203.0.113.5:40000".parse().unwrap(),
        Protocol::Plain,
    )
}

fn get(path: &str) -> Request {
    let mut req = Request::new(Method::Get, path);
    req.headers.set("host", "x");
    req
}

// ── rate limiting through the chain (token bucket) ───────────────

#[test]
fn token_bucket_allows_burst_then_429_with_retry_after() {
    let chain = chain(serde_json::json!([
        { "name": "rate_limit",
          "config": { "algorithm": "token_bucket", "max_requests": 3, "window_ms": 3000 } }
    ]));

    for i in 0..3 {
        let flow = chain.run_request(&mut ctx(), &mut get("/x"));
        assert!(matches!(flow, Flow::Continue), "request {i} should pass");
    }
    for _ in 0..2 {
        match chain.run_request(&mut ctx(), &mut get("/x")) {
            Flow::Respond(resp) => {
                assert_eq!(resp.status, 429);
                assert_eq!(resp.headers.get("retry-after"), Some("1"));
                let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
                assert_eq!(body["error"], "rate_limited");
            }
            other => panic!("expected 429, got {other:?}"),
        }
    }
}

// ── CORS preflight through the chain ─────────────────────────────

#[test]
fn preflight_short_circuits_before_auth() {
    // auth would 401 an anonymous request; CORS (priority 10) answers
    // the preflight first
    let chain = chain(serde_json::json!([
        { "name": "auth", "config": {} },
        { "name": "cors",
          "config": { "allow_origins": ["https://a.test"], "allow_methods": ["GET", "POST"] } }
    ]));

    let mut req = Request::new(Method::Options, "/x");
    req.headers.set("origin", "https://a.test");
    req.headers.set("access-control-request-method", "POST");

    match chain.run_request(&mut ctx(), &mut req) {
        Flow::Respond(resp) => {
            assert_eq!(resp.status, 204);
            assert_eq!(
                resp.headers.get("access-control-allow-origin"),
                Some("https://a.test")
            );
            assert_eq!(
                resp.headers.get("access-control-allow-methods"),
                Some("GET, POST")
            );
            assert!(resp.headers.get("access-control-max-age").is_some());
            assert_eq!(resp.headers.get("vary"), Some("Origin"));
        }
        other => panic!("expected preflight 204, got {other:?}"),
    }
}

// ── ordering and short-circuit interplay ─────────────────────────

#[test]
fn auth_failure_still_gets_cors_and_logging_response_phase() {
    let chain = chain(serde_json::json!([
        { "name": "cors", "config": { "allow_origins": ["https://a.test"] } },
        { "name": "auth", "config": {} },
        { "name": "logging", "config": {} }
    ]));

    let mut c = ctx();
    let mut req = get("/private");
    req.headers.set("origin", "https://a.test");

    let mut resp = match chain.run_request(&mut c, &mut req) {
        Flow::Fail(err) => {
            assert!(matches!(err, GatewayError::Unauthenticated(_)));
            err.to_response()
        }
        other => panic!("expected auth failure, got {other:?}"),
    };

    // response phase runs over the 401 — CORS headers still appear
    chain.run_response(&mut c, &mut resp);
    assert_eq!(resp.status, 401);
    assert_eq!(
        resp.headers.get("access-control-allow-origin"),
        Some("https://a.test")
    );
}

#[test]
fn authenticated_request_flows_through_and_is_compressed() {
    let chain = chain(serde_json::json!([
        { "name": "auth", "config": { "public_paths": ["/open/*"] } },
        { "name": "compression", "config": { "min_size": 8 } }
    ]));

    let mut c = ctx();
    let mut req = get("/open/data");
    req.headers.set("accept-encoding", "gzip");
    assert!(matches!(chain.run_request(&mut c, &mut req), Flow::Continue));

    let body: Vec<u8> = b"compress me please ".repeat(50).to_vec();
    let mut resp = Response::with_body(200, "text/plain", body);
    chain.run_response(&mut c, &mut resp);
    assert_eq!(resp.headers.get("content-encoding"), Some("gzip"));
    assert!(resp.headers.has_token("vary", "accept-encoding"));
}

#[test]
fn disabled_entry_is_skipped() {
    let chain = chain(serde_json::json!([
        { "name": "auth", "enabled": false, "config": {} }
    ]));
    // anonymous request passes because auth is disabled
    assert!(matches!(
        chain.run_request(&mut ctx(), &mut get("/private")),
        Flow::Continue
    ));
}

#[test]
fn priority_override_reorders_entries() {
    // force auth before cors by overriding priorities; the anonymous
    // preflight then dies at auth instead of being answered by cors
    let chain = chain(serde_json::json!([
        { "name": "cors", "priority": 50,
          "config": { "allow_origins": ["https://a.test"] } },
        { "name": "auth", "priority": 1, "config": {} }
    ]));

    let mut req = Request::new(Method::Options, "/x");
    req.headers.set("origin", "https://a.test");
    assert!(matches!(
        chain.run_request(&mut ctx(), &mut req),
        Flow::Fail(GatewayError::Unauthenticated(_))
    ));
}

#[test]
fn header_transform_applies_to_both_sides() {
    let chain = chain(serde_json::json!([
        { "name": "header_transform",
          "config": {
              "request": [ { "name": "x-gateway", "op": "set", "value": "torii" } ],
              "response": [ { "name": "server", "op": "remove" } ]
          } }
    ]));

    let mut c = ctx();
    let mut req = get("/x");
    chain.run_request(&mut c, &mut req);
    assert_eq!(req.headers.get("x-gateway"), Some("torii"));

    let mut resp = Response::new(200);
    resp.headers.set("server", "hidden/1.0");
    chain.run_response(&mut c, &mut resp);
    assert!(!resp.headers.contains("server"));
}
