//! Access logging. The request phase notes identifying fields; the
//! response phase emits the structured per-request record with a level
//! chosen by status class.

use serde_json::Value;
use std::sync::Arc;
use torii_http::{Request, Response};
use torii_middleware::{Flow, Middleware, MiddlewareInstance, RequestContext};
use torii_observability::{access, AccessRecord};
use tracing::debug;

const CTX_METHOD: &str = "log.method";
const CTX_PATH: &str = "log.path";

pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    /// Runs last so the response phase sees the final byte counts.
    fn default_priority(&self) -> i32 {
        60
    }

    fn configure(&self, _config: &Value) -> anyhow::Result<Arc<dyn MiddlewareInstance>> {
        Ok(Arc::new(LoggingInstance))
    }
}

struct LoggingInstance;

impl MiddlewareInstance for LoggingInstance {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn on_request(&self, ctx: &mut RequestContext, req: &mut Request) -> Flow {
        debug!(
            id = %ctx.request_id,
            method = %req.method,
            uri = %req.target,
            client = %ctx.client_addr,
            "request accepted"
        );
        ctx.set_var(CTX_METHOD, Value::String(req.method.as_str().to_string()));
        ctx.set_var(CTX_PATH, Value::String(req.path().to_string()));
        ctx.bytes_in = req.body.len() as u64;
        Flow::Continue
    }

    fn on_response(&self, ctx: &mut RequestContext, resp: &mut Response) {
        let method = ctx
            .get_var(CTX_METHOD)
            .and_then(|v| v.as_str())
            .unwrap_or("-")
            .to_string();
        let path = ctx
            .get_var(CTX_PATH)
            .and_then(|v| v.as_str())
            .unwrap_or("-")
            .to_string();
        access::emit(&AccessRecord {
            request_id: &ctx.request_id,
            client: &ctx.client_ip(),
            method: &method,
            path: &path,
            status: resp.status,
            duration_ms: ctx.elapsed_ms(),
            bytes_in: ctx.bytes_in,
            bytes_out: resp.body.len() as u64,
            upstream_id: ctx.server_id.as_deref(),
            cached: ctx.cache.map(|c| c.as_str()).unwrap_or("-"),
        });
    }
}
