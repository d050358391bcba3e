use crate::context::RequestContext;
use serde_json::Value;
use std::sync::Arc;
use torii_core::GatewayError;
use torii_http::{Request, Response};

/// Outcome of a request-phase middleware.
#[derive(Debug)]
pub enum Flow {
    /// Proceed to the next middleware; after the last one, to dispatch.
    Continue,

    /// Short-circuit with this response. Remaining request-phase
    /// middlewares and upstream dispatch are skipped; the response phase
    /// still runs over it.
    Respond(Response),

    /// Short-circuit with the canonical response for this error kind.
    Fail(GatewayError),
}

/// A middleware factory: validates its config and produces a configured
/// instance. Registered once by name at startup.
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    /// Chain position when the config doesn't override it. Ascending,
    /// stable for ties.
    fn default_priority(&self) -> i32 {
        0
    }

    fn configure(&self, config: &Value) -> anyhow::Result<Arc<dyn MiddlewareInstance>>;
}

/// A configured middleware. Instances are shared across worker threads,
/// so any interior state must be thread-safe.
pub trait MiddlewareInstance: Send + Sync {
    fn name(&self) -> &'static str;

    fn on_request(&self, _ctx: &mut RequestContext, _req: &mut Request) -> Flow {
        Flow::Continue
    }

    /// Response-phase transformation. Infallible by contract: an instance
    /// that hits an internal error logs it and leaves the response
    /// untouched, so later middlewares still run over the unchanged value.
    fn on_response(&self, _ctx: &mut RequestContext, _resp: &mut Response) {}

    /// Periodic housekeeping (idle-key expiry etc.), driven by the
    /// background sweeper.
    fn sweep(&self) {}
}
