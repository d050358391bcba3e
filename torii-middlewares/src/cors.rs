//! CORS: origin allow-listing (exact, list, regex, or `*`), preflight
//! short-circuiting, and response-phase header injection.

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use torii_core::GatewayError;
use torii_http::{Method, Request, Response};
use torii_middleware::{Flow, Middleware, MiddlewareInstance, RequestContext};

const CTX_ORIGIN: &str = "cors.origin";

pub struct CorsMiddleware;

#[derive(Debug, Deserialize)]
struct CorsConfig {
    /// Allowed origins: exact values, `regex:<pattern>` entries, or `*`.
    #[serde(default = "default_origins")]
    allow_origins: Vec<String>,

    #[serde(default = "default_methods")]
    allow_methods: Vec<String>,

    #[serde(default = "default_headers")]
    allow_headers: Vec<String>,

    #[serde(default)]
    allow_credentials: bool,

    #[serde(default = "default_max_age")]
    max_age_secs: u32,

    /// On origin mismatch: 403 when true, pass through without CORS
    /// headers when false.
    #[serde(default = "default_true")]
    block_on_mismatch: bool,
}

fn default_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_headers() -> Vec<String> {
    vec!["content-type".to_string(), "authorization".to_string()]
}

fn default_max_age() -> u32 {
    600
}

fn default_true() -> bool {
    true
}

impl Middleware for CorsMiddleware {
    fn name(&self) -> &'static str {
        "cors"
    }

    fn default_priority(&self) -> i32 {
        10
    }

    fn configure(&self, config: &Value) -> anyhow::Result<Arc<dyn MiddlewareInstance>> {
        let cfg: CorsConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("cors config: {e}"))?;

        let mut allow_any = false;
        let mut exact = Vec::new();
        let mut patterns = Vec::new();
        for entry in &cfg.allow_origins {
            if entry == "*" {
                allow_any = true;
            } else if let Some(pattern) = entry.strip_prefix("regex:") {
                patterns.push(
                    Regex::new(pattern)
                        .map_err(|e| anyhow::anyhow!("cors origin pattern {pattern:?}: {e}"))?,
                );
            } else {
                exact.push(entry.clone());
            }
        }

        Ok(Arc::new(CorsInstance {
            allow_any,
            exact,
            patterns,
            cfg,
        }))
    }
}

struct CorsInstance {
    allow_any: bool,
    exact: Vec<String>,
    patterns: Vec<Regex>,
    cfg: CorsConfig,
}

impl CorsInstance {
    /// The `access-control-allow-origin` value for this origin, or `None`
    /// when disallowed. A wildcard config reflects `*`, not the origin.
    fn resolve(&self, origin: &str) -> Option<String> {
        if self.allow_any {
            return Some("*".to_string());
        }
        if self.exact.iter().any(|o| o == origin) {
            return Some(origin.to_string());
        }
        if self.patterns.iter().any(|p| p.is_match(origin)) {
            return Some(origin.to_string());
        }
        None
    }

    fn preflight_response(&self, origin_value: &str) -> Response {
        let mut resp = Response::new(204);
        resp.headers
            .set("access-control-allow-origin", origin_value);
        resp.headers
            .set("access-control-allow-methods", self.cfg.allow_methods.join(", "));
        resp.headers
            .set("access-control-allow-headers", self.cfg.allow_headers.join(", "));
        resp.headers
            .set("access-control-max-age", self.cfg.max_age_secs.to_string());
        if self.cfg.allow_credentials {
            resp.headers.set("access-control-allow-credentials", "true");
        }
        resp.headers.set("vary", "Origin");
        resp
    }
}

impl MiddlewareInstance for CorsInstance {
    fn name(&self) -> &'static str {
        "cors"
    }

    fn on_request(&self, ctx: &mut RequestContext, req: &mut Request) -> Flow {
        let origin = match req.headers.get("origin") {
            Some(o) => o.to_string(),
            None => return Flow::Continue, // not a CORS request
        };

        let resolved = match self.resolve(&origin) {
            Some(value) => value,
            None => {
                if self.cfg.block_on_mismatch {
                    return Flow::Fail(GatewayError::Forbidden(format!(
                        "origin {origin} not allowed"
                    )));
                }
                return Flow::Continue;
            }
        };

        // Preflight never reaches the upstream.
        if req.method == Method::Options {
            return Flow::Respond(self.preflight_response(&resolved));
        }

        ctx.set_var(CTX_ORIGIN, Value::String(resolved));
        Flow::Continue
    }

    fn on_response(&self, ctx: &mut RequestContext, resp: &mut Response) {
        let Some(origin) = ctx.get_var(CTX_ORIGIN).and_then(|v| v.as_str()) else {
            return;
        };
        resp.headers.set("access-control-allow-origin", origin);
        if self.cfg.allow_credentials {
            resp.headers.set("access-control-allow-credentials", "true");
        }
        if !resp.headers.has_token("vary", "origin") {
            resp.headers.append("vary", "Origin");
        }
    }
}
