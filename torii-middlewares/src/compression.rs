//! Response compression. Picks the first configured encoding the client
//! accepts and rewrites the body, length and `content-encoding`; skips
//! already-encoded, small, or non-compressible responses.

use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde::Deserialize;
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;
use torii_http::{can_have_body, Request, Response};
use torii_middleware::{Flow, Middleware, MiddlewareInstance, RequestContext};
use tracing::warn;

const CTX_ACCEPT: &str = "compression.accept";

pub struct CompressionMiddleware;

#[derive(Debug, Deserialize)]
struct CompressionConfig {
    /// Offered encodings in preference order.
    #[serde(default = "default_encodings")]
    encodings: Vec<String>,

    /// Bodies smaller than this are left alone.
    #[serde(default = "default_min_size")]
    min_size: usize,

    /// Content-type prefixes worth compressing.
    #[serde(default = "default_content_types")]
    content_types: Vec<String>,
}

fn default_encodings() -> Vec<String> {
    vec!["gzip".to_string(), "deflate".to_string()]
}

fn default_min_size() -> usize {
    1024
}

fn default_content_types() -> Vec<String> {
    vec![
        "text/".to_string(),
        "application/json".to_string(),
        "application/javascript".to_string(),
        "application/xml".to_string(),
    ]
}

impl Middleware for CompressionMiddleware {
    fn name(&self) -> &'static str {
        "compression"
    }

    fn default_priority(&self) -> i32 {
        50
    }

    fn configure(&self, config: &Value) -> anyhow::Result<Arc<dyn MiddlewareInstance>> {
        let cfg: CompressionConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("compression config: {e}"))?;
        for enc in &cfg.encodings {
            if enc != "gzip" && enc != "deflate" {
                anyhow::bail!("compression: unsupported encoding {enc:?}");
            }
        }
        Ok(Arc::new(CompressionInstance { cfg }))
    }
}

struct CompressionInstance {
    cfg: CompressionConfig,
}

impl CompressionInstance {
    fn pick_encoding(&self, accept: &str) -> Option<&str> {
        let accepted = parse_accept_encoding(accept);
        self.cfg
            .encodings
            .iter()
            .map(String::as_str)
            .find(|enc| accepted.iter().any(|a| a == enc))
    }

    fn compressible_type(&self, content_type: Option<&str>) -> bool {
        let Some(ct) = content_type else {
            return false;
        };
        self.cfg.content_types.iter().any(|p| ct.starts_with(p))
    }
}

impl MiddlewareInstance for CompressionInstance {
    fn name(&self) -> &'static str {
        "compression"
    }

    fn on_request(&self, ctx: &mut RequestContext, req: &mut Request) -> Flow {
        // Stash the client's preference; the response phase has no request.
        if let Some(accept) = req.headers.get("accept-encoding") {
            ctx.set_var(CTX_ACCEPT, Value::String(accept.to_string()));
        }
        Flow::Continue
    }

    fn on_response(&self, ctx: &mut RequestContext, resp: &mut Response) {
        if !can_have_body(resp.status)
            || resp.headers.contains("content-encoding")
            || resp.body.len() < self.cfg.min_size
            || !self.compressible_type(resp.headers.get("content-type"))
        {
            return;
        }
        let Some(accept) = ctx.get_var(CTX_ACCEPT).and_then(|v| v.as_str()) else {
            return;
        };
        let Some(encoding) = self.pick_encoding(accept) else {
            return;
        };

        let encoded = match encode(encoding, &resp.body) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(encoding = %encoding, error = %e, "Compression failed, passing body through");
                return;
            }
        };
        if encoded.len() >= resp.body.len() {
            return; // incompressible payload
        }

        let encoding = encoding.to_string();
        resp.set_body(encoded);
        resp.headers.set("content-encoding", encoding);
        if !resp.headers.has_token("vary", "accept-encoding") {
            resp.headers.append("vary", "Accept-Encoding");
        }
    }
}

fn encode(encoding: &str, body: &[u8]) -> std::io::Result<Vec<u8>> {
    match encoding {
        "gzip" => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(body)?;
            encoder.finish()
        }
        "deflate" => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(body)?;
            encoder.finish()
        }
        other => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unknown encoding {other}"),
        )),
    }
}

/// Tokens the client accepts, q=0 entries excluded.
fn parse_accept_encoding(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter_map(|part| {
            let mut pieces = part.trim().split(';');
            let token = pieces.next()?.trim().to_ascii_lowercase();
            if token.is_empty() {
                return None;
            }
            for param in pieces {
                let param = param.trim();
                if let Some(q) = param.strip_prefix("q=") {
                    if q.trim().parse::<f32>().map(|q| q <= 0.0).unwrap_or(false) {
                        return None;
                    }
                }
            }
            Some(token)
        })
        .collect()
}
