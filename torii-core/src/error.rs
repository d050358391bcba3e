use thiserror::Error;
use torii_http::Response;

/// Gateway error taxonomy. Every kind maps to a canonical HTTP status and
/// a JSON body; nothing crosses a stage boundary unclassified.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("authentication required: {0}")]
    Unauthenticated(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("no route matched")]
    NotFound,

    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("upstream connect failed: {0}")]
    UpstreamConnect(String),

    #[error("upstream timed out")]
    UpstreamTimeout,

    #[error("upstream connection reset: {0}")]
    UpstreamReset(String),

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Malformed(_) => 400,
            GatewayError::Unauthenticated(_) => 401,
            GatewayError::Forbidden(_) => 403,
            GatewayError::NotFound => 404,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::UpstreamConnect(_) => 502,
            GatewayError::UpstreamTimeout => 504,
            GatewayError::UpstreamReset(_) => 502,
            GatewayError::PoolExhausted => 503,
            GatewayError::Internal(_) => 500,
        }
    }

    /// Short machine-readable kind for the JSON body's `error` field.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Malformed(_) => "malformed",
            GatewayError::Unauthenticated(_) => "unauthenticated",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::NotFound => "not_found",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::UpstreamConnect(_) => "upstream_connect",
            GatewayError::UpstreamTimeout => "upstream_timeout",
            GatewayError::UpstreamReset(_) => "upstream_reset",
            GatewayError::PoolExhausted => "pool_exhausted",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// Fatal kinds tear the client connection down after the response.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GatewayError::Malformed(_) | GatewayError::Internal(_))
    }

    /// Canonical JSON error response for this kind.
    pub fn to_response(&self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
            "statusCode": status,
        });
        let mut resp = Response::with_body(
            status,
            "application/json",
            serde_json::to_vec(&body).unwrap_or_default(),
        );
        if let GatewayError::RateLimited { retry_after_secs } = self {
            resp.headers
                .set("retry-after", retry_after_secs.to_string());
        }
        if self.is_fatal() {
            resp.headers.set("connection", "close");
        }
        resp
    }
}
