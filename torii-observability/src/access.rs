use tracing::{error, info, warn};

/// One completed request, as the access log sees it.
pub struct AccessRecord<'a> {
    pub request_id: &'a str,
    pub client: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub status: u16,
    pub duration_ms: f64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub upstream_id: Option<&'a str>,
    pub cached: &'a str,
}

/// Emit the structured per-request log line. Level follows the status
/// class: ERROR for 5xx, WARN for 4xx, INFO otherwise.
pub fn emit(r: &AccessRecord<'_>) {
    match r.status / 100 {
        5 => error!(
            id = %r.request_id,
            client = %r.client,
            method = %r.method,
            path = %r.path,
            status = r.status,
            duration_ms = r.duration_ms,
            bytes_in = r.bytes_in,
            bytes_out = r.bytes_out,
            upstream_id = r.upstream_id.unwrap_or("-"),
            cached = %r.cached,
            "request"
        ),
        4 => warn!(
            id = %r.request_id,
            client = %r.client,
            method = %r.method,
            path = %r.path,
            status = r.status,
            duration_ms = r.duration_ms,
            bytes_in = r.bytes_in,
            bytes_out = r.bytes_out,
            upstream_id = r.upstream_id.unwrap_or("-"),
            cached = %r.cached,
            "request"
        ),
        _ => info!(
            id = %r.request_id,
            client = %r.client,
            method = %r.method,
            path = %r.path,
            status = r.status,
            duration_ms = r.duration_ms,
            bytes_in = r.bytes_in,
            bytes_out = r.bytes_out,
            upstream_id = r.upstream_id.unwrap_or("-"),
            cached = %r.cached,
            "request"
        ),
    }
}
