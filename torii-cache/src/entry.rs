//! Stored response snapshots and freshness computation.

use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::time::Duration;
use torii_http::{HeaderMap, Method, Response};

/// Immutable snapshot of an upstream response, shared between the index
/// and any number of concurrent readers.
#[derive(Debug)]
pub struct StoredResponse {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl StoredResponse {
    pub fn snapshot(resp: &Response) -> StoredResponse {
        StoredResponse {
            status: resp.status,
            reason: resp.reason.clone(),
            headers: resp.headers.clone(),
            body: resp.body.clone(),
        }
    }

    /// Materialise a client response from the snapshot, stamping the
    /// synthetic `age` header.
    pub fn to_response(&self, age_secs: u64) -> Response {
        let mut resp = Response::new(self.status);
        resp.reason = self.reason.clone();
        resp.headers = self.headers.clone();
        resp.body = self.body.clone();
        let mut itoa_buf = itoa::Buffer::new();
        resp.headers.set("age", itoa_buf.format(age_secs));
        resp
    }

    pub fn size_bytes(&self) -> u64 {
        let header_bytes: usize = self
            .headers
            .iter()
            .map(|(n, v)| n.len() + v.len() + 4)
            .sum();
        (self.body.len() + header_bytes + self.reason.len() + 16) as u64
    }
}

/// Parsed `cache-control` directives relevant to storage decisions.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheControl {
    pub no_store: bool,
    pub private: bool,
    pub no_cache: bool,
    pub max_age: Option<u64>,
    pub s_maxage: Option<u64>,
}

pub fn parse_cache_control(headers: &HeaderMap) -> CacheControl {
    let mut cc = CacheControl::default();
    for value in headers.get_all("cache-control") {
        for directive in value.split(',') {
            let directive = directive.trim();
            let (name, arg) = match directive.split_once('=') {
                Some((n, a)) => (n.trim(), Some(a.trim().trim_matches('"'))),
                None => (directive, None),
            };
            match name.to_ascii_lowercase().as_str() {
                "no-store" => cc.no_store = true,
                "private" => cc.private = true,
                "no-cache" => cc.no_cache = true,
                "max-age" => cc.max_age = arg.and_then(|a| a.parse().ok()),
                "s-maxage" => cc.s_maxage = arg.and_then(|a| a.parse().ok()),
                _ => {}
            }
        }
    }
    cc
}

/// Requests eligible for cache handling: GET/HEAD without `no-store`.
pub fn request_cacheable(method: Method, headers: &HeaderMap) -> bool {
    if !matches!(method, Method::Get | Method::Head) {
        return false;
    }
    !parse_cache_control(headers).no_store
}

/// Responses the cache may store: not `no-store`/`private`, no `vary: *`.
pub fn response_storable(headers: &HeaderMap) -> bool {
    let cc = parse_cache_control(headers);
    if cc.no_store || cc.private {
        return false;
    }
    !headers.get_all("vary").any(|v| v.trim() == "*")
}

/// Compute the entry TTL with the precedence `s-maxage` > `max-age` >
/// `expires` > configured default, bounded by `max_ttl`.
pub fn compute_ttl(
    headers: &HeaderMap,
    default_ttl: Duration,
    max_ttl: Duration,
    wall_now: DateTime<Utc>,
) -> Duration {
    let cc = parse_cache_control(headers);
    let ttl = if let Some(s) = cc.s_maxage {
        Duration::from_secs(s)
    } else if let Some(m) = cc.max_age {
        Duration::from_secs(m)
    } else if let Some(expires) = headers.get("expires").and_then(parse_http_date) {
        let delta = expires.signed_duration_since(wall_now);
        Duration::from_secs(delta.num_seconds().max(0) as u64)
    } else {
        default_ttl
    };
    ttl.min(max_ttl)
}

/// Parse an IMF-fixdate (`Sun, 06 Nov 1994 08:49:37 GMT`).
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), "%a, %d %b %Y %H:%M:%S GMT")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Format a wall-clock instant as an IMF-fixdate.
pub fn format_http_date(value: DateTime<Utc>) -> String {
    value.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Names listed in the response `vary` header, lower-cased, in order.
pub fn vary_names(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all("vary")
        .flat_map(|v| v.split(','))
        .map(|n| n.trim().to_ascii_lowercase())
        .filter(|n| !n.is_empty() && n != "*")
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (n, v) in pairs {
            h.append(n, *v);
        }
        h
    }

    // ── cache-control parsing ────────────────────────────────────

    #[test]
    fn directives_parse_with_arguments() {
        let cc = parse_cache_control(&headers(&[("cache-control", "max-age=60, s-maxage=120")]));
        assert_eq!(cc.max_age, Some(60));
        assert_eq!(cc.s_maxage, Some(120));
        assert!(!cc.no_store);
    }

    #[test]
    fn flag_directives_parse() {
        let cc = parse_cache_control(&headers(&[("cache-control", "no-store, private")]));
        assert!(cc.no_store);
        assert!(cc.private);
    }

    // ── admission ────────────────────────────────────────────────

    #[test]
    fn only_get_and_head_are_cacheable() {
        let h = HeaderMap::new();
        assert!(request_cacheable(Method::Get, &h));
        assert!(request_cacheable(Method::Head, &h));
        assert!(!request_cacheable(Method::Post, &h));
        assert!(!request_cacheable(Method::Delete, &h));
    }

    #[test]
    fn request_no_store_bypasses() {
        let h = headers(&[("cache-control", "no-store")]);
        assert!(!request_cacheable(Method::Get, &h));
    }

    #[test]
    fn response_no_store_and_private_unstorable() {
        assert!(!response_storable(&headers(&[("cache-control", "no-store")])));
        assert!(!response_storable(&headers(&[("cache-control", "private")])));
        assert!(response_storable(&headers(&[("cache-control", "max-age=5")])));
    }

    #[test]
    fn vary_star_unstorable() {
        assert!(!response_storable(&headers(&[("vary", "*")])));
    }

    // ── ttl precedence ───────────────────────────────────────────

    fn wall() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn s_maxage_beats_max_age() {
        let h = headers(&[("cache-control", "max-age=60, s-maxage=120")]);
        let ttl = compute_ttl(&h, Duration::from_secs(5), Duration::from_secs(3600), wall());
        assert_eq!(ttl, Duration::from_secs(120));
    }

    #[test]
    fn max_age_beats_expires() {
        let h = headers(&[
            ("cache-control", "max-age=60"),
            ("expires", "Sun, 01 Jun 2025 13:00:00 GMT"),
        ]);
        let ttl = compute_ttl(&h, Duration::from_secs(5), Duration::from_secs(7200), wall());
        assert_eq!(ttl, Duration::from_secs(60));
    }

    #[test]
    fn expires_beats_default() {
        let h = headers(&[("expires", "Sun, 01 Jun 2025 12:10:00 GMT")]);
        let ttl = compute_ttl(&h, Duration::from_secs(5), Duration::from_secs(7200), wall());
        assert_eq!(ttl, Duration::from_secs(600));
    }

    #[test]
    fn expired_expires_means_zero_ttl() {
        let h = headers(&[("expires", "Sun, 01 Jun 2025 11:00:00 GMT")]);
        let ttl = compute_ttl(&h, Duration::from_secs(5), Duration::from_secs(7200), wall());
        assert_eq!(ttl, Duration::ZERO);
    }

    #[test]
    fn default_applies_when_nothing_set() {
        let ttl = compute_ttl(
            &HeaderMap::new(),
            Duration::from_secs(42),
            Duration::from_secs(3600),
            wall(),
        );
        assert_eq!(ttl, Duration::from_secs(42));
    }

    #[test]
    fn max_ttl_bounds_everything() {
        let h = headers(&[("cache-control", "max-age=999999")]);
        let ttl = compute_ttl(&h, Duration::from_secs(5), Duration::from_secs(100), wall());
        assert_eq!(ttl, Duration::from_secs(100));
    }

    // ── dates & vary ─────────────────────────────────────────────

    #[test]
    fn http_date_roundtrip() {
        let date = wall();
        let formatted = format_http_date(date);
        assert_eq!(parse_http_date(&formatted), Some(date));
    }

    #[test]
    fn vary_names_lowercase_and_split() {
        let h = headers(&[("vary", "Accept-Encoding, Origin")]);
        assert_eq!(vary_names(&h), vec!["accept-encoding", "origin"]);
    }

    // ── snapshot ─────────────────────────────────────────────────

    #[test]
    fn to_response_stamps_age() {
        let stored = StoredResponse {
            status: 200,
            reason: "OK".into(),
            headers: headers(&[("content-length", "2"), ("content-type", "text/plain")]),
            body: Bytes::from_static(b"v1"),
        };
        let resp = stored.to_response(30);
        assert_eq!(resp.status, 200);
        assert_eq!(resp.headers.get("age"), Some("30"));
        assert_eq!(&resp.body[..], b"v1");
    }
}
