use bytes::Bytes;

/// HTTP request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
    Options,
    Connect,
    Trace,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Options => "OPTIONS",
            Method::Connect => "CONNECT",
            Method::Trace => "TRACE",
        }
    }

    /// Parse a method token. Returns `None` for unknown or non-token input.
    pub fn parse(s: &str) -> Option<Method> {
        match s {
            "GET" => Some(Method::Get),
            "HEAD" => Some(Method::Head),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            "PATCH" => Some(Method::Patch),
            "OPTIONS" => Some(Method::Options),
            "CONNECT" => Some(Method::Connect),
            "TRACE" => Some(Method::Trace),
            _ => None,
        }
    }

    /// Idempotent per RFC 7231 §4.2.2. Failover only retries non-idempotent
    /// methods when a route explicitly opts in.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            Method::Get
                | Method::Head
                | Method::Put
                | Method::Delete
                | Method::Options
                | Method::Trace
        )
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP protocol versions spoken by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// Case-insensitive header map preserving multi-value semantics.
///
/// Names are stored lower-cased, values verbatim (OWS-trimmed at parse).
/// Duplicate names are comma-joined at parse time except `set-cookie`,
/// which stays an ordered list and serialises as multiple lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            entries: Vec::with_capacity(cap),
        }
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name` in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Replace all values of `name` with a single value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.entries.push((name.to_ascii_lowercase(), value.into()));
    }

    /// Add a value without touching existing ones.
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.entries.push((name.to_ascii_lowercase(), value.into()));
    }

    /// Insert a value parsed off the wire, applying the duplicate-name
    /// combining rule: comma-join, except `set-cookie` which stays a list.
    pub fn insert_parsed(&mut self, name: &str, value: &str) {
        let lower = name.to_ascii_lowercase();
        if lower != "set-cookie" {
            if let Some((_, existing)) = self.entries.iter_mut().find(|(n, _)| *n == lower) {
                existing.push_str(", ");
                existing.push_str(value);
                return;
            }
        }
        self.entries.push((lower, value.to_string()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// True if any comma-separated token of `name`'s values equals `token`
    /// (case-insensitive). Used for `connection: close`, `vary: origin`, etc.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderMap {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut map = HeaderMap::new();
        for (n, v) in iter {
            map.append(&n.into(), v);
        }
        map
    }
}

/// A fully-read HTTP request. The body is a contiguous byte snapshot;
/// framing (`content-length` vs chunked) is resolved by the codec before
/// a `Request` ever exists.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Absolute path plus optional query, exactly as received.
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            version: Version::Http11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn path(&self) -> &str {
        match self.target.find('?') {
            Some(pos) => &self.target[..pos],
            None => &self.target,
        }
    }

    pub fn query(&self) -> Option<&str> {
        self.target.find('?').map(|pos| &self.target[pos + 1..])
    }
}

/// A fully-read HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            version: Version::Http11,
            status,
            reason: status_text(status).to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_body(status: u16, content_type: &str, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        let mut resp = Response::new(status);
        resp.headers.set("content-type", content_type);
        let mut itoa_buf = itoa::Buffer::new();
        resp.headers.set("content-length", itoa_buf.format(body.len()));
        resp.body = body;
        resp
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
        let mut itoa_buf = itoa::Buffer::new();
        self.headers
            .set("content-length", itoa_buf.format(self.body.len()));
    }
}

/// 1xx, 204 and 304 responses never carry a body.
pub fn can_have_body(status: u16) -> bool {
    !(status / 100 == 1 || status == 204 || status == 304)
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Method ───────────────────────────────────────────────────

    #[test]
    fn method_parse_roundtrip() {
        for m in [
            Method::Get,
            Method::Head,
            Method::Post,
            Method::Put,
            Method::Delete,
            Method::Patch,
            Method::Options,
            Method::Connect,
            Method::Trace,
        ] {
            assert_eq!(Method::parse(m.as_str()), Some(m));
        }
        assert_eq!(Method::parse("BREW"), None);
        assert_eq!(Method::parse("get"), None);
    }

    #[test]
    fn method_idempotency() {
        assert!(Method::Get.is_idempotent());
        assert!(Method::Put.is_idempotent());
        assert!(Method::Delete.is_idempotent());
        assert!(!Method::Post.is_idempotent());
        assert!(!Method::Patch.is_idempotent());
    }

    // ── HeaderMap ────────────────────────────────────────────────

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut h = HeaderMap::new();
        h.set("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn duplicate_names_comma_join_on_parse() {
        let mut h = HeaderMap::new();
        h.insert_parsed("Accept", "text/html");
        h.insert_parsed("accept", "application/json");
        assert_eq!(h.get("accept"), Some("text/html, application/json"));
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn set_cookie_preserves_list_order() {
        let mut h = HeaderMap::new();
        h.insert_parsed("Set-Cookie", "a=1");
        h.insert_parsed("Set-Cookie", "b=2");
        let values: Vec<&str> = h.get_all("set-cookie").collect();
        assert_eq!(values, vec!["a=1", "b=2"]);
    }

    #[test]
    fn set_replaces_all_values() {
        let mut h = HeaderMap::new();
        h.append("x-tag", "one");
        h.append("x-tag", "two");
        h.set("x-tag", "three");
        let values: Vec<&str> = h.get_all("x-tag").collect();
        assert_eq!(values, vec!["three"]);
    }

    #[test]
    fn has_token_scans_comma_separated_values() {
        let mut h = HeaderMap::new();
        h.set("connection", "keep-alive, Close");
        assert!(h.has_token("connection", "close"));
        assert!(h.has_token("connection", "keep-alive"));
        assert!(!h.has_token("connection", "upgrade"));
    }

    // ── Request/Response ─────────────────────────────────────────

    #[test]
    fn request_path_and_query_split() {
        let req = Request::new(Method::Get, "/users/1?full=true&x=1");
        assert_eq!(req.path(), "/users/1");
        assert_eq!(req.query(), Some("full=true&x=1"));

        let req = Request::new(Method::Get, "/plain");
        assert_eq!(req.path(), "/plain");
        assert_eq!(req.query(), None);
    }

    #[test]
    fn with_body_sets_framing_headers() {
        let resp = Response::with_body(200, "application/json", &b"{}"[..]);
        assert_eq!(resp.headers.get("content-length"), Some("2"));
        assert_eq!(resp.headers.get("content-type"), Some("application/json"));
    }

    #[test]
    fn body_forbidden_statuses() {
        assert!(!can_have_body(100));
        assert!(!can_have_body(101));
        assert!(!can_have_body(204));
        assert!(!can_have_body(304));
        assert!(can_have_body(200));
        assert!(can_have_body(404));
    }
}
