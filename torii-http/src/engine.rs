//! HTTP/1.1 connection engines: one server side, one symmetric client
//! side, each strictly sequential on its stream — a new message is never
//! started until the previous exchange is fully consumed.

use crate::codec::{self, Limits};
use crate::error::HttpError;
use crate::stream::BufStream;
use crate::types::{can_have_body, HeaderMap, Method, Request, Response, Version};
use monoio::io::{AsyncReadRent, AsyncWriteRent};

/// Server side of one client connection: read request, write response,
/// repeat while keep-alive holds.
pub struct ServerConn<S> {
    stream: BufStream<S>,
    limits: Limits,
    write_buf: Vec<u8>,
    handled: u64,
}

impl<S: AsyncReadRent + AsyncWriteRent> ServerConn<S> {
    pub fn new(io: S, limits: Limits) -> Self {
        Self {
            stream: BufStream::new(io),
            limits,
            write_buf: Vec::with_capacity(4096),
            handled: 0,
        }
    }

    /// Requests fully read on this connection so far. Zero distinguishes a
    /// silent pre-request disconnect from a mid-stream one.
    pub fn requests_handled(&self) -> u64 {
        self.handled
    }

    pub async fn read_request(&mut self) -> Result<Option<Request>, HttpError> {
        let req = codec::read_request(&mut self.stream, &self.limits).await?;
        if req.is_some() {
            self.handled += 1;
        }
        Ok(req)
    }

    /// Write a response, fixing up framing first: a body-bearing response
    /// without `content-length` or chunked encoding gets an exact length
    /// so the connection stays reusable. Returns bytes written.
    pub async fn write_response(&mut self, resp: &mut Response) -> Result<usize, HttpError> {
        ensure_response_framing(resp);
        let mut buf = std::mem::take(&mut self.write_buf);
        codec::serialize_response(&mut buf, resp);
        let written = buf.len();
        self.stream.write_bytes(&buf);
        self.write_buf = buf;
        self.stream.flush().await?;
        Ok(written)
    }
}

/// Keep-alive holds iff neither peer signalled `connection: close` and the
/// response framing is unambiguous (a close-delimited body forces close).
pub fn keep_alive(req_version: Version, req_headers: &HeaderMap, resp: &Response) -> bool {
    let client_wants = match req_version {
        Version::Http11 => !req_headers.has_token("connection", "close"),
        Version::Http10 => req_headers.has_token("connection", "keep-alive"),
    };
    if !client_wants || resp.headers.has_token("connection", "close") {
        return false;
    }
    !can_have_body(resp.status)
        || resp.headers.contains("content-length")
        || resp.headers.has_token("transfer-encoding", "chunked")
}

fn ensure_response_framing(resp: &mut Response) {
    if can_have_body(resp.status)
        && !resp.headers.contains("content-length")
        && !resp.headers.has_token("transfer-encoding", "chunked")
    {
        let mut itoa_buf = itoa::Buffer::new();
        resp.headers
            .set("content-length", itoa_buf.format(resp.body.len()));
    }
}

/// Client side of one upstream connection.
pub struct ClientConn<S> {
    stream: BufStream<S>,
    limits: Limits,
    write_buf: Vec<u8>,
}

impl<S: AsyncReadRent + AsyncWriteRent> ClientConn<S> {
    pub fn new(io: S, limits: Limits) -> Self {
        Self {
            stream: BufStream::new(io),
            limits,
            write_buf: Vec::with_capacity(2048),
        }
    }

    /// Write `req` and read the matching response.
    pub async fn send(&mut self, req: &Request) -> Result<Response, HttpError> {
        self.write_request(req).await?;
        self.read_response(req.method).await
    }

    /// Write stage only: serialise and flush the request. Callers with
    /// per-stage deadlines wrap this and `read_response` separately.
    pub async fn write_request(&mut self, req: &Request) -> Result<(), HttpError> {
        let mut buf = std::mem::take(&mut self.write_buf);
        codec::serialize_request(&mut buf, req);
        self.stream.write_bytes(&buf);
        self.write_buf = buf;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read stage only. `method` drives body framing (HEAD never has one).
    pub async fn read_response(&mut self, method: Method) -> Result<Response, HttpError> {
        codec::read_response(&mut self.stream, method, &self.limits).await
    }

    /// No buffered bytes left over from the previous exchange — required
    /// before the connection may re-enter an idle pool.
    pub fn is_drained(&self) -> bool {
        self.stream.is_drained()
    }
}

/// Whether the upstream connection may be pooled after this response:
/// the upstream did not ask to close and the body framing was explicit.
pub fn response_reusable(resp: &Response) -> bool {
    if resp.headers.has_token("connection", "close") {
        return false;
    }
    !can_have_body(resp.status)
        || resp.headers.contains("content-length")
        || resp.headers.has_token("transfer-encoding", "chunked")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockStream;
    use bytes::Bytes;

    fn limits() -> Limits {
        Limits::default()
    }

    // ── keep-alive decision ──────────────────────────────────────

    fn resp_with_cl(status: u16) -> Response {
        let mut resp = Response::new(status);
        resp.headers.set("content-length", "0");
        resp
    }

    #[test]
    fn http11_defaults_to_keep_alive() {
        let h = HeaderMap::new();
        assert!(keep_alive(Version::Http11, &h, &resp_with_cl(200)));
    }

    #[test]
    fn http10_defaults_to_close() {
        let h = HeaderMap::new();
        assert!(!keep_alive(Version::Http10, &h, &resp_with_cl(200)));
        let mut h = HeaderMap::new();
        h.set("connection", "keep-alive");
        assert!(keep_alive(Version::Http10, &h, &resp_with_cl(200)));
    }

    #[test]
    fn connection_close_wins_on_either_side() {
        let mut h = HeaderMap::new();
        h.set("connection", "close");
        assert!(!keep_alive(Version::Http11, &h, &resp_with_cl(200)));

        let h = HeaderMap::new();
        let mut resp = resp_with_cl(200);
        resp.headers.set("connection", "close");
        assert!(!keep_alive(Version::Http11, &h, &resp));
    }

    #[test]
    fn ambiguous_framing_forces_close() {
        let h = HeaderMap::new();
        let mut resp = Response::new(200);
        resp.body = Bytes::from_static(b"no length header");
        resp.headers.remove("content-length");
        assert!(!keep_alive(Version::Http11, &h, &resp));
        // bodyless statuses are always unambiguous
        assert!(keep_alive(Version::Http11, &h, &Response::new(304)));
    }

    // ── server engine ────────────────────────────────────────────

    #[monoio::test]
    async fn server_reads_sequential_requests() {
        let raw = b"GET /a HTTP/1.1\r\nhost: x\r\n\r\nGET /b HTTP/1.1\r\nhost: x\r\n\r\n";
        let mut conn = ServerConn::new(MockStream::reading(raw), limits());
        let first = conn.read_request().await.unwrap().unwrap();
        assert_eq!(first.target, "/a");
        let second = conn.read_request().await.unwrap().unwrap();
        assert_eq!(second.target, "/b");
        assert_eq!(conn.requests_handled(), 2);
        assert!(conn.read_request().await.unwrap().is_none());
    }

    #[monoio::test]
    async fn server_write_fixes_missing_content_length() {
        let mut conn = ServerConn::new(MockStream::reading(b""), limits());
        let mut resp = Response::new(200);
        resp.body = Bytes::from_static(b"hello");
        let written = conn.write_response(&mut resp).await.unwrap();
        assert_eq!(resp.headers.get("content-length"), Some("5"));
        // status line + at least one header line + separator + body
        assert!(written > "HTTP/1.1 200 OK\r\n\r\n".len() + 5);
    }

    // ── client engine ────────────────────────────────────────────

    #[monoio::test]
    async fn client_send_writes_request_and_reads_response() {
        let mut conn = ClientConn::new(
            MockStream::reading(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok"),
            limits(),
        );
        let mut req = Request::new(Method::Get, "/ping");
        req.headers.set("host", "upstream.test");
        let resp = conn.send(&req).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(&resp.body[..], b"ok");
        assert!(conn.is_drained());
    }

    #[monoio::test]
    async fn client_upstream_vanishing_is_premature_close() {
        let mut conn = ClientConn::new(MockStream::reading(b""), limits());
        let req = Request::new(Method::Get, "/");
        let err = conn.send(&req).await.unwrap_err();
        assert!(matches!(err, HttpError::PrematureClose));
    }

    #[test]
    fn reusable_requires_explicit_framing() {
        let mut resp = Response::new(200);
        resp.headers.set("content-length", "0");
        assert!(response_reusable(&resp));

        resp.headers.set("connection", "close");
        assert!(!response_reusable(&resp));

        let mut close_delimited = Response::new(200);
        close_delimited.body = Bytes::from_static(b"x");
        assert!(!response_reusable(&close_delimited));
    }
}
