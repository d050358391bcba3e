//! Message framing: head tokenization (via httparse), body framing rules,
//! chunked transfer decoding, and serialisation.

use crate::error::HttpError;
use crate::stream::BufStream;
use crate::types::{can_have_body, HeaderMap, Method, Request, Response, Version};
use bytes::Bytes;
use monoio::io::{AsyncReadRent, AsyncWriteRent};

const MAX_PARSED_HEADERS: usize = 128;
const MAX_CHUNK_SIZE_LINE: usize = 1024;
const MAX_TRAILER_LINE: usize = 4096;

/// Parser limits. Breaching any of them is a `Malformed` error, fatal to
/// the connection.
#[derive(Debug, Clone)]
pub struct Limits {
    pub max_head_bytes: usize,
    pub max_header_count: usize,
    pub max_body_bytes: usize,
    /// Trailer names forwarded into the message headers; all others are
    /// read and discarded.
    pub allowed_trailers: Vec<String>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_head_bytes: 32 * 1024,
            max_header_count: 100,
            max_body_bytes: 16 * 1024 * 1024,
            allowed_trailers: Vec::new(),
        }
    }
}

// ── reading ───────────────────────────────────────────────────

/// Read one request off the stream. `Ok(None)` means the peer closed
/// cleanly between messages (keep-alive teardown, not an error).
pub async fn read_request<S>(
    stream: &mut BufStream<S>,
    limits: &Limits,
) -> Result<Option<Request>, HttpError>
where
    S: AsyncReadRent + AsyncWriteRent,
{
    let head = match stream.read_head(limits.max_head_bytes).await? {
        Some(head) => head,
        None => return Ok(None),
    };
    let (method, target, version, mut headers) = parse_request_head(&head, limits)?;
    let body = read_body(stream, &mut headers, limits, BodyRole::Request { method }).await?;
    Ok(Some(Request {
        method,
        target,
        version,
        headers,
        body,
    }))
}

/// Read one response off the stream. The request method decides whether a
/// body can follow the head (HEAD never carries one).
pub async fn read_response<S>(
    stream: &mut BufStream<S>,
    req_method: Method,
    limits: &Limits,
) -> Result<Response, HttpError>
where
    S: AsyncReadRent + AsyncWriteRent,
{
    let head = match stream.read_head(limits.max_head_bytes).await? {
        Some(head) => head,
        None => return Err(HttpError::PrematureClose),
    };
    let (version, status, reason, mut headers) = parse_response_head(&head, limits)?;
    let body = read_body(
        stream,
        &mut headers,
        limits,
        BodyRole::Response { req_method, status },
    )
    .await?;
    Ok(Response {
        version,
        status,
        reason,
        headers,
        body,
    })
}

pub fn parse_request_head(
    head: &[u8],
    limits: &Limits,
) -> Result<(Method, String, Version, HeaderMap), HttpError> {
    let mut raw = [httparse::EMPTY_HEADER; MAX_PARSED_HEADERS];
    let mut req = httparse::Request::new(&mut raw);
    match req.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(HttpError::malformed("truncated request head"));
        }
        Err(e) => return Err(HttpError::malformed(format!("request head: {e}"))),
    }

    let method_str = req.method.ok_or_else(|| HttpError::malformed("missing method"))?;
    let method = Method::parse(method_str)
        .ok_or_else(|| HttpError::malformed(format!("unrecognized method {method_str:?}")))?;
    let target = req
        .path
        .ok_or_else(|| HttpError::malformed("missing request target"))?;
    if target.is_empty() {
        return Err(HttpError::malformed("empty request target"));
    }
    let version = match req.version {
        Some(0) => Version::Http10,
        Some(1) => Version::Http11,
        _ => return Err(HttpError::malformed("unsupported http version")),
    };
    let headers = collect_headers(req.headers, limits)?;
    Ok((method, target.to_string(), version, headers))
}

pub fn parse_response_head(
    head: &[u8],
    limits: &Limits,
) -> Result<(Version, u16, String, HeaderMap), HttpError> {
    let mut raw = [httparse::EMPTY_HEADER; MAX_PARSED_HEADERS];
    let mut resp = httparse::Response::new(&mut raw);
    match resp.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(HttpError::malformed("truncated response head"));
        }
        Err(e) => return Err(HttpError::malformed(format!("response head: {e}"))),
    }

    let version = match resp.version {
        Some(0) => Version::Http10,
        Some(1) => Version::Http11,
        _ => return Err(HttpError::malformed("unsupported http version")),
    };
    let status = resp
        .code
        .ok_or_else(|| HttpError::malformed("missing status code"))?;
    // Reason phrase is informational and may be empty.
    let reason = resp.reason.unwrap_or("").to_string();
    let headers = collect_headers(resp.headers, limits)?;
    Ok((version, status, reason, headers))
}

fn collect_headers(
    raw: &[httparse::Header<'_>],
    limits: &Limits,
) -> Result<HeaderMap, HttpError> {
    let mut headers = HeaderMap::with_capacity(raw.len().min(limits.max_header_count));
    let mut count = 0usize;
    for h in raw {
        if h.name.is_empty() {
            break;
        }
        count += 1;
        if count > limits.max_header_count {
            return Err(HttpError::malformed("too many headers"));
        }
        let value = std::str::from_utf8(h.value)
            .map_err(|_| HttpError::malformed("non-utf8 header value"))?;
        headers.insert_parsed(h.name, value.trim_matches(|c| c == ' ' || c == '\t'));
    }
    Ok(headers)
}

enum BodyRole {
    Request { method: Method },
    Response { req_method: Method, status: u16 },
}

/// Resolve body framing in priority order: chunked, content-length,
/// (responses only) read-until-close, empty.
async fn read_body<S>(
    stream: &mut BufStream<S>,
    headers: &mut HeaderMap,
    limits: &Limits,
    role: BodyRole,
) -> Result<Bytes, HttpError>
where
    S: AsyncReadRent + AsyncWriteRent,
{
    if let BodyRole::Response { req_method, status } = &role {
        if *req_method == Method::Head || !can_have_body(*status) {
            return Ok(Bytes::new());
        }
    }

    let chunked = headers.has_token("transfer-encoding", "chunked");
    let content_length = headers.get("content-length").map(str::to_string);

    if chunked {
        if content_length.is_some() {
            return Err(HttpError::malformed(
                "content-length present alongside chunked transfer-encoding",
            ));
        }
        let (body, trailers) = read_chunked(stream, limits).await?;
        for (name, value) in trailers.iter() {
            if limits
                .allowed_trailers
                .iter()
                .any(|t| t.eq_ignore_ascii_case(name))
            {
                headers.insert_parsed(name, value);
            }
        }
        // The message is no longer chunked once decoded; reframe it.
        headers.remove("transfer-encoding");
        let mut itoa_buf = itoa::Buffer::new();
        headers.set("content-length", itoa_buf.format(body.len()));
        return Ok(Bytes::from(body));
    }

    if let Some(cl) = content_length {
        let n: usize = cl
            .trim()
            .parse()
            .map_err(|_| HttpError::malformed("invalid content-length"))?;
        if n > limits.max_body_bytes {
            return Err(HttpError::malformed("body exceeds limit"));
        }
        let body = stream.read_exact(n).await?;
        return Ok(Bytes::from(body));
    }

    match role {
        BodyRole::Request { .. } => Ok(Bytes::new()),
        BodyRole::Response { .. } => {
            let body = stream.read_to_close(limits.max_body_bytes).await?;
            let mut itoa_buf = itoa::Buffer::new();
            headers.set("content-length", itoa_buf.format(body.len()));
            Ok(Bytes::from(body))
        }
    }
}

/// Decode a chunked body: `hex-size [;ext] CRLF data CRLF` repeated,
/// terminated by a zero-size chunk and optional trailers. Extensions are
/// tolerated and ignored; trailers are returned to the caller.
async fn read_chunked<S>(
    stream: &mut BufStream<S>,
    limits: &Limits,
) -> Result<(Vec<u8>, HeaderMap), HttpError>
where
    S: AsyncReadRent + AsyncWriteRent,
{
    let mut body = Vec::new();
    loop {
        let line = stream.read_line(MAX_CHUNK_SIZE_LINE).await?;
        let line = std::str::from_utf8(&line)
            .map_err(|_| HttpError::malformed("malformed chunk: non-utf8 size line"))?;
        let size_str = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| HttpError::malformed(format!("malformed chunk: size {size_str:?}")))?;
        if size == 0 {
            break;
        }
        if body.len() + size > limits.max_body_bytes {
            return Err(HttpError::malformed("body exceeds limit"));
        }
        let data = stream.read_exact(size).await?;
        body.extend_from_slice(&data);
        let crlf = stream.read_exact(2).await?;
        if crlf != b"\r\n" {
            return Err(HttpError::malformed("malformed chunk: missing terminator"));
        }
    }

    let mut trailers = HeaderMap::new();
    loop {
        let line = stream.read_line(MAX_TRAILER_LINE).await?;
        if line.is_empty() {
            break;
        }
        let line = std::str::from_utf8(&line)
            .map_err(|_| HttpError::malformed("non-utf8 trailer"))?;
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpError::malformed("malformed trailer line"))?;
        trailers.insert_parsed(name.trim(), value.trim());
    }
    Ok((body, trailers))
}

// ── writing ───────────────────────────────────────────────────

/// Serialise a request into `buf` (cleared first). Headers are written in
/// insertion order, one line per stored value.
pub fn serialize_request(buf: &mut Vec<u8>, req: &Request) {
    buf.clear();
    buf.extend_from_slice(req.method.as_str().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(req.target.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(req.version.as_str().as_bytes());
    buf.extend_from_slice(b"\r\n");
    write_headers(buf, &req.headers);
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(&req.body);
}

/// Serialise a response into `buf` (cleared first).
pub fn serialize_response(buf: &mut Vec<u8>, resp: &Response) {
    buf.clear();
    buf.extend_from_slice(resp.version.as_str().as_bytes());
    buf.push(b' ');
    let mut itoa_buf = itoa::Buffer::new();
    buf.extend_from_slice(itoa_buf.format(resp.status).as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(resp.reason.as_bytes());
    buf.extend_from_slice(b"\r\n");
    write_headers(buf, &resp.headers);
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(&resp.body);
}

fn write_headers(buf: &mut Vec<u8>, headers: &HeaderMap) {
    for (name, value) in headers.iter() {
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
}
