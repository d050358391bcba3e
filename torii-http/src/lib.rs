//! HTTP/1.1 wire protocol for the torii gateway.
//!
//! This crate owns everything between raw bytes and typed messages:
//! tokenizing request/status lines and headers (`codec`), buffered reads
//! and writes over a monoio byte stream (`stream`), and the per-connection
//! server/client engines (`engine`). TLS is invisible here — the engine is
//! generic over the stream, so a wrapped stream parses identically to a
//! plaintext one.

pub mod codec;
pub mod engine;
pub mod error;
pub mod stream;
pub mod types;

pub use codec::Limits;
pub use engine::{ClientConn, ServerConn};
pub use error::HttpError;
pub use stream::BufStream;
pub use types::{can_have_body, status_text, HeaderMap, Method, Request, Response, Version};

#[cfg(test)]
pub(crate) mod mock;
