use thiserror::Error;

/// Errors raised by the wire layer. Every variant is fatal to the
/// connection it occurred on — there is no in-band recovery from a
/// framing violation or a half-read message.
#[derive(Error, Debug)]
pub enum HttpError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("timed out while {0}")]
    Timeout(&'static str),

    #[error("connection closed mid-message")]
    PrematureClose,
}

impl HttpError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        HttpError::Malformed(msg.into())
    }

    /// True when the peer vanished before a single byte of the current
    /// message arrived — the one case the server loop exits silently.
    pub fn is_premature_close(&self) -> bool {
        matches!(self, HttpError::PrematureClose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            HttpError::malformed("bad chunk size").to_string(),
            "malformed message: bad chunk size"
        );
        assert_eq!(
            HttpError::Timeout("reading request head").to_string(),
            "timed out while reading request head"
        );
        assert_eq!(
            HttpError::PrematureClose.to_string(),
            "connection closed mid-message"
        );
    }

    #[test]
    fn io_error_converts() {
        let err: HttpError = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "rst").into();
        assert!(matches!(err, HttpError::Io(_)));
    }
}
