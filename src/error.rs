//! Error types for the RTSP session engine.

use std::fmt;

/// Errors that can occur in the library API.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse) — malformed RTSP messages.
/// - **Transport**: [`Io`](Self::Io) — socket/network failures,
///   [`PortRangeExhausted`](Self::PortRangeExhausted) — no consecutive
///   UDP port pair available.
/// - **Registry**: [`AlreadyExists`](Self::AlreadyExists) — a different
///   source is registered at the same (schema, vhost, app, stream) slot.
/// - **Server**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning),
///   [`InvalidBindAddress`](Self::InvalidBindAddress).
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A different media source already occupies the registry slot.
    #[error("media source already existed: {0}")]
    AlreadyExists(String),

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// Bind address was not `host:port` with an explicit non-zero port.
    #[error("invalid bind address: {0}")]
    InvalidBindAddress(String),

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// Consecutive RTP/RTCP server port allocation failed.
    #[error("no consecutive udp port pair available")]
    PortRangeExhausted,

    /// Multicast group address pool exhausted.
    #[error("multicast address pool exhausted")]
    MulticastExhausted,
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// The signaling buffer exceeded the allowed size without a complete message.
    Oversized,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::Oversized => write!(f, "request exceeds buffer limit"),
        }
    }
}

/// Convenience alias for `Result<T, RelayError>`.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Recoverable "shutdown with reason" condition raised by session handlers.
///
/// Handlers never write error responses themselves for the common cases —
/// they return this value and the session loop centralizes the response
/// and the shutdown path. `status: None` means the response (if any) was
/// already written by the handler and only the shutdown remains.
#[derive(Debug)]
pub struct SessionError {
    /// RTSP status code to reply with, or `None` if already replied.
    pub status: Option<u16>,
    /// Reason recorded in the disconnect log.
    pub reason: String,
    /// Whether the connection must be torn down after the reply.
    pub close: bool,
}

impl SessionError {
    /// Reply with `status` and keep the connection open.
    pub fn reply(status: u16, reason: impl Into<String>) -> Self {
        SessionError {
            status: Some(status),
            reason: reason.into(),
            close: false,
        }
    }

    /// Reply with `status`, then tear the connection down.
    pub fn fatal(status: u16, reason: impl Into<String>) -> Self {
        SessionError {
            status: Some(status),
            reason: reason.into(),
            close: true,
        }
    }

    /// Tear down without writing a response (already replied, or peer gone).
    pub fn shutdown(reason: impl Into<String>) -> Self {
        SessionError {
            status: None,
            reason: reason.into(),
            close: true,
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "{} {}", code, self.reason),
            None => write!(f, "{}", self.reason),
        }
    }
}

/// Standard reason phrase for the status codes the engine emits.
pub fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Stream Not Found",
        406 => "Not Acceptable",
        454 => "Session Not Found",
        461 => "Unsupported Transport",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}
