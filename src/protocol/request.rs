//! RTSP request parsing (RFC 2326 §6).

use crate::error::{ParseErrorKind, RelayError};

/// A parsed RTSP (or tunneled HTTP) request.
///
/// Requests follow HTTP/1.1 syntax:
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// Header lookup is case-insensitive per RFC 2326 §4.2. The body is
/// attached by the splitter once `Content-Length` bytes are available.
#[derive(Debug)]
pub struct RtspRequest {
    /// Request method (OPTIONS, DESCRIBE, SETUP, ... or GET/POST).
    pub method: String,
    /// Request-URI (e.g. `rtsp://host:port/app/stream/trackID=0`).
    pub uri: String,
    /// Protocol version (`RTSP/1.0`, or `HTTP/1.0` for tunnel requests).
    pub version: String,
    /// Headers as ordered (name, value) pairs. Names are stored
    /// as-received; lookups are case-insensitive.
    pub headers: Vec<(String, String)>,
    /// Request body (SDP for ANNOUNCE, base64 stickiness for POST).
    pub body: Vec<u8>,
}

impl RtspRequest {
    /// Parse the head of a request (request line + headers, no body).
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let mut lines = raw.lines();

        let request_line = lines.next().ok_or(RelayError::Parse {
            kind: ParseErrorKind::EmptyRequest,
        })?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(RelayError::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            });
        }

        let method = parts[0].to_string();
        let uri = parts[1].to_string();
        let version = parts[2].to_string();

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let colon_pos = line.find(':').ok_or(RelayError::Parse {
                kind: ParseErrorKind::InvalidHeader,
            })?;
            let name = line[..colon_pos].trim().to_string();
            let value = line[colon_pos + 1..].trim().to_string();
            headers.push((name, value));
        }

        Ok(RtspRequest {
            method,
            uri,
            version,
            headers,
            body: Vec::new(),
        })
    }

    /// Look up a header value by name (case-insensitive, RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The CSeq header, which numbers and orders request/response pairs
    /// (RFC 2326 §12.17). Every response must echo it.
    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }

    /// `Content-Length` as a usize, 0 when absent or unparseable.
    pub fn content_length(&self) -> usize {
        self.get_header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// The session id with any `;timeout=` suffix stripped.
    pub fn session_id(&self) -> Option<&str> {
        self.get_header("Session")
            .map(|s| s.split(';').next().unwrap_or(s).trim())
    }

    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}
