//! RTSP response building (RFC 2326 §7).

use crate::error::status_text;

/// An RTSP (or tunneled HTTP/1.0) response.
///
/// Serializes to the standard text format:
///
/// ```text
/// RTSP/1.0 200 OK\r\n
/// CSeq: 1\r\n
/// Content-Type: application/sdp\r\n
/// Content-Length: 142\r\n
/// \r\n
/// v=0\r\n...
/// ```
///
/// Uses a builder pattern — chain [`add_header`](Self::add_header),
/// [`with_sdp`](Self::with_sdp), [`with_protocol`](Self::with_protocol),
/// then call [`serialize`](Self::serialize). `Content-Length` is computed
/// automatically when a body is present.
#[must_use]
pub struct RtspResponse {
    pub status_code: u16,
    pub status_text: String,
    pub protocol: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl RtspResponse {
    pub fn new(status_code: u16) -> Self {
        RtspResponse {
            status_code,
            status_text: status_text(status_code).to_string(),
            protocol: "RTSP/1.0".to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// 200 OK — success (RFC 2326 §7.1.1).
    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Attach an SDP body; `Content-Type: application/sdp` is implied.
    pub fn with_sdp(mut self, sdp: String) -> Self {
        self.headers
            .push(("Content-Type".to_string(), "application/sdp".to_string()));
        self.body = Some(sdp);
        self
    }

    /// Attach a plain-text body (error explanations).
    pub fn with_text(mut self, text: &str) -> Self {
        self.headers
            .push(("Content-Type".to_string(), "text/plain".to_string()));
        self.body = Some(text.to_string());
        self
    }

    /// Switch the start line protocol; HTTP tunnel replies use `HTTP/1.0`.
    pub fn with_protocol(mut self, protocol: &str) -> Self {
        self.protocol = protocol.to_string();
        self
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Serialize to the wire format. If a body is present,
    /// `Content-Length` is appended automatically (RFC 2326 §12.14).
    pub fn serialize(&self) -> String {
        let mut response = format!(
            "{} {} {}\r\n",
            self.protocol, self.status_code, self.status_text
        );

        for (name, value) in &self.headers {
            response.push_str(&format!("{}: {}\r\n", name, value));
        }

        if let Some(body) = &self.body {
            response.push_str(&format!("Content-Length: {}\r\n", body.len()));
            response.push_str("\r\n");
            response.push_str(body);
        } else {
            response.push_str("\r\n");
        }
        response
    }
}

/// `Date:` header value, RFC 1123 format in GMT.
pub fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}
