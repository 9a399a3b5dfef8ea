//! Transport negotiation (RFC 2326 §12.39).
//!
//! A session picks exactly one RTP transport at its first SETUP and every
//! later SETUP must agree. The server may also be configured to force a
//! specific transport; a mismatching client is refused with 461.
//!
//! ## Wire format examples
//!
//! ```text
//! Transport: RTP/AVP/TCP;unicast;interleaved=0-1
//! Transport: RTP/AVP;unicast;client_port=8000-8001
//! Transport: RTP/AVP;multicast;ttl=127
//! ```

/// RTP transport flavor. Monotone per session: once set away from
/// `Invalid` it never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Invalid,
    Tcp,
    Udp,
    Multicast,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Invalid => "Invalid",
            TransportKind::Tcp => "TCP",
            TransportKind::Udp => "UDP",
            TransportKind::Multicast => "MULTICAST",
        }
    }

    /// Classify a client's `Transport:` header. Anything that is neither
    /// TCP nor multicast is treated as unicast UDP.
    pub fn from_header(header: &str) -> TransportKind {
        if header.contains("TCP") {
            TransportKind::Tcp
        } else if header.to_ascii_lowercase().contains("multicast") {
            TransportKind::Multicast
        } else {
            TransportKind::Udp
        }
    }
}

/// Client-supplied transport parameters extracted from the header.
#[derive(Debug, Clone, Default)]
pub struct TransportSpec {
    /// `interleaved=a-b` channel pair (TCP).
    pub interleaved: Option<(u8, u8)>,
    /// `client_port=a-b` port pair (unicast UDP).
    pub client_port: Option<(u16, u16)>,
}

impl TransportSpec {
    /// Parse the semicolon-separated parameter list.
    pub fn parse(header: &str) -> Self {
        let mut spec = TransportSpec::default();
        for part in header.split(';') {
            let part = part.trim();
            if let Some(pair) = part.strip_prefix("interleaved=") {
                spec.interleaved = parse_pair(pair);
            } else if let Some(pair) = part.strip_prefix("client_port=") {
                spec.client_port = parse_pair(pair);
            }
        }
        spec
    }
}

fn parse_pair<T: std::str::FromStr>(pair: &str) -> Option<(T, T)> {
    let (a, b) = pair.split_once('-')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

/// Format an SSRC for `Transport:` / `RTP-Info` headers.
pub fn format_ssrc(ssrc: u32) -> String {
    format!("{:08x}", ssrc)
}
