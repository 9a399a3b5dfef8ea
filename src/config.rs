//! Server-level configuration consumed by session handlers.

use crate::session::transport::TransportKind;

/// Sentinel vhost used when virtual hosting is disabled or unspecified.
pub const DEFAULT_VHOST: &str = "__defaultVhost__";

/// Engine configuration.
///
/// Every knob a session handler reads lives here; the struct is shared
/// immutably through the [`Context`](crate::Context) so tests can build
/// isolated worlds with custom values.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Identification string included in every response `Server:` header
    /// and used as the RTCP SDES CNAME.
    pub server_name: String,
    /// Publisher liveness window in seconds. A pushing session idle for
    /// longer is shut down. UDP players get 4x this window because their
    /// only inbound traffic is periodic RTCP receiver reports.
    pub keep_alive_secs: u64,
    /// Deadline for obtaining a session id after connect. A connection
    /// still anonymous past this is treated as illegal and dropped.
    pub handshake_secs: u64,
    /// Traffic-report threshold in kilobytes. Sessions that moved at
    /// least this much fire the flow-report hook on disconnect.
    pub flow_report_threshold_kb: u64,
    /// When set, every session must negotiate exactly this transport;
    /// a mismatching SETUP is answered with 461.
    pub forced_transport: Option<TransportKind>,
    /// Merge-write window in milliseconds. A positive value trades
    /// latency for throughput by leaving Nagle enabled on data-plane
    /// connections.
    pub merge_write_ms: u64,
    /// TTL for outbound multicast RTP.
    pub multicast_ttl: u32,
    /// Inclusive multicast group address range the multicaster allocates
    /// from.
    pub multicast_addr_min: std::net::Ipv4Addr,
    pub multicast_addr_max: std::net::Ipv4Addr,
    /// Whether URL host names select a virtual host. When disabled every
    /// stream lives under [`DEFAULT_VHOST`].
    pub enable_vhost: bool,
    /// How long a player waits for an unregistered stream before 404,
    /// in milliseconds.
    pub max_stream_wait_ms: u64,
    /// Application name reserved for on-demand MP4 playback.
    pub record_app: String,
    /// Whether a registry miss may fall back to the MP4 loader hook.
    pub enable_mp4_fallback: bool,
    /// Grace period in milliseconds during which a disconnected publisher
    /// may reconnect and re-acquire its stream. Zero disables the grace.
    pub continue_push_ms: u64,
    /// Challenge clients with Basic instead of Digest. Digest is the
    /// default because it never puts the password on the wire.
    pub auth_basic: bool,
    /// First port the consecutive RTP/RTCP server pair allocator tries.
    pub udp_port_min: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "rtsp-relay/0.1".to_string(),
            keep_alive_secs: 15,
            handshake_secs: 15,
            flow_report_threshold_kb: 1024,
            forced_transport: None,
            merge_write_ms: 300,
            multicast_ttl: 64,
            multicast_addr_min: std::net::Ipv4Addr::new(239, 0, 0, 1),
            multicast_addr_max: std::net::Ipv4Addr::new(239, 255, 255, 255),
            enable_vhost: false,
            max_stream_wait_ms: 5_000,
            record_app: "record".to_string(),
            enable_mp4_fallback: true,
            continue_push_ms: 3_000,
            auth_basic: false,
            udp_port_min: 30_000,
        }
    }
}
