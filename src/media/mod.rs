//! Stream identity and media-source primitives.
//!
//! A live stream is identified by its schema ("rtsp", "rtmp", ...) plus a
//! [`MediaTuple`] of (vhost, app, stream, params). [`MediaInfo`] carries the
//! tuple together with everything parsed out of the request URL. Registered
//! streams are [`source::MediaSource`] values indexed by the
//! [`registry::MediaRegistry`].

pub mod registry;
pub mod ring;
pub mod source;

use crate::config::DEFAULT_VHOST;

/// Media source schemas in `find_any_schema` priority order.
pub const SCHEMA_RTMP: &str = "rtmp";
pub const SCHEMA_RTSP: &str = "rtsp";
pub const SCHEMA_TS: &str = "ts";
pub const SCHEMA_FMP4: &str = "fmp4";
pub const SCHEMA_HLS: &str = "hls";
pub const SCHEMA_HLS_FMP4: &str = "hls.fmp4";

/// Track kind carried by a stream. Doubles as the index into per-track
/// state arrays (video first, audio second).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackType {
    Video = 0,
    Audio = 1,
}

impl TrackType {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrackType::Video => "video",
            TrackType::Audio => "audio",
        }
    }
}

/// Identity key for a stream within a schema.
///
/// Two tuples are equal iff all four fields match. The vhost field holds
/// the [`DEFAULT_VHOST`] sentinel when virtual hosting is disabled or the
/// URL did not select one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaTuple {
    pub vhost: String,
    pub app: String,
    pub stream: String,
    pub params: String,
}

impl MediaTuple {
    pub fn new(vhost: &str, app: &str, stream: &str) -> Self {
        MediaTuple {
            vhost: if vhost.is_empty() {
                DEFAULT_VHOST.to_string()
            } else {
                vhost.to_string()
            },
            app: app.to_string(),
            stream: stream.to_string(),
            params: String::new(),
        }
    }

    /// `vhost/app/stream` for log lines.
    pub fn short_url(&self) -> String {
        format!("{}/{}/{}", self.vhost, self.app, self.stream)
    }
}

/// Everything parsed from a request URL: the identity tuple plus schema,
/// host, port and the raw query string.
#[derive(Debug, Clone, Default)]
pub struct MediaInfo {
    pub schema: String,
    pub vhost: String,
    pub app: String,
    pub stream: String,
    pub params: String,
    pub full_url: String,
    pub host: String,
    pub port: u16,
}

impl MediaInfo {
    /// Parse an RTSP URL into its identity parts.
    ///
    /// The query is split off first, then the schema at `://`, then path
    /// segments: the first is the app, the rest joined by `/` form the
    /// stream id. A `vhost=` query key overrides the host-derived vhost;
    /// `localhost` and IP literals always map to the default vhost.
    pub fn parse(url: &str, enable_vhost: bool) -> Self {
        let mut info = MediaInfo {
            full_url: url.to_string(),
            ..Default::default()
        };

        let mut rest = url;
        if let Some(pos) = rest.find('?') {
            info.params = rest[pos + 1..].to_string();
            rest = &rest[..pos];
        }

        if let Some(pos) = rest.find("://") {
            info.schema = rest[..pos].to_string();
            rest = &rest[pos + 3..];
        }

        let mut segments = rest.split('/');
        if let Some(host_port) = segments.next() {
            let (host, port) = split_host_port(host_port);
            info.host = host.to_string();
            info.port = port;
            info.vhost = host.to_string();
            if info.vhost == "localhost" || info.vhost.parse::<std::net::IpAddr>().is_ok() {
                info.vhost = DEFAULT_VHOST.to_string();
            }
        }
        if let Some(app) = segments.next() {
            info.app = app.to_string();
        }
        let stream: Vec<&str> = segments.collect();
        if !stream.is_empty() {
            info.stream = stream.join("/");
        }

        for pair in info.params.split('&') {
            if let Some(v) = pair.strip_prefix("vhost=") {
                if !v.is_empty() {
                    info.vhost = v.to_string();
                }
            }
        }

        if !enable_vhost || info.vhost.is_empty() {
            info.vhost = DEFAULT_VHOST.to_string();
        }

        info
    }

    pub fn tuple(&self) -> MediaTuple {
        MediaTuple {
            vhost: self.vhost.clone(),
            app: self.app.clone(),
            stream: self.stream.clone(),
            params: self.params.clone(),
        }
    }

    /// `vhost/app/stream` for log lines.
    pub fn short_url(&self) -> String {
        format!("{}/{}/{}", self.vhost, self.app, self.stream)
    }
}

fn split_host_port(host_port: &str) -> (&str, u16) {
    match host_port.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().unwrap_or(0)),
        None => (host_port, 0),
    }
}
