//! SDP track scanning (RFC 4566 / RFC 8866).
//!
//! The engine relays pre-packetized RTP and treats SDP as opaque text,
//! but the session needs the per-track facts out of it: kind, payload
//! type, clock rate, and the control URL. This module extracts exactly
//! that from the `m=`, `a=rtpmap:` and `a=control:` lines:
//!
//! ```text
//! m=video 0 RTP/AVP 96          ← media description
//! a=rtpmap:96 H264/90000        ← codec/clock rate
//! a=control:trackID=0           ← track control URL
//! m=audio 0 RTP/AVP 97
//! a=rtpmap:97 MPEG4-GENERIC/44100/2
//! a=control:trackID=1
//! ```

use crate::media::TrackType;

/// Per-track session state seeded from SDP and mutated across
/// SETUP/PLAY/RECORD.
#[derive(Debug, Clone)]
pub struct SdpTrack {
    pub ttype: TrackType,
    pub payload_type: u8,
    /// RTP clock rate in Hz (90000 video default, 8000 audio default).
    pub sample_rate: u32,
    /// Raw `a=control:` value, absolute or relative.
    pub control: String,
    pub ssrc: u32,
    pub seq: u16,
    pub timestamp: u32,
    /// Interleaved RTP channel once SETUP assigned one (RTCP is +1).
    pub interleaved: Option<u8>,
    /// Set by SETUP; a track may be set up at most once per session.
    pub inited: bool,
}

impl SdpTrack {
    /// Resolve the control URL against the session's content base.
    pub fn control_url(&self, content_base: &str) -> String {
        if self.control.starts_with("rtsp://") || self.control.starts_with("rtsps://") {
            return self.control.clone();
        }
        format!("{}/{}", content_base.trim_end_matches('/'), self.control)
    }
}

/// Extract the video/audio tracks out of an SDP body. Media sections of
/// other kinds (`m=application`, ...) are skipped.
pub fn scan_tracks(sdp: &str) -> Vec<SdpTrack> {
    let mut tracks: Vec<SdpTrack> = Vec::new();
    let mut current: Option<SdpTrack> = None;

    for line in sdp.lines() {
        let line = line.trim_end();
        if let Some(media) = line.strip_prefix("m=") {
            if let Some(track) = current.take() {
                tracks.push(track);
            }
            current = parse_media_line(media);
            continue;
        }
        let Some(track) = current.as_mut() else {
            continue;
        };
        if let Some(rtpmap) = line.strip_prefix("a=rtpmap:") {
            // "96 H264/90000" — only honor the rtpmap of our payload type.
            let mut parts = rtpmap.split_whitespace();
            let pt: Option<u8> = parts.next().and_then(|p| p.parse().ok());
            if pt == Some(track.payload_type) {
                if let Some(codec) = parts.next() {
                    if let Some(rate) = codec.split('/').nth(1).and_then(|r| r.parse().ok()) {
                        track.sample_rate = rate;
                    }
                }
            }
        } else if let Some(control) = line.strip_prefix("a=control:") {
            track.control = control.trim().to_string();
        }
    }
    if let Some(track) = current.take() {
        tracks.push(track);
    }
    tracks
}

fn parse_media_line(media: &str) -> Option<SdpTrack> {
    // "video 0 RTP/AVP 96"
    let mut parts = media.split_whitespace();
    let ttype = match parts.next()? {
        "video" => TrackType::Video,
        "audio" => TrackType::Audio,
        _ => return None,
    };
    let payload_type: u8 = parts.nth(2).and_then(|p| p.parse().ok())?;
    Some(SdpTrack {
        ttype,
        payload_type,
        sample_rate: match ttype {
            TrackType::Video => 90_000,
            TrackType::Audio => 8_000,
        },
        control: String::new(),
        ssrc: 0,
        seq: 0,
        timestamp: 0,
        interleaved: None,
        inited: false,
    })
}
