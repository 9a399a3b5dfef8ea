//! Signaling-stream splitter.
//!
//! Three byte classes share the RTSP TCP connection: `$`-prefixed
//! interleaved RTP/RTCP frames (only once RTP-over-TCP was negotiated),
//! CRLF×2-terminated text requests, and request bodies sized by
//! `Content-Length`. The splitter is a pull-based state machine: feed it
//! raw bytes with [`push`](RtspSplitter::push), then drain complete
//! messages with [`next`](RtspSplitter::next).

use crate::error::{RelayError, SessionError};

use super::request::RtspRequest;

/// Interleaved frame header: `$`, channel, 16-bit big-endian length.
pub fn encode_interleaved_header(channel: u8, len: u16) -> [u8; 4] {
    [0x24, channel, (len >> 8) as u8, (len & 0xff) as u8]
}

/// One complete message pulled out of the stream.
#[derive(Debug)]
pub enum SplitterOutput {
    Request(RtspRequest),
    /// An interleaved RTP (even channel) or RTCP (odd channel) frame.
    Frame { channel: u8, payload: Vec<u8> },
}

/// Cap on the buffered signaling data; a request head larger than this
/// is a protocol violation.
const MAX_BUFFER: usize = 64 * 1024;

pub struct RtspSplitter {
    buf: Vec<u8>,
    interleaved: bool,
}

impl RtspSplitter {
    pub fn new() -> Self {
        RtspSplitter {
            buf: Vec::new(),
            interleaved: false,
        }
    }

    /// Enable `$`-frame recognition. Off until the first TCP SETUP —
    /// before that a `$` byte is just a malformed request.
    pub fn enable_interleaved(&mut self, on: bool) {
        self.interleaved = on;
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes not yet consumed. A POST under the HTTP tunnel takes the
    /// whole remaining stream as its "body".
    pub fn take_rest(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// Pull the next complete message, or `None` when more bytes are
    /// needed.
    pub fn next(&mut self) -> Result<Option<SplitterOutput>, SessionError> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        if self.interleaved && self.buf[0] == 0x24 {
            if self.buf.len() < 4 {
                return Ok(None);
            }
            let channel = self.buf[1];
            let len = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
            if self.buf.len() < 4 + len {
                return Ok(None);
            }
            let payload = self.buf[4..4 + len].to_vec();
            self.buf.drain(..4 + len);
            return Ok(Some(SplitterOutput::Frame { channel, payload }));
        }

        let head_end = match find_head_end(&self.buf) {
            Some(pos) => pos,
            None => {
                if self.buf.len() > MAX_BUFFER {
                    return Err(SessionError::fatal(400, "request exceeds buffer limit"));
                }
                return Ok(None);
            }
        };

        let head = String::from_utf8_lossy(&self.buf[..head_end]).into_owned();
        let mut request = RtspRequest::parse(&head).map_err(|e| match e {
            RelayError::Parse { kind } => SessionError::fatal(400, kind.to_string()),
            other => SessionError::fatal(400, other.to_string()),
        })?;

        // POST body length is the remaining stream; the caller switches
        // to tunnel forwarding and drains via take_rest().
        let content_length = if request.method == "POST" {
            0
        } else {
            request.content_length()
        };
        if self.buf.len() < head_end + 4 + content_length {
            return Ok(None);
        }

        request.body = self.buf[head_end + 4..head_end + 4 + content_length].to_vec();
        self.buf.drain(..head_end + 4 + content_length);
        Ok(Some(SplitterOutput::Request(request)))
    }
}

impl Default for RtspSplitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Position of the `\r\n\r\n` terminator, if present.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(s: &mut RtspSplitter) -> Vec<SplitterOutput> {
        let mut out = Vec::new();
        while let Some(msg) = s.next().unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn request_in_one_chunk() {
        let mut s = RtspSplitter::new();
        s.push(b"OPTIONS rtsp://h/a/s RTSP/1.0\r\nCSeq: 1\r\n\r\n");
        let out = drain(&mut s);
        assert_eq!(out.len(), 1);
        match &out[0] {
            SplitterOutput::Request(req) => assert_eq!(req.method, "OPTIONS"),
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn request_split_at_arbitrary_boundaries() {
        let raw = b"DESCRIBE rtsp://h/a/s RTSP/1.0\r\nCSeq: 2\r\n\r\n";
        for split in 1..raw.len() - 1 {
            let mut s = RtspSplitter::new();
            s.push(&raw[..split]);
            assert!(s.next().unwrap().is_none() || split == raw.len());
            s.push(&raw[split..]);
            let out = drain(&mut s);
            assert_eq!(out.len(), 1, "split at {}", split);
        }
    }

    #[test]
    fn body_waits_for_content_length() {
        let mut s = RtspSplitter::new();
        s.push(b"ANNOUNCE rtsp://h/a/s RTSP/1.0\r\nCSeq: 1\r\nContent-Length: 5\r\n\r\nv=");
        assert!(s.next().unwrap().is_none());
        s.push(b"0\r\n");
        let out = drain(&mut s);
        match &out[0] {
            SplitterOutput::Request(req) => assert_eq!(req.body, b"v=0\r\n"),
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn interleaved_frames_require_enable() {
        let mut s = RtspSplitter::new();
        s.push(&[0x24, 0, 0, 2, 0xaa, 0xbb]);
        // Without interleaved mode this looks like garbage text and stalls
        // until the buffer cap (no CRLFCRLF); with it, it is a frame.
        assert!(s.next().unwrap().is_none());

        let mut s = RtspSplitter::new();
        s.enable_interleaved(true);
        s.push(&[0x24, 0, 0, 2, 0xaa, 0xbb]);
        match s.next().unwrap() {
            Some(SplitterOutput::Frame { channel, payload }) => {
                assert_eq!(channel, 0);
                assert_eq!(payload, vec![0xaa, 0xbb]);
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn interleaved_roundtrip_various_lengths() {
        for len in [0usize, 1, 2, 255, 256, 1400, 65535] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let mut wire = encode_interleaved_header(5, len as u16).to_vec();
            wire.extend_from_slice(&payload);

            let mut s = RtspSplitter::new();
            s.enable_interleaved(true);
            // Feed in two chunks to exercise partial-frame buffering.
            let cut = wire.len() / 2;
            s.push(&wire[..cut]);
            let _ = s.next().unwrap();
            s.push(&wire[cut..]);
            match s.next().unwrap() {
                Some(SplitterOutput::Frame { channel, payload: got }) => {
                    assert_eq!(channel, 5);
                    assert_eq!(got, payload, "len {}", len);
                }
                other => panic!("len {}: expected frame, got {:?}", len, other),
            }
        }
    }

    #[test]
    fn frames_and_requests_interleave() {
        let mut s = RtspSplitter::new();
        s.enable_interleaved(true);
        s.push(&[0x24, 2, 0, 1, 0x99]);
        s.push(b"GET_PARAMETER rtsp://h/a/s RTSP/1.0\r\nCSeq: 9\r\n\r\n");
        s.push(&[0x24, 3, 0, 1, 0x77]);

        let out = drain(&mut s);
        assert_eq!(out.len(), 3);
        assert!(matches!(out[0], SplitterOutput::Frame { channel: 2, .. }));
        assert!(matches!(out[1], SplitterOutput::Request(_)));
        assert!(matches!(out[2], SplitterOutput::Frame { channel: 3, .. }));
    }

    #[test]
    fn post_body_is_rest_of_stream() {
        let mut s = RtspSplitter::new();
        s.push(b"POST /index HTTP/1.0\r\nx-sessioncookie: abc\r\nContent-Length: 32767\r\n\r\nSTICKY");
        let out = drain(&mut s);
        assert_eq!(out.len(), 1, "POST must not wait for Content-Length");
        assert_eq!(s.take_rest(), b"STICKY");
    }

    #[test]
    fn oversized_garbage_is_fatal() {
        let mut s = RtspSplitter::new();
        s.push(&vec![b'x'; MAX_BUFFER + 1]);
        assert!(s.next().is_err());
    }
}
