//! Broadcast ring of pre-packetized RTP frames.
//!
//! A [`MediaSource`](super::source::MediaSource) owns one ring; player
//! sessions attach [`RingReader`]s to it. The publisher's write path
//! dispatches each frame to every attached reader's callback. Readers also
//! install a detach callback (fired when the ring goes away underneath
//! them, i.e. the source was dropped) and an info callback used for
//! observability enumeration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::TrackType;

/// One RTP packet flowing through a source, with the side-band data the
/// data plane needs (stats, filtering, pacing).
#[derive(Debug)]
pub struct RtpFrame {
    pub track: TrackType,
    pub payload_type: u8,
    pub seq: u16,
    /// RTP timestamp in clock-rate units.
    pub timestamp: u32,
    /// Wall-clock milliseconds at ingest, the NTP side of the A/V sync pair.
    pub ntp_ms: u64,
    pub sample_rate: u32,
    /// The complete RTP packet (12-byte header included).
    pub data: Vec<u8>,
}

/// Identity a reader exposes for enumeration.
#[derive(Debug, Clone)]
pub struct ReaderInfo {
    pub session_id: String,
    pub peer_addr: String,
}

type FrameFn = Box<dyn Fn(&Arc<RtpFrame>) + Send + Sync>;
type DetachFn = Box<dyn FnOnce() + Send>;
type InfoFn = Box<dyn Fn() -> ReaderInfo + Send + Sync>;

struct ReaderSlot {
    id: u64,
    on_frame: FrameFn,
    on_detach: Mutex<Option<DetachFn>>,
    info: InfoFn,
}

/// Multi-reader frame fan-out.
pub struct RingBuffer {
    readers: Mutex<Vec<Arc<ReaderSlot>>>,
    next_id: AtomicU64,
}

impl RingBuffer {
    pub fn new() -> Arc<Self> {
        Arc::new(RingBuffer {
            readers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Attach a reader.
    ///
    /// `use_gop` is a delivery hint: `true` asks for playback to start at
    /// the last key frame. Live relays deliver from the next frame either
    /// way, the hint is carried for codec-aware sources.
    pub fn attach(
        ring: &Arc<Self>,
        _use_gop: bool,
        on_frame: FrameFn,
        on_detach: DetachFn,
        info: InfoFn,
    ) -> RingReader {
        let slot = Arc::new(ReaderSlot {
            id: ring.next_id.fetch_add(1, Ordering::Relaxed),
            on_frame,
            on_detach: Mutex::new(Some(on_detach)),
            info,
        });
        let id = slot.id;
        ring.readers.lock().push(slot);
        RingReader {
            ring: Arc::downgrade(ring),
            id,
        }
    }

    /// Dispatch one frame to every attached reader.
    pub fn write(&self, frame: Arc<RtpFrame>) {
        let snapshot: Vec<Arc<ReaderSlot>> = self.readers.lock().clone();
        for slot in &snapshot {
            (slot.on_frame)(&frame);
        }
    }

    pub fn reader_count(&self) -> usize {
        self.readers.lock().len()
    }

    /// Enumerate attached readers.
    pub fn reader_infos(&self) -> Vec<ReaderInfo> {
        self.readers.lock().iter().map(|s| (s.info)()).collect()
    }

    /// Fire every reader's detach callback and clear the list.
    ///
    /// Used when the source goes away while readers are still attached;
    /// the callbacks shut their sessions down.
    pub fn detach_all(&self) {
        let drained: Vec<Arc<ReaderSlot>> = self.readers.lock().drain(..).collect();
        for slot in drained {
            if let Some(cb) = slot.on_detach.lock().take() {
                cb();
            }
        }
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        // Readers still attached when the source dies must learn about it.
        self.detach_all();
    }
}

/// Handle owned by the attached session. Dropping it detaches quietly
/// (no detach callback — the reader left on its own).
pub struct RingReader {
    ring: Weak<RingBuffer>,
    id: u64,
}

impl Drop for RingReader {
    fn drop(&mut self) {
        if let Some(ring) = self.ring.upgrade() {
            ring.readers.lock().retain(|s| s.id != self.id);
        }
    }
}
