//! A registered live stream and its per-track state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use super::registry::RegistryShared;
use super::ring::{RingBuffer, RtpFrame};
use super::{MediaTuple, TrackType};

/// Live per-track observers a player needs to seed its RTP-Info and
/// transport headers: the publisher's SSRC and the most recent
/// sequence/timestamp seen.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackObserver {
    pub ssrc: u32,
    pub seq: u16,
    /// Last RTP timestamp in clock-rate units.
    pub rtp_ts: u32,
    /// Last RTP timestamp converted to milliseconds.
    pub stamp_ms: u64,
    pub sample_rate: u32,
}

/// A live media source registered under (schema, vhost, app, stream).
///
/// Kept alive by its owning session (or by a delayed release task during
/// the publisher-reconnect grace); the registry only holds a weak
/// reference. Dropping the source unregisters it and detaches any
/// remaining readers.
pub struct MediaSource {
    schema: String,
    tuple: MediaTuple,
    created: Instant,
    sdp: RwLock<String>,
    ring: Arc<RingBuffer>,
    owned: AtomicBool,
    paused: AtomicBool,
    speed: Mutex<f64>,
    tracks: Mutex<[TrackObserver; 2]>,
    bytes: AtomicU64,
    /// Set by `regist`; used by `Drop` to unregister exactly this object.
    registry: Mutex<Weak<RegistryShared>>,
}

impl MediaSource {
    pub fn new(schema: &str, tuple: MediaTuple) -> Arc<Self> {
        Arc::new(MediaSource {
            schema: schema.to_string(),
            tuple,
            created: Instant::now(),
            sdp: RwLock::new(String::new()),
            ring: RingBuffer::new(),
            owned: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            speed: Mutex::new(1.0),
            tracks: Mutex::new([TrackObserver::default(); 2]),
            bytes: AtomicU64::new(0),
            registry: Mutex::new(Weak::new()),
        })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn tuple(&self) -> &MediaTuple {
        &self.tuple
    }

    pub fn url(&self) -> String {
        format!("{}://{}", self.schema, self.tuple.short_url())
    }

    pub fn alive_secs(&self) -> u64 {
        self.created.elapsed().as_secs()
    }

    pub fn sdp(&self) -> String {
        self.sdp.read().clone()
    }

    pub fn set_sdp(&self, sdp: &str) {
        *self.sdp.write() = sdp.to_string();
    }

    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    pub fn reader_count(&self) -> usize {
        self.ring.reader_count()
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Acquire the single-holder publisher token.
    ///
    /// Test-and-set: the first caller gets a guard, everyone else `None`
    /// until the guard drops.
    pub fn acquire_ownership(this: &Arc<Self>) -> Option<Ownership> {
        if this.owned.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(Ownership {
            source: Arc::downgrade(this),
        })
    }

    /// Suspend or resume frame delivery to readers.
    pub fn pause(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    /// Playback speed requested via `Scale:`. Stored for observability;
    /// a live relay cannot rescale the publisher's clock.
    pub fn set_speed(&self, speed: f64) {
        *self.speed.lock() = speed;
    }

    /// Absolute seek in milliseconds. Live sources are not seekable, so
    /// this reports failure and the caller falls back to GOP delivery.
    pub fn seek_to(&self, _pos_ms: u64) -> bool {
        false
    }

    pub fn track(&self, t: TrackType) -> TrackObserver {
        self.tracks.lock()[t.index()]
    }

    /// Newest timestamp across tracks, for the `Range: npt=` header.
    pub fn newest_stamp_ms(&self) -> u64 {
        let tracks = self.tracks.lock();
        tracks[0].stamp_ms.max(tracks[1].stamp_ms)
    }

    /// Ingest one publisher RTP packet: update track observers and byte
    /// accounting, then fan out to readers unless paused.
    pub fn write_rtp(&self, frame: Arc<RtpFrame>) {
        {
            let mut tracks = self.tracks.lock();
            let obs = &mut tracks[frame.track.index()];
            obs.seq = frame.seq;
            obs.rtp_ts = frame.timestamp;
            obs.sample_rate = frame.sample_rate;
            if frame.sample_rate > 0 {
                obs.stamp_ms = frame.timestamp as u64 * 1000 / frame.sample_rate as u64;
            }
        }
        self.bytes.fetch_add(frame.data.len() as u64, Ordering::Relaxed);
        if !self.paused.load(Ordering::Relaxed) {
            self.ring.write(frame);
        }
    }

    /// Record the publisher-side SSRC for a track (from SETUP/ingest).
    pub fn set_track_ssrc(&self, t: TrackType, ssrc: u32) {
        self.tracks.lock()[t.index()].ssrc = ssrc;
    }

    pub(super) fn bind_registry(&self, shared: &Arc<RegistryShared>) {
        *self.registry.lock() = Arc::downgrade(shared);
    }
}

impl Drop for MediaSource {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.lock().upgrade() {
            registry.unregist_ptr(&self.schema, &self.tuple, self as *const MediaSource);
        }
        // RingBuffer::drop fires remaining reader detach callbacks.
    }
}

/// Scoped publisher token. Exactly one exists per source at a time;
/// dropping it reopens the slot for a reconnecting pusher.
pub struct Ownership {
    source: Weak<MediaSource>,
}

impl Drop for Ownership {
    fn drop(&mut self) {
        if let Some(source) = self.source.upgrade() {
            source.owned.store(false, Ordering::Release);
        }
    }
}
