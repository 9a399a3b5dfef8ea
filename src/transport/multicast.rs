//! Shared multicast senders.
//!
//! Unlike unicast transports, the multicast data plane is owned by a
//! [`RtpMulticaster`] shared by every session playing the same stream on
//! the same local interface. The multicaster attaches its own ring reader
//! to the source and pushes RTP to the group; sessions only contribute
//! their liveness/detach callbacks and the shared RTCP socket convention
//! (RTCP port = RTP port + 1). When the ring detaches (source gone) every
//! subscribed session is shut down.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::ServerConfig;
use crate::error::{RelayError, Result};
use crate::media::ring::{ReaderInfo, RingBuffer, RingReader, RtpFrame};
use crate::media::source::MediaSource;
use crate::media::TrackType;
use crate::rtcp::{create_sdes, RtcpContext, RtcpFlavor};
use crate::transport::udp::PortAllocator;

const RTCP_INTERVAL: Duration = Duration::from_secs(5);

struct Subscriber {
    peer_ip: IpAddr,
    on_alive: Arc<dyn Fn() + Send + Sync>,
    on_detach: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

struct McTrackState {
    rtcp: RtcpContext,
    last_report: Option<Instant>,
}

struct McTrack {
    rtp: Arc<UdpSocket>,
    rtcp: Arc<UdpSocket>,
    rtp_port: u16,
    state: Mutex<McTrackState>,
}

/// One multicast group serving one stream on one local interface.
pub struct RtpMulticaster {
    group: Ipv4Addr,
    local_ip: IpAddr,
    ttl: u32,
    cname: String,
    tracks: [McTrack; 2],
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    /// Keeps the ring attachment alive for the multicaster's lifetime.
    reader: Mutex<Option<RingReader>>,
}

impl RtpMulticaster {
    pub fn group_ip(&self) -> Ipv4Addr {
        self.group
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    /// RTP port for a track type; RTCP is this + 1.
    pub fn rtp_port(&self, t: TrackType) -> u16 {
        self.tracks[t.index()].rtp_port
    }

    /// Register a session: `on_alive` resets its liveness ticker when a
    /// receiver report arrives from its address, `on_detach` shuts it
    /// down when the source goes away.
    pub fn subscribe(
        &self,
        tag: u64,
        peer_ip: IpAddr,
        on_alive: Arc<dyn Fn() + Send + Sync>,
        on_detach: Box<dyn FnOnce() + Send>,
    ) {
        self.subscribers.lock().insert(
            tag,
            Subscriber {
                peer_ip,
                on_alive,
                on_detach: Mutex::new(Some(on_detach)),
            },
        );
    }

    pub fn unsubscribe(&self, tag: u64) {
        self.subscribers.lock().remove(&tag);
    }

    fn fire_detach(&self) {
        let subscribers: Vec<Subscriber> = {
            let mut map = self.subscribers.lock();
            map.drain().map(|(_, s)| s).collect()
        };
        for sub in subscribers {
            if let Some(cb) = sub.on_detach.lock().take() {
                cb();
            }
        }
    }

    fn keep_alive_from(&self, from: IpAddr) {
        let map = self.subscribers.lock();
        for sub in map.values() {
            if sub.peer_ip == from {
                (sub.on_alive)();
            }
        }
    }

    /// Push one frame to the group, with the 5-second SR/SDES cadence.
    fn send_frame(&self, frame: &Arc<RtpFrame>) {
        let track = &self.tracks[frame.track.index()];
        let ssrc = if frame.data.len() >= 12 {
            u32::from_be_bytes([frame.data[8], frame.data[9], frame.data[10], frame.data[11]])
        } else {
            return;
        };

        let report = {
            let mut state = track.state.lock();
            state.rtcp.on_rtp(
                frame.seq,
                frame.timestamp,
                frame.ntp_ms,
                frame.sample_rate,
                frame.data.len(),
            );
            let due = state
                .last_report
                .map(|at| at.elapsed() >= RTCP_INTERVAL)
                .unwrap_or(true);
            if due {
                state.last_report = Some(Instant::now());
                Some(state.rtcp.create_sr(ssrc))
            } else {
                None
            }
        };

        if let Some(sr) = report {
            let rtcp_dest = SocketAddr::new(IpAddr::V4(self.group), track.rtp_port + 1);
            let _ = track.rtcp.send_to(&sr, rtcp_dest);
            let _ = track.rtcp.send_to(&create_sdes(ssrc, &self.cname), rtcp_dest);
        }

        let dest = SocketAddr::new(IpAddr::V4(self.group), track.rtp_port);
        if let Err(e) = track.rtp.send_to(&frame.data, dest) {
            tracing::warn!(group = %self.group, error = %e, "multicast rtp send failed");
        }
    }
}

/// Table of live multicasters keyed by (local ip, stream url).
pub struct MulticastTable {
    table: Mutex<HashMap<(IpAddr, String), Weak<RtpMulticaster>>>,
    group_next: AtomicU32,
}

impl MulticastTable {
    pub fn new() -> Arc<Self> {
        Arc::new(MulticastTable {
            table: Mutex::new(HashMap::new()),
            group_next: AtomicU32::new(0),
        })
    }

    /// Acquire (or join) the multicaster for a stream.
    pub fn get_or_create(
        &self,
        cfg: &ServerConfig,
        ports: &PortAllocator,
        local_ip: IpAddr,
        source: &Arc<MediaSource>,
    ) -> Result<Arc<RtpMulticaster>> {
        let key = (local_ip, source.url());
        let mut table = self.table.lock();
        if let Some(existing) = table.get(&key).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let group = self.next_group(cfg);
        let make_track = |_t: TrackType| -> Result<McTrack> {
            let pair = ports.bind_pair(local_ip)?;
            pair.rtp.set_multicast_ttl_v4(cfg.multicast_ttl)?;
            Ok(McTrack {
                rtp: pair.rtp.clone(),
                rtcp: pair.rtcp.clone(),
                rtp_port: pair.rtp_port,
                state: Mutex::new(McTrackState {
                    rtcp: RtcpContext::new(RtcpFlavor::Send),
                    last_report: None,
                }),
            })
        };

        let caster = Arc::new(RtpMulticaster {
            group,
            local_ip,
            ttl: cfg.multicast_ttl,
            cname: cfg.server_name.clone(),
            tracks: [make_track(TrackType::Video)?, make_track(TrackType::Audio)?],
            subscribers: Mutex::new(HashMap::new()),
            reader: Mutex::new(None),
        });

        // The ring closures hold the multicaster weakly: its lifetime is
        // governed by the subscribing sessions, not by the source.
        let weak = Arc::downgrade(&caster);
        let on_frame = {
            let weak = weak.clone();
            Box::new(move |frame: &Arc<RtpFrame>| {
                if let Some(caster) = weak.upgrade() {
                    caster.send_frame(frame);
                }
            })
        };
        let on_detach = {
            let weak = weak.clone();
            Box::new(move || {
                if let Some(caster) = weak.upgrade() {
                    caster.fire_detach();
                }
            })
        };
        let group_str = group.to_string();
        let info = Box::new(move || ReaderInfo {
            session_id: "multicast".to_string(),
            peer_addr: group_str.clone(),
        });
        let reader = RingBuffer::attach(source.ring(), true, on_frame, on_detach, info);
        *caster.reader.lock() = Some(reader);

        Self::spawn_rtcp_reader(&caster, TrackType::Video);
        Self::spawn_rtcp_reader(&caster, TrackType::Audio);

        table.insert(key, Arc::downgrade(&caster));
        tracing::info!(group = %group, url = %source.url(), "multicaster created");
        Ok(caster)
    }

    /// Receiver-report reader: multicast players address their RTCP to
    /// the shared (group, rtp port + 1) socket; any report from a
    /// subscriber's address counts as its keep-alive.
    fn spawn_rtcp_reader(caster: &Arc<RtpMulticaster>, t: TrackType) {
        let sock = caster.tracks[t.index()].rtcp.clone();
        if let (IpAddr::V4(local), group) = (caster.local_ip, caster.group) {
            let _ = sock.join_multicast_v4(&group, &local);
        }
        let _ = sock.set_read_timeout(Some(Duration::from_millis(500)));
        let weak = Arc::downgrade(caster);
        std::thread::spawn(move || {
            let mut buf = [0u8; 1500];
            loop {
                let Some(caster) = weak.upgrade() else {
                    return;
                };
                match sock.recv_from(&mut buf) {
                    Ok((_, from)) => caster.keep_alive_from(from.ip()),
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(_) => return,
                }
            }
        });
    }

    fn next_group(&self, cfg: &ServerConfig) -> Ipv4Addr {
        let min = u32::from(cfg.multicast_addr_min);
        let max = u32::from(cfg.multicast_addr_max);
        let span = max.saturating_sub(min).max(1);
        let offset = self.group_next.fetch_add(1, Ordering::SeqCst) % span;
        Ipv4Addr::from(min + offset)
    }
}

// Multicast over IPv6 signaling is not supported; sessions on v6 sockets
// get 461 before reaching this module.
pub fn require_v4(local_ip: IpAddr) -> Result<Ipv4Addr> {
    match local_ip {
        IpAddr::V4(v4) => Ok(v4),
        IpAddr::V6(_) => Err(RelayError::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "multicast requires an IPv4 interface",
        ))),
    }
}
