//! Unicast UDP transport: consecutive RTP/RTCP socket pairs and the
//! inbound listener threads that implement the NAT hole punch.
//!
//! Per RFC 3550 §11 the RTP port should be even with RTCP on the next
//! odd port. Pairs are allocated from a monotonic counter that wraps;
//! the session owns both sockets for the connection's lifetime.
//!
//! The peer address negotiated in `client_port=` is only the client's
//! idea of itself; NATs rewrite it. The first datagram arriving from the
//! signaling peer's IP on each socket re-binds that socket's peer
//! (rendezvous). Datagrams from any other address are logged and dropped.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{RelayError, Result};

const PORT_MAX: u16 = 65_534;

/// Consecutive-pair allocator shared by every session of a server.
pub struct PortAllocator {
    next: AtomicU16,
    min: u16,
}

impl PortAllocator {
    pub fn new(min: u16) -> Self {
        let min = min & !1; // even start
        PortAllocator {
            next: AtomicU16::new(min),
            min,
        }
    }

    /// Bind an RTP/RTCP socket pair on consecutive ports.
    pub fn bind_pair(&self, local_ip: IpAddr) -> Result<UdpPair> {
        for _ in 0..64 {
            let rtp_port = self.next.fetch_add(2, Ordering::SeqCst);
            if rtp_port >= PORT_MAX || rtp_port < self.min {
                self.next.store(self.min, Ordering::SeqCst);
                continue;
            }
            let rtp = match UdpSocket::bind((local_ip, rtp_port)) {
                Ok(sock) => sock,
                Err(_) => continue,
            };
            let rtcp = match UdpSocket::bind((local_ip, rtp_port + 1)) {
                Ok(sock) => sock,
                Err(_) => continue,
            };
            tracing::trace!(rtp_port, rtcp_port = rtp_port + 1, "allocated udp pair");
            return Ok(UdpPair {
                rtp: Arc::new(rtp),
                rtcp: Arc::new(rtcp),
                rtp_port,
                rtcp_port: rtp_port + 1,
                peer_rtp: Mutex::new(None),
                peer_rtcp: Mutex::new(None),
            });
        }
        Err(RelayError::PortRangeExhausted)
    }
}

/// One track's UDP sockets plus the current peer addresses (updated by
/// the hole punch).
pub struct UdpPair {
    pub rtp: Arc<UdpSocket>,
    pub rtcp: Arc<UdpSocket>,
    pub rtp_port: u16,
    pub rtcp_port: u16,
    pub peer_rtp: Mutex<Option<SocketAddr>>,
    pub peer_rtcp: Mutex<Option<SocketAddr>>,
}

impl UdpPair {
    /// Seed the peer addresses from the client's `client_port=` pair.
    pub fn set_initial_peer(&self, ip: IpAddr, rtp_port: u16, rtcp_port: u16) {
        *self.peer_rtp.lock() = Some(SocketAddr::new(ip, rtp_port));
        *self.peer_rtcp.lock() = Some(SocketAddr::new(ip, rtcp_port));
    }

    pub fn send_rtp(&self, data: &[u8]) -> std::io::Result<usize> {
        match *self.peer_rtp.lock() {
            Some(peer) => self.rtp.send_to(data, peer),
            None => Ok(0),
        }
    }

    pub fn send_rtcp(&self, data: &[u8]) -> std::io::Result<usize> {
        match *self.peer_rtcp.lock() {
            Some(peer) => self.rtcp.send_to(data, peer),
            None => Ok(0),
        }
    }
}

/// Spawn the inbound listener threads for a pair.
///
/// Datagrams are stamped with the track's interleaved channel convention
/// (`2 * track_idx` for RTP, `+1` for RTCP) and handed to the session
/// thread through `tx`; the session is its own poller and drains the
/// channel between socket reads. `on_alive` resets the liveness ticker.
/// Threads exit when `stop` is set or the session's receiver is gone.
pub fn spawn_pair_listeners(
    pair: &Arc<UdpPair>,
    track_idx: usize,
    expected_peer: IpAddr,
    tx: Sender<(u8, Vec<u8>)>,
    on_alive: Arc<dyn Fn() + Send + Sync>,
    stop: Arc<AtomicBool>,
) {
    spawn_one(
        pair.rtp.clone(),
        pair.clone(),
        false,
        (2 * track_idx) as u8,
        expected_peer,
        tx.clone(),
        on_alive.clone(),
        stop.clone(),
    );
    spawn_one(
        pair.rtcp.clone(),
        pair.clone(),
        true,
        (2 * track_idx + 1) as u8,
        expected_peer,
        tx,
        on_alive,
        stop,
    );
}

#[allow(clippy::too_many_arguments)]
fn spawn_one(
    sock: Arc<UdpSocket>,
    pair: Arc<UdpPair>,
    is_rtcp: bool,
    channel: u8,
    expected_peer: IpAddr,
    tx: Sender<(u8, Vec<u8>)>,
    on_alive: Arc<dyn Fn() + Send + Sync>,
    stop: Arc<AtomicBool>,
) {
    let _ = sock.set_read_timeout(Some(Duration::from_millis(500)));
    std::thread::spawn(move || {
        let mut buf = [0u8; 2048];
        let mut punched = false;
        loop {
            if stop.load(Ordering::Acquire) {
                return;
            }
            let (len, from) = match sock.recv_from(&mut buf) {
                Ok(pair) => pair,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(_) => return,
            };

            if from.ip() != expected_peer {
                tracing::warn!(
                    channel,
                    from = %from,
                    "dropped {} datagram from foreign address",
                    if is_rtcp { "rtcp" } else { "rtp" }
                );
                continue;
            }

            if !punched {
                // Rendezvous: the NAT-visible source address wins.
                punched = true;
                if is_rtcp {
                    *pair.peer_rtcp.lock() = Some(from);
                } else {
                    *pair.peer_rtp.lock() = Some(from);
                }
                tracing::debug!(channel, peer = %from, "udp peer rebound");
            }

            on_alive();
            if tx.send((channel, buf[..len].to_vec())).is_err() {
                // Session is gone.
                return;
            }
        }
    });
}
