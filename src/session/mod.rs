//! The RTSP session state machine.
//!
//! One session per accepted TCP connection, pinned to its own thread:
//! the thread is the session's poller, every handler runs on it, and
//! cross-thread work (auth hooks, registry waits, UDP datagrams, tunnel
//! injection) re-enters through channels drained between socket reads.
//!
//! ## Lifecycle
//!
//! ```text
//! INIT        — OPTIONS / DESCRIBE / ANNOUNCE / GET / POST accepted
//! DESCRIBED   — player: session id assigned, awaiting SETUPs + PLAY
//! ANNOUNCED   — publisher: session id assigned, awaiting SETUPs + RECORD
//! PLAYING / RECORDING ⇄ PAUSED
//! TEARING_DOWN — terminal
//! ```
//!
//! Liveness: the ticker resets on every inbound byte (or datagram). A
//! connection without a session id past the handshake deadline is
//! illegal; an idle publisher dies after one keep-alive window; a UDP
//! player gets four windows because its only inbound traffic is RTCP
//! receiver reports.

pub mod transport;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::auth::{challenge, verify_basic, verify_digest, Authorization};
use crate::context::Context;
use crate::error::SessionError;
use crate::events::{Credential, FlowReport, PublishOptions};
use crate::media::registry::MediaRegistry;
use crate::media::ring::{ReaderInfo, RingBuffer, RingReader, RtpFrame};
use crate::media::source::{MediaSource, Ownership};
use crate::media::{MediaInfo, TrackType, SCHEMA_RTSP};
use crate::protocol::response::http_date;
use crate::protocol::sdp::{scan_tracks, SdpTrack};
use crate::protocol::{encode_interleaved_header, RtspRequest, RtspResponse, RtspSplitter, SplitterOutput};
use crate::rtcp::{create_sdes, RtcpContext, RtcpFlavor};
use crate::transport::multicast::{require_v4, RtpMulticaster};
use crate::transport::udp::{spawn_pair_listeners, UdpPair};
use crate::tunnel::{Base64StreamDecoder, GetterHandle};

use self::transport::{format_ssrc, TransportKind, TransportSpec};

const RTCP_INTERVAL: Duration = Duration::from_secs(5);
const READ_POLL: Duration = Duration::from_millis(50);
const PUBLIC_METHODS: &str =
    "OPTIONS, DESCRIBE, SETUP, TEARDOWN, PLAY, PAUSE, ANNOUNCE, RECORD, SET_PARAMETER, GET_PARAMETER";

/// Random alphanumeric string (session ids, digest nonces).
pub(crate) fn rand_str(len: usize) -> String {
    use rand::Rng;
    rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Wall clock in Unix milliseconds.
pub(crate) fn unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// State shared with data-plane callbacks running off the session
/// thread: the liveness ticker, byte counters and the shutdown latch.
pub struct SessionShared {
    created: Instant,
    alive: Mutex<Instant>,
    down: AtomicBool,
    reason: Mutex<String>,
    sock: TcpStream,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl SessionShared {
    fn new(sock: TcpStream) -> Arc<Self> {
        Arc::new(SessionShared {
            created: Instant::now(),
            alive: Mutex::new(Instant::now()),
            down: AtomicBool::new(false),
            reason: Mutex::new(String::new()),
            sock,
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        })
    }

    pub fn keep_alive(&self) {
        *self.alive.lock() = Instant::now();
    }

    fn idle(&self) -> Duration {
        self.alive.lock().elapsed()
    }

    fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Latch the shutdown and wake the blocked reader. Idempotent; the
    /// first reason wins.
    pub fn shutdown(&self, reason: &str) {
        if !self.down.swap(true, Ordering::AcqRel) {
            *self.reason.lock() = reason.to_string();
            let _ = self.sock.shutdown(std::net::Shutdown::Both);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.down.load(Ordering::Acquire)
    }

    fn reason(&self) -> String {
        self.reason.lock().clone()
    }

    fn add_bytes_in(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn add_bytes_out(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn bytes_total(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed) + self.bytes_out.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    Init,
    Described,
    Announced,
    Playing,
    Recording,
    Paused,
    TearingDown,
}

struct TunnelForward {
    getter: Weak<GetterHandle>,
    decoder: Base64StreamDecoder,
}

struct PlayerTrackState {
    rtcp: RtcpContext,
    last_report: Option<Instant>,
}

struct PlayerTrack {
    ttype: TrackType,
    interleaved: u8,
    udp: Option<Arc<UdpPair>>,
    state: Mutex<PlayerTrackState>,
}

/// Outbound data plane of a playing session. Shared with the ring reader
/// callback, which runs on the publisher's thread; everything here is
/// lock-guarded or atomic.
struct PlayerSender {
    transport: TransportKind,
    writer: Arc<Mutex<TcpStream>>,
    tracks: Vec<PlayerTrack>,
    target: Option<TrackType>,
    shared: Arc<SessionShared>,
    cname: String,
}

impl PlayerSender {
    fn send_frame(&self, frame: &Arc<RtpFrame>) {
        if self.shared.is_shutdown() || frame.data.len() < 12 || frame.data.len() > 0xffff {
            return;
        }
        if let Some(target) = self.target {
            if target != frame.track {
                return;
            }
        }
        let Some(track) = self.tracks.iter().find(|t| t.ttype == frame.track) else {
            return;
        };
        let ssrc = u32::from_be_bytes([frame.data[8], frame.data[9], frame.data[10], frame.data[11]]);

        // Outbound accounting plus the 5 s SR cadence; the first RTP to a
        // new reader is always preceded by an SR so players get their NTP
        // anchor early.
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
            self.send_rtcp(track, &sr);
            self.send_rtcp(track, &create_sdes(ssrc, &self.cname));
        }

        match self.transport {
            TransportKind::Tcp => self.send_interleaved(track.interleaved, &frame.data),
            TransportKind::Udp => match &track.udp {
                Some(pair) => match pair.send_rtp(&frame.data) {
                    Ok(n) => self.shared.add_bytes_out(n),
                    Err(e) => tracing::warn!(error = %e, "rtp send failed"),
                },
                None => self.shared.shutdown("udp sock not opened yet"),
            },
            _ => {}
        }
    }

    fn send_rtcp(&self, track: &PlayerTrack, data: &[u8]) {
        match self.transport {
            TransportKind::Tcp => self.send_interleaved(track.interleaved + 1, data),
            TransportKind::Udp => {
                if let Some(pair) = &track.udp {
                    if let Ok(n) = pair.send_rtcp(data) {
                        self.shared.add_bytes_out(n);
                    }
                }
            }
            _ => {}
        }
    }

    fn send_interleaved(&self, channel: u8, data: &[u8]) {
        let header = encode_interleaved_header(channel, data.len() as u16);
        let mut writer = self.writer.lock();
        if writer
            .write_all(&header)
            .and_then(|_| writer.write_all(data))
            .is_err()
        {
            self.shared.shutdown("tcp write failed");
        } else {
            self.shared.add_bytes_out(4 + data.len());
        }
    }
}

/// Per-connection protocol state machine.
pub struct RtspSession {
    ctx: Context,
    shared: Arc<SessionShared>,
    writer: Arc<Mutex<TcpStream>>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    splitter: RtspSplitter,
    tag: u64,
    phase: SessionPhase,
    cseq: String,
    session_id: String,
    content_base: String,
    media_info: MediaInfo,
    /// Realm decided for this session; `Some("")` means "no RTSP auth".
    realm: Option<String>,
    nonce: String,
    play_authed: bool,
    /// True when the shutdown was session-initiated (teardown, protocol
    /// error) rather than a network failure; suppresses the publisher
    /// reconnect grace.
    clean_close: bool,
    transport: TransportKind,
    tracks: Vec<SdpTrack>,
    recv_rtcp: Vec<RtcpContext>,
    rtcp_last: Vec<Option<Instant>>,
    push_src: Option<Arc<MediaSource>>,
    push_ownership: Option<Ownership>,
    play_src: Option<Weak<MediaSource>>,
    play_reader: Option<RingReader>,
    play_sender: Option<Arc<PlayerSender>>,
    target_play_track: Option<TrackType>,
    udp_pairs: Vec<Option<Arc<UdpPair>>>,
    udp_tx: Option<Sender<(u8, Vec<u8>)>>,
    udp_rx: Option<Receiver<(u8, Vec<u8>)>>,
    udp_stop: Arc<AtomicBool>,
    multicaster: Option<Arc<RtpMulticaster>>,
    tunnel_cookie: String,
    tunnel_inject_rx: Option<Receiver<Vec<u8>>>,
    tunnel_getter: Option<Arc<GetterHandle>>,
    tunnel_forward: Option<TunnelForward>,
    continue_push_ms: u64,
}

impl RtspSession {
    /// Entry point: run one connection to completion.
    pub fn handle(stream: TcpStream, ctx: Context) {
        let peer_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };
        let _ = stream.set_read_timeout(Some(READ_POLL));
        let (writer, shutdown_sock) = match (stream.try_clone(), stream.try_clone()) {
            (Ok(w), Ok(s)) => (w, s),
            _ => return,
        };

        tracing::info!(%peer_addr, "rtsp client connected");
        let continue_push_ms = ctx.config.continue_push_ms;
        let tag = ctx.next_session_tag();
        let mut session = RtspSession {
            ctx,
            shared: SessionShared::new(shutdown_sock),
            writer: Arc::new(Mutex::new(writer)),
            peer_addr,
            local_addr,
            splitter: RtspSplitter::new(),
            tag,
            phase: SessionPhase::Init,
            cseq: "0".to_string(),
            session_id: String::new(),
            content_base: String::new(),
            media_info: MediaInfo::default(),
            realm: None,
            nonce: String::new(),
            play_authed: false,
            clean_close: false,
            transport: TransportKind::Invalid,
            tracks: Vec::new(),
            recv_rtcp: Vec::new(),
            rtcp_last: Vec::new(),
            push_src: None,
            push_ownership: None,
            play_src: None,
            play_reader: None,
            play_sender: None,
            target_play_track: None,
            udp_pairs: Vec::new(),
            udp_tx: None,
            udp_rx: None,
            udp_stop: Arc::new(AtomicBool::new(false)),
            multicaster: None,
            tunnel_cookie: String::new(),
            tunnel_inject_rx: None,
            tunnel_getter: None,
            tunnel_forward: None,
            continue_push_ms,
        };

        let mut reader = stream;
        let reason = session.run(&mut reader);
        session.cleanup(&reason);
    }

    /// Read/dispatch loop. Returns the disconnect reason.
    fn run(&mut self, reader: &mut TcpStream) -> String {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            if self.shared.is_shutdown() {
                return self.shared.reason();
            }

            // Tunnel-injected input (we are a getter): the poster's
            // decoded bytes count as our inbound traffic.
            let mut injected = Vec::new();
            if let Some(rx) = &self.tunnel_inject_rx {
                while let Ok(chunk) = rx.try_recv() {
                    injected.push(chunk);
                }
            }
            if !injected.is_empty() {
                self.shared.keep_alive();
                for chunk in injected {
                    self.shared.add_bytes_in(chunk.len());
                    self.splitter.push(&chunk);
                }
            }

            // Datagrams posted by the UDP listener threads.
            let mut datagrams = Vec::new();
            if let Some(rx) = &self.udp_rx {
                while let Ok(d) = rx.try_recv() {
                    datagrams.push(d);
                }
            }
            for (channel, data) in datagrams {
                if let Err(e) = self.on_udp_datagram(channel, &data) {
                    self.fail(e);
                }
            }

            loop {
                if self.shared.is_shutdown() {
                    return self.shared.reason();
                }
                match self.splitter.next() {
                    Ok(Some(msg)) => {
                        if let Err(e) = self.dispatch(msg) {
                            self.fail(e);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.fail(e);
                        break;
                    }
                }
            }
            if self.shared.is_shutdown() {
                return self.shared.reason();
            }

            match reader.read(&mut buf) {
                Ok(0) => return "connection closed by peer".to_string(),
                Ok(n) => {
                    self.shared.keep_alive();
                    self.shared.add_bytes_in(n);
                    if self.tunnel_forward.is_some() {
                        let chunk = buf[..n].to_vec();
                        if let Err(e) = self.forward_poster(&chunk) {
                            self.fail(e);
                        }
                    } else {
                        self.splitter.push(&buf[..n]);
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if let Err(reason) = self.check_timeouts() {
                        self.shared.shutdown(&reason);
                        return reason;
                    }
                }
                Err(_) => return "read error".to_string(),
            }
        }
    }

    /// Periodic liveness checks, run whenever the socket is quiet.
    fn check_timeouts(&self) -> Result<(), String> {
        let cfg = &self.ctx.config;
        if self.session_id.is_empty() && self.shared.age() > Duration::from_secs(cfg.handshake_secs)
        {
            return Err("illegal connection".to_string());
        }
        if self.push_src.is_some() && self.shared.idle() > Duration::from_secs(cfg.keep_alive_secs) {
            return Err("pusher session timeout".to_string());
        }
        if self.push_src.is_none()
            && self.transport == TransportKind::Udp
            && self.shared.idle() > Duration::from_secs(cfg.keep_alive_secs * 4)
        {
            return Err("rtp over udp player timeout".to_string());
        }
        Ok(())
    }

    fn dispatch(&mut self, msg: SplitterOutput) -> Result<(), SessionError> {
        match msg {
            SplitterOutput::Frame { channel, payload } => self.on_interleaved(channel, &payload),
            SplitterOutput::Request(req) => self.handle_request(&req),
        }
    }

    /// Centralized error path: reply (when the handler hasn't) and latch
    /// the shutdown for fatal conditions.
    fn fail(&mut self, e: SessionError) {
        if let Some(status) = e.status {
            let mut resp = RtspResponse::new(status);
            if matches!(status, 404 | 406 | 454 | 461) {
                resp = resp.add_header("Connection", "Close");
            }
            let _ = self.send_response(resp);
        }
        if e.close {
            self.clean_close = true;
            self.shared.shutdown(&e.reason);
        } else {
            tracing::warn!(peer = %self.peer_addr, error = %e, "request failed");
        }
    }

    fn handle_request(&mut self, req: &RtspRequest) -> Result<(), SessionError> {
        self.cseq = req.cseq().unwrap_or("0").to_string();
        if self.content_base.is_empty() && req.method != "GET" && req.method != "POST" {
            let mut base = req.uri.clone();
            if let Some(pos) = base.find('?') {
                base.truncate(pos);
            }
            self.content_base = base;
            self.media_info = MediaInfo::parse(&req.uri, self.ctx.config.enable_vhost);
            self.media_info.schema = SCHEMA_RTSP.to_string();
        }

        tracing::debug!(peer = %self.peer_addr, method = %req.method, cseq = %self.cseq, "request");
        match req.method.as_str() {
            "OPTIONS" => self.handle_options(),
            "DESCRIBE" => self.handle_describe(req),
            "ANNOUNCE" => self.handle_announce(req),
            "SETUP" => self.handle_setup(req),
            "PLAY" => self.handle_play(req),
            "PAUSE" => self.handle_pause(req),
            "TEARDOWN" => self.handle_teardown(),
            "RECORD" => self.handle_record(req),
            "GET" => self.handle_get(req),
            "POST" => self.handle_post(req),
            // GET_PARAMETER doubles as the client keep-alive; both answer
            // 200 without interpreting the body.
            "SET_PARAMETER" | "GET_PARAMETER" => self.send_response(RtspResponse::ok()),
            other => {
                self.send_response(RtspResponse::new(403))?;
                Err(SessionError::shutdown(format!("403 Forbidden: {}", other)))
            }
        }
    }

    fn handle_options(&mut self) -> Result<(), SessionError> {
        self.send_response(RtspResponse::ok().add_header("Public", PUBLIC_METHODS))
    }

    // ---------------------------------------------------------------
    // DESCRIBE and the authentication flow
    // ---------------------------------------------------------------

    fn handle_describe(&mut self, req: &RtspRequest) -> Result<(), SessionError> {
        let realm = self.query_realm();
        if realm.is_empty() {
            // No RTSP-specific auth; the generic play-URL authorization
            // applies instead.
            self.emit_on_play()?;
        } else if !self.authenticate(&realm, req)? {
            // Challenged; the client may retry on this connection.
            return Ok(());
        }
        self.reply_describe()
    }

    /// Realm discovery, cached for the session after the first DESCRIBE.
    fn query_realm(&mut self) -> String {
        if let Some(realm) = &self.realm {
            return realm.clone();
        }
        let realm = match &self.ctx.events.hooks.on_realm {
            None => String::new(),
            Some(hook) => {
                let (tx, rx) = std::sync::mpsc::channel();
                hook(
                    &self.media_info,
                    Box::new(move |realm| {
                        let _ = tx.send(realm);
                    }),
                );
                rx.recv_timeout(self.hook_wait()).unwrap_or_default()
            }
        };
        self.realm = Some(realm.clone());
        realm
    }

    fn query_credential(&self, realm: &str, user: &str, cleartext: bool) -> Option<Option<Credential>> {
        let hook = self.ctx.events.hooks.on_credential.as_ref()?;
        let (tx, rx) = std::sync::mpsc::channel();
        hook(
            realm,
            user,
            cleartext,
            Box::new(move |cred| {
                let _ = tx.send(cred);
            }),
        );
        Some(rx.recv_timeout(self.hook_wait()).unwrap_or(None))
    }

    /// Validate the Authorization header against the active realm.
    /// `Ok(true)` = authorized, `Ok(false)` = challenged (reply sent,
    /// connection stays open for the retry).
    fn authenticate(&mut self, realm: &str, req: &RtspRequest) -> Result<bool, SessionError> {
        if self.nonce.is_empty() {
            self.nonce = rand_str(32);
        }

        let Some(header) = req.get_header("Authorization").map(str::to_string) else {
            self.send_challenge(realm)?;
            return Ok(false);
        };

        let Some(auth) = Authorization::parse(&header) else {
            self.send_challenge(realm)?;
            return Err(SessionError::shutdown("unsupported auth type"));
        };

        let verdict = match auth {
            Authorization::Basic { user, password } => {
                match self.query_credential(realm, &user, true) {
                    // The stream demands auth but nobody answers the
                    // credential query; let the client in rather than
                    // locking everyone out of a misconfigured server.
                    None => {
                        tracing::warn!("auth required but no credential hook installed");
                        Ok(())
                    }
                    Some(secret) => verify_basic(&password, secret),
                }
            }
            Authorization::Digest(fields) => {
                let user = fields.get("username").cloned().unwrap_or_default();
                match self.query_credential(realm, &user, false) {
                    None => {
                        tracing::warn!("auth required but no credential hook installed");
                        Ok(())
                    }
                    Some(secret) => verify_digest(realm, &self.nonce, &fields, secret),
                }
            }
        };

        match verdict {
            Ok(()) => Ok(true),
            Err(why) => {
                self.send_challenge(realm)?;
                Err(SessionError::shutdown(format!("401 Unauthorized: {}", why)))
            }
        }
    }

    fn send_challenge(&mut self, realm: &str) -> Result<(), SessionError> {
        let value = challenge(realm, &self.nonce, self.ctx.config.auth_basic);
        self.send_response(RtspResponse::new(401).add_header("WWW-Authenticate", &value))
    }

    /// Generic play-URL authorization (used when no realm is set).
    fn emit_on_play(&mut self) -> Result<(), SessionError> {
        if self.play_authed {
            return Ok(());
        }
        self.play_authed = true;
        if let Some(hook) = &self.ctx.events.hooks.on_play {
            let (tx, rx) = std::sync::mpsc::channel();
            hook(
                &self.media_info,
                Box::new(move |res| {
                    let _ = tx.send(res);
                }),
            );
            if let Ok(Err(reason)) = rx.recv_timeout(self.hook_wait()) {
                self.send_response(RtspResponse::new(401).with_text(&reason))?;
                return Err(SessionError::shutdown(format!("401 Unauthorized: {}", reason)));
            }
        }
        Ok(())
    }

    fn reply_describe(&mut self) -> Result<(), SessionError> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.ctx.registry.find_async(&self.media_info, self.tag, move |src| {
            let _ = tx.send(src);
        });
        let wait = Duration::from_millis(self.ctx.config.max_stream_wait_ms + 1_000);
        let src = rx.recv_timeout(wait).ok().flatten();
        let Some(src) = src else {
            return Err(SessionError::fatal(
                404,
                format!("no such stream: {}", self.media_info.short_url()),
            ));
        };

        let sdp = src.sdp();
        self.tracks = scan_tracks(&sdp);
        if self.tracks.is_empty() {
            return Err(SessionError::fatal(404, "no valid track in sdp"));
        }
        for track in &mut self.tracks {
            let obs = src.track(track.ttype);
            track.ssrc = if obs.ssrc != 0 {
                obs.ssrc
            } else {
                use rand::Rng;
                rand::rng().random()
            };
            track.seq = obs.seq;
            track.timestamp = obs.rtp_ts;
        }

        self.session_id = rand_str(12);
        self.play_src = Some(Arc::downgrade(&src));
        self.phase = SessionPhase::Described;
        tracing::debug!(session_id = %self.session_id, phase = ?self.phase, "player described");

        let base = format!("{}/", self.content_base.trim_end_matches('/'));
        self.send_response(
            RtspResponse::ok()
                .add_header("Content-Base", &base)
                .add_header("x-Accept-Retransmit", "our-retransmit")
                .add_header("x-Accept-Dynamic-Rate", "1")
                .with_sdp(sdp),
        )
    }

    // ---------------------------------------------------------------
    // Publisher: ANNOUNCE / RECORD
    // ---------------------------------------------------------------

    fn handle_announce(&mut self, req: &RtspRequest) -> Result<(), SessionError> {
        // Some pushers force a ".sdp" suffix onto the URL.
        let mut full_url = req.uri.clone();
        if let Some(stripped) = full_url.strip_suffix(".sdp") {
            full_url = stripped.to_string();
            self.media_info = MediaInfo::parse(&full_url, self.ctx.config.enable_vhost);
            self.media_info.schema = SCHEMA_RTSP.to_string();
        }
        self.content_base = full_url.clone();

        if self.media_info.app.is_empty() || self.media_info.stream.is_empty() {
            let err = "illegal rtsp push url, expected at least rtsp://host/app/stream";
            self.send_response(RtspResponse::new(403).with_text(err))?;
            return Err(SessionError::shutdown(format!("{}: {}", err, full_url)));
        }

        let options = self.emit_on_publish()?;

        // A still-registered source means a pusher is (or recently was)
        // here: adopt it when its ownership token is free, refuse with
        // 406 otherwise.
        debug_assert!(self.push_src.is_none());
        let info = self.media_info.clone();
        let existing = self
            .ctx
            .registry
            .find(SCHEMA_RTSP, &info.vhost, &info.app, &info.stream, false);
        if let Some(src) = existing {
            match MediaSource::acquire_ownership(&src) {
                Some(token) => {
                    tracing::info!(url = %src.url(), "publisher re-acquired source");
                    self.push_ownership = Some(token);
                    self.push_src = Some(src);
                }
                None => {
                    return Err(SessionError::fatal(
                        406,
                        format!("ANNOUNCE: already publishing: {}", info.short_url()),
                    ));
                }
            }
        }

        let sdp = req.body_str().into_owned();
        self.tracks = scan_tracks(&sdp);
        if self.tracks.is_empty() {
            self.send_response(RtspResponse::new(403).with_text("no valid track in sdp"))?;
            return Err(SessionError::shutdown("no valid track in announced sdp"));
        }
        for track in &mut self.tracks {
            if track.ssrc == 0 {
                use rand::Rng;
                track.ssrc = rand::rng().random();
            }
        }
        self.recv_rtcp = self
            .tracks
            .iter()
            .map(|_| RtcpContext::new(RtcpFlavor::Recv))
            .collect();
        self.rtcp_last = vec![None; self.tracks.len()];
        self.session_id = rand_str(12);

        match self.push_src.clone() {
            Some(src) => src.set_sdp(&sdp),
            None => {
                let src = MediaSource::new(SCHEMA_RTSP, info.tuple());
                src.set_sdp(&sdp);
                self.push_ownership = MediaSource::acquire_ownership(&src);
                if let Err(e) = self.ctx.registry.regist(&src) {
                    return Err(SessionError::fatal(406, e.to_string()));
                }
                self.push_src = Some(src);
            }
        }

        self.continue_push_ms = options
            .continue_push_ms
            .unwrap_or(self.ctx.config.continue_push_ms);
        self.phase = SessionPhase::Announced;
        tracing::debug!(session_id = %self.session_id, phase = ?self.phase, "publisher announced");
        self.send_response(RtspResponse::ok())
    }

    fn emit_on_publish(&mut self) -> Result<PublishOptions, SessionError> {
        let Some(hook) = &self.ctx.events.hooks.on_publish else {
            return Ok(PublishOptions::default());
        };
        let (tx, rx) = std::sync::mpsc::channel();
        hook(
            &self.media_info,
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
        );
        match rx.recv_timeout(self.hook_wait()) {
            Ok(Ok(options)) => Ok(options),
            Ok(Err(reason)) => {
                self.send_response(RtspResponse::new(401).with_text(&reason))?;
                Err(SessionError::shutdown(format!("401 Unauthorized: {}", reason)))
            }
            Err(_) => Ok(PublishOptions::default()),
        }
    }

    fn handle_record(&mut self, req: &RtspRequest) -> Result<(), SessionError> {
        if self.tracks.is_empty() || req.session_id() != Some(self.session_id.as_str()) {
            return Err(SessionError::fatal(454, "session not found when record"));
        }
        if self.tracks.iter().any(|t| !t.inited) {
            return Err(SessionError::fatal(400, "track not setuped"));
        }

        let rtp_info: Vec<String> = self
            .tracks
            .iter()
            .map(|t| format!("url={}", t.control_url(&self.content_base)))
            .collect();
        self.send_response(RtspResponse::ok().add_header("RTP-Info", &rtp_info.join(",")))?;

        if self.transport == TransportKind::Tcp {
            self.tune_socket();
        }
        self.phase = SessionPhase::Recording;
        tracing::info!(url = %self.media_info.short_url(), phase = ?self.phase, "publisher live");
        Ok(())
    }

    // ---------------------------------------------------------------
    // SETUP and the transports
    // ---------------------------------------------------------------

    fn handle_setup(&mut self, req: &RtspRequest) -> Result<(), SessionError> {
        let idx = self.track_index_by_control(&req.uri)?;
        if self.tracks[idx].inited {
            return Err(SessionError::shutdown("can not setup one track twice"));
        }

        let Some(header) = req.get_header("Transport").map(str::to_string) else {
            return Err(SessionError::fatal(400, "setup without transport header"));
        };
        let spec = TransportSpec::parse(&header);
        let kind = TransportKind::from_header(&header);

        if self.transport == TransportKind::Invalid {
            if let Some(forced) = self.ctx.config.forced_transport {
                if forced != kind {
                    tracing::warn!(
                        requested = kind.as_str(),
                        forced = forced.as_str(),
                        "client transport refused by config"
                    );
                    return Err(SessionError::fatal(461, "transport forced by config"));
                }
            }
            self.transport = kind;
        } else if self.transport != kind {
            return Err(SessionError::fatal(461, "transport can not change within a session"));
        }

        self.tracks[idx].inited = true;
        self.splitter.enable_interleaved(self.transport == TransportKind::Tcp);

        match self.transport {
            TransportKind::Tcp => self.setup_tcp(idx, &spec),
            TransportKind::Udp => self.setup_udp(idx, &spec),
            TransportKind::Multicast => self.setup_multicast(idx),
            TransportKind::Invalid => unreachable!("transport decided above"),
        }
    }

    fn setup_tcp(&mut self, idx: usize, spec: &TransportSpec) -> Result<(), SessionError> {
        let channel = if self.push_src.is_some() {
            // Pushers pick their own channels; we must echo them.
            match spec.interleaved {
                Some((rtp, _)) => rtp,
                None => {
                    return Err(SessionError::shutdown(
                        "can not find interleaved when setup of rtp over tcp",
                    ));
                }
            }
        } else {
            // Players share the source's distribution, so the server
            // decides: channel pair (2t, 2t+1) by track type.
            (2 * self.tracks[idx].ttype.index()) as u8
        };
        self.tracks[idx].interleaved = Some(channel);
        let ssrc = self.tracks[idx].ssrc;

        let value = format!(
            "RTP/AVP/TCP;unicast;interleaved={}-{};ssrc={}",
            channel,
            channel + 1,
            format_ssrc(ssrc)
        );
        self.send_response(
            RtspResponse::ok()
                .add_header("Transport", &value)
                .add_header("x-Transport-Options", "late-tolerance=1.400000")
                .add_header("x-Dynamic-Rate", "1"),
        )
    }

    fn setup_udp(&mut self, idx: usize, spec: &TransportSpec) -> Result<(), SessionError> {
        let pair = self
            .ctx
            .udp_ports
            .bind_pair(self.local_addr.ip())
            .map_err(|e| SessionError::fatal(406, format!("udp pair allocation failed: {}", e)))?;
        let pair = Arc::new(pair);

        let (client_rtp, client_rtcp) = spec.client_port.unwrap_or((0, 0));
        pair.set_initial_peer(self.peer_addr.ip(), client_rtp, client_rtcp);

        if self.udp_tx.is_none() {
            let (tx, rx) = std::sync::mpsc::channel();
            self.udp_tx = Some(tx);
            self.udp_rx = Some(rx);
        }
        let tx = self.udp_tx.clone().expect("channel just installed");
        let shared = self.shared.clone();
        spawn_pair_listeners(
            &pair,
            idx,
            self.peer_addr.ip(),
            tx,
            Arc::new(move || shared.keep_alive()),
            self.udp_stop.clone(),
        );

        while self.udp_pairs.len() <= idx {
            self.udp_pairs.push(None);
        }
        self.udp_pairs[idx] = Some(pair.clone());

        let value = format!(
            "RTP/AVP/UDP;unicast;client_port={}-{};server_port={}-{};ssrc={}",
            client_rtp,
            client_rtcp,
            pair.rtp_port,
            pair.rtcp_port,
            format_ssrc(self.tracks[idx].ssrc)
        );
        self.send_response(RtspResponse::ok().add_header("Transport", &value))
    }

    fn setup_multicast(&mut self, idx: usize) -> Result<(), SessionError> {
        if self.push_src.is_some() {
            return Err(SessionError::fatal(461, "multicast push is not supported"));
        }
        require_v4(self.local_addr.ip())
            .map_err(|_| SessionError::fatal(461, "multicast requires an ipv4 interface"))?;
        let src = self
            .play_src
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| SessionError::fatal(404, "rtsp stream released"))?;

        if self.multicaster.is_none() {
            let caster = self
                .ctx
                .multicast
                .get_or_create(
                    &self.ctx.config,
                    &self.ctx.udp_ports,
                    self.local_addr.ip(),
                    &src,
                )
                .map_err(|_| {
                    SessionError::fatal(406, "can not get a available udp multicast socket")
                })?;
            let alive = self.shared.clone();
            let down = self.shared.clone();
            caster.subscribe(
                self.tag,
                self.peer_addr.ip(),
                Arc::new(move || alive.keep_alive()),
                Box::new(move || down.shutdown("ring buffer detached")),
            );
            self.multicaster = Some(caster);
        }
        let caster = self.multicaster.as_ref().expect("just installed");

        let port = caster.rtp_port(self.tracks[idx].ttype);
        let value = format!(
            "RTP/AVP;multicast;destination={};source={};port={}-{};ttl={};ssrc={}",
            caster.group_ip(),
            self.local_addr.ip(),
            port,
            port + 1,
            caster.ttl(),
            format_ssrc(self.tracks[idx].ssrc)
        );
        self.send_response(RtspResponse::ok().add_header("Transport", &value))
    }

    // ---------------------------------------------------------------
    // PLAY / PAUSE / TEARDOWN
    // ---------------------------------------------------------------

    fn handle_play(&mut self, req: &RtspRequest) -> Result<(), SessionError> {
        if self.tracks.is_empty() || req.session_id() != Some(self.session_id.as_str()) {
            return Err(SessionError::fatal(454, "session not found when play"));
        }
        let Some(src) = self.play_src.as_ref().and_then(Weak::upgrade) else {
            return Err(SessionError::fatal(404, "rtsp stream released"));
        };

        let mut resp = RtspResponse::ok();
        if let Some(scale) = req.get_header("Scale") {
            if let Ok(speed) = scale.trim().parse::<f64>() {
                src.set_speed(speed);
                tracing::info!(speed, "rtsp set play speed");
            }
            resp = resp.add_header("Scale", scale);
        }

        let mut use_gop = true;
        if let Some(range) = req.get_header("Range").map(str::to_string) {
            // "Range: npt=12.5-" is a seek; "npt=now-" means live edge.
            let start = range
                .split("npt=")
                .nth(1)
                .and_then(|r| r.split('-').next())
                .map(str::trim)
                .map(|s| if s == "now" { "0" } else { s })
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0);
            use_gop = !src.seek_to((start * 1000.0) as u64);
            tracing::info!(start_ms = (start * 1000.0) as u64, "rtsp seek");
            resp = resp.add_header("Range", &range);
        } else {
            resp = resp.add_header(
                "Range",
                &format!("npt={:.2}", src.newest_stamp_ms() as f64 / 1000.0),
            );
        }

        let mut rtp_info = Vec::new();
        let mut inited_tracks = Vec::new();
        for track in &mut self.tracks {
            if !track.inited {
                // Single-track players never SETUP the other track.
                continue;
            }
            let obs = src.track(track.ttype);
            if obs.ssrc != 0 {
                track.ssrc = obs.ssrc;
            }
            track.seq = obs.seq;
            track.timestamp = obs.rtp_ts;
            inited_tracks.push(track.ttype);
            rtp_info.push(format!(
                "url={};seq={};rtptime={}",
                track.control_url(&self.content_base),
                track.seq,
                track.timestamp
            ));
        }
        if inited_tracks.is_empty() {
            return Err(SessionError::fatal(454, "no track has been setup"));
        }
        resp = resp.add_header("RTP-Info", &rtp_info.join(","));
        self.send_response(resp)?;

        if inited_tracks.len() == 1 {
            self.target_play_track = Some(inited_tracks[0]);
            tracing::info!(track = inited_tracks[0].as_str(), "single-track playback");
        }

        // Resume only after the reply is on the wire.
        src.pause(false);
        self.tune_socket();

        if self.play_reader.is_none() && self.transport != TransportKind::Multicast {
            let sender = self.build_player_sender();
            let on_frame = {
                let sender = sender.clone();
                Box::new(move |frame: &Arc<RtpFrame>| sender.send_frame(frame))
            };
            let on_detach = {
                let shared = self.shared.clone();
                Box::new(move || shared.shutdown("ring buffer detached"))
            };
            let session_id = self.session_id.clone();
            let peer = self.peer_addr.to_string();
            let info = Box::new(move || ReaderInfo {
                session_id: session_id.clone(),
                peer_addr: peer.clone(),
            });
            self.play_reader = Some(RingBuffer::attach(src.ring(), use_gop, on_frame, on_detach, info));
            self.play_sender = Some(sender);
        }

        self.phase = SessionPhase::Playing;
        tracing::debug!(session_id = %self.session_id, phase = ?self.phase, "player playing");
        Ok(())
    }

    fn build_player_sender(&self) -> Arc<PlayerSender> {
        let tracks = self
            .tracks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.inited)
            .map(|(idx, t)| PlayerTrack {
                ttype: t.ttype,
                interleaved: t.interleaved.unwrap_or((2 * t.ttype.index()) as u8),
                udp: self.udp_pairs.get(idx).cloned().flatten(),
                state: Mutex::new(PlayerTrackState {
                    rtcp: RtcpContext::new(RtcpFlavor::Send),
                    last_report: None,
                }),
            })
            .collect();
        Arc::new(PlayerSender {
            transport: self.transport,
            writer: self.writer.clone(),
            tracks,
            target: self.target_play_track,
            shared: self.shared.clone(),
            cname: self.ctx.config.server_name.clone(),
        })
    }

    fn handle_pause(&mut self, req: &RtspRequest) -> Result<(), SessionError> {
        if req.session_id() != Some(self.session_id.as_str()) || self.session_id.is_empty() {
            return Err(SessionError::fatal(454, "session not found when pause"));
        }
        self.send_response(RtspResponse::ok())?;
        if let Some(src) = self.play_src.as_ref().and_then(Weak::upgrade) {
            src.pause(true);
        }
        self.phase = SessionPhase::Paused;
        Ok(())
    }

    fn handle_teardown(&mut self) -> Result<(), SessionError> {
        // Clear the publisher slot before replying: the reply may hit a
        // broken pipe and a torn-down pusher must not get the reconnect
        // grace.
        self.push_ownership = None;
        self.push_src = None;
        self.clean_close = true;
        self.send_response(RtspResponse::ok())?;
        Err(SessionError::shutdown("recv teardown request"))
    }

    // ---------------------------------------------------------------
    // HTTP tunnel (GET / POST)
    // ---------------------------------------------------------------

    fn handle_get(&mut self, req: &RtspRequest) -> Result<(), SessionError> {
        let cookie = req.get_header("x-sessioncookie").unwrap_or("").to_string();
        if cookie.is_empty() {
            return Err(SessionError::fatal(400, "http get without x-sessioncookie"));
        }
        self.tunnel_cookie = cookie.clone();

        let (tx, rx) = std::sync::mpsc::channel();
        let handle = GetterHandle::new(tx);
        self.ctx.tunnel.register(&cookie, &handle);
        self.tunnel_getter = Some(handle);
        self.tunnel_inject_rx = Some(rx);
        tracing::debug!(cookie = %cookie, "http tunnel getter registered");

        self.send_response(
            RtspResponse::ok()
                .with_protocol("HTTP/1.0")
                .add_header("Cache-Control", "no-store")
                .add_header("Pragma", "no-store")
                .add_header("Content-Type", "application/x-rtsp-tunnelled"),
        )
    }

    fn handle_post(&mut self, req: &RtspRequest) -> Result<(), SessionError> {
        let cookie = req.get_header("x-sessioncookie").unwrap_or("");
        let Some(getter) = self.ctx.tunnel.take(cookie) else {
            return Err(SessionError::shutdown(
                "can not find http getter by x-sessioncookie",
            ));
        };
        self.tunnel_forward = Some(TunnelForward {
            getter,
            decoder: Base64StreamDecoder::new(),
        });
        tracing::debug!(cookie = %cookie, "http tunnel poster bound");

        // Bytes glued to the POST head belong to the base64 stream.
        let sticky = self.splitter.take_rest();
        if !sticky.is_empty() {
            self.forward_poster(&sticky)?;
        }

        self.send_response(
            RtspResponse::ok()
                .with_protocol("HTTP/1.0")
                .add_header("Cache-Control", "no-store")
                .add_header("Pragma", "no-store")
                .add_header("Content-Type", "application/x-rtsp-tunnelled"),
        )
    }

    fn forward_poster(&mut self, data: &[u8]) -> Result<(), SessionError> {
        let Some(forward) = self.tunnel_forward.as_mut() else {
            return Ok(());
        };
        let decoded = forward
            .decoder
            .push(data)
            .map_err(SessionError::shutdown)?;
        if decoded.is_empty() {
            return Ok(());
        }
        let Some(getter) = forward.getter.upgrade() else {
            return Err(SessionError::shutdown("http getter released"));
        };
        getter
            .inject(decoded)
            .map_err(|_| SessionError::shutdown("http getter released"))
    }

    // ---------------------------------------------------------------
    // Data plane: inbound RTP/RTCP
    // ---------------------------------------------------------------

    fn on_interleaved(&mut self, channel: u8, payload: &[u8]) -> Result<(), SessionError> {
        if channel % 2 == 0 {
            if self.push_src.is_none() {
                return Ok(());
            }
            let pt = payload.get(1).copied().unwrap_or(0) & 0x7f;
            let idx = self.track_index_by_pt(pt)?;
            self.ingest_rtp(idx, payload)
        } else {
            let idx = self.track_index_by_interleaved(channel.wrapping_sub(1))?;
            if let Some(ctx) = self.recv_rtcp.get_mut(idx) {
                ctx.on_rtcp(payload);
            }
            Ok(())
        }
    }

    fn on_udp_datagram(&mut self, channel: u8, data: &[u8]) -> Result<(), SessionError> {
        let idx = (channel / 2) as usize;
        if idx >= self.tracks.len() {
            return Ok(());
        }
        if channel % 2 == 0 {
            if self.push_src.is_some() {
                self.ingest_rtp(idx, data)?;
            }
            // For players the first RTP-port datagram is just the hole
            // punch; the listener already rebound the peer.
        } else if let Some(ctx) = self.recv_rtcp.get_mut(idx) {
            ctx.on_rtcp(data);
        }
        Ok(())
    }

    /// Ingest one publisher RTP packet: stats, periodic RR, fan-out.
    fn ingest_rtp(&mut self, idx: usize, data: &[u8]) -> Result<(), SessionError> {
        if data.len() < 12 {
            return Ok(());
        }
        let pt = data[1] & 0x7f;
        let seq = u16::from_be_bytes([data[2], data[3]]);
        let rtp_ts = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let (ttype, sample_rate) = {
            let track = &mut self.tracks[idx];
            track.ssrc = ssrc;
            track.seq = seq;
            track.timestamp = rtp_ts;
            (track.ttype, track.sample_rate)
        };

        // Project the NTP time from the pusher's last SR when we have
        // one; otherwise fall back to our wall clock.
        let ntp_ms = match self.recv_rtcp.get(idx).and_then(|c| c.sr_anchor()) {
            Some(anchor) if sample_rate > 0 => {
                let delta = rtp_ts.wrapping_sub(anchor.rtp_ts) as i32 as i64;
                (anchor.ntp_ms as i64 + delta * 1000 / sample_rate as i64).max(0) as u64
            }
            _ => unix_ms(),
        };

        if let Some(ctx) = self.recv_rtcp.get_mut(idx) {
            ctx.on_rtp(seq, rtp_ts, ntp_ms, sample_rate, data.len());
        }
        self.maybe_send_publisher_rtcp(idx, ssrc);

        if let Some(src) = &self.push_src {
            src.set_track_ssrc(ttype, ssrc);
            src.write_rtp(Arc::new(RtpFrame {
                track: ttype,
                payload_type: pt,
                seq,
                timestamp: rtp_ts,
                ntp_ms,
                sample_rate,
                data: data.to_vec(),
            }));
        }
        Ok(())
    }

    /// Publisher-side receiver reports, on the same 5 s cadence as the
    /// player SRs, over the same transport as the media.
    fn maybe_send_publisher_rtcp(&mut self, idx: usize, ssrc: u32) {
        let due = self.rtcp_last[idx]
            .map(|at| at.elapsed() >= RTCP_INTERVAL)
            .unwrap_or(true);
        if !due {
            return;
        }
        self.rtcp_last[idx] = Some(Instant::now());

        let Some(ctx) = self.recv_rtcp.get_mut(idx) else {
            return;
        };
        let rr = ctx.create_rr(ssrc.wrapping_add(1), ssrc);
        let sdes = create_sdes(ssrc, &self.ctx.config.server_name);

        match self.transport {
            TransportKind::Tcp => {
                if let Some(channel) = self.tracks[idx].interleaved {
                    self.write_interleaved(channel + 1, &rr);
                    self.write_interleaved(channel + 1, &sdes);
                }
            }
            TransportKind::Udp => {
                if let Some(Some(pair)) = self.udp_pairs.get(idx) {
                    let _ = pair.send_rtcp(&rr);
                    let _ = pair.send_rtcp(&sdes);
                }
            }
            _ => {}
        }
    }

    fn write_interleaved(&self, channel: u8, data: &[u8]) {
        if data.len() > 0xffff {
            return;
        }
        let header = encode_interleaved_header(channel, data.len() as u16);
        let mut writer = self.writer.lock();
        if writer
            .write_all(&header)
            .and_then(|_| writer.write_all(data))
            .is_ok()
        {
            self.shared.add_bytes_out(4 + data.len());
        }
    }

    // ---------------------------------------------------------------
    // Track lookup (single-track tolerance throughout)
    // ---------------------------------------------------------------

    fn track_index_by_control(&self, uri: &str) -> Result<usize, SessionError> {
        for (idx, track) in self.tracks.iter().enumerate() {
            if uri.starts_with(&track.control_url(&self.content_base)) {
                return Ok(idx);
            }
        }
        if self.tracks.len() == 1 {
            return Ok(0);
        }
        Err(SessionError::shutdown(format!(
            "no such track with control url: {}",
            uri
        )))
    }

    fn track_index_by_pt(&self, pt: u8) -> Result<usize, SessionError> {
        for (idx, track) in self.tracks.iter().enumerate() {
            if track.payload_type == pt {
                return Ok(idx);
            }
        }
        if self.tracks.len() == 1 {
            return Ok(0);
        }
        Err(SessionError::shutdown(format!("no such track with pt: {}", pt)))
    }

    fn track_index_by_interleaved(&self, channel: u8) -> Result<usize, SessionError> {
        for (idx, track) in self.tracks.iter().enumerate() {
            if track.interleaved == Some(channel) {
                return Ok(idx);
            }
        }
        if self.tracks.len() == 1 {
            return Ok(0);
        }
        Err(SessionError::shutdown(format!(
            "no such track with interleaved: {}",
            channel
        )))
    }

    // ---------------------------------------------------------------
    // Plumbing
    // ---------------------------------------------------------------

    fn hook_wait(&self) -> Duration {
        Duration::from_secs(self.ctx.config.handshake_secs)
    }

    /// With a merge-write window configured, leave Nagle on for the data
    /// plane: more latency, better throughput.
    fn tune_socket(&self) {
        if self.ctx.config.merge_write_ms > 0 {
            let _ = self.writer.lock().set_nodelay(false);
        }
    }

    fn send_response(&mut self, mut resp: RtspResponse) -> Result<(), SessionError> {
        resp = resp.add_header("CSeq", &self.cseq);
        if !self.session_id.is_empty() && !resp.has_header("Session") {
            resp = resp.add_header("Session", &self.session_id);
        }
        resp = resp
            .add_header("Server", &self.ctx.config.server_name)
            .add_header("Date", &http_date());

        let text = resp.serialize();
        {
            let mut writer = self.writer.lock();
            writer
                .write_all(text.as_bytes())
                .map_err(|_| SessionError::shutdown("write error"))?;
        }
        self.shared.add_bytes_out(text.len());
        Ok(())
    }

    fn cleanup(&mut self, reason: &str) {
        self.phase = SessionPhase::TearingDown;
        let is_player = self.push_src.is_none();
        let kind = if is_player { "player" } else { "pusher" };
        let duration = self.shared.age().as_secs();
        tracing::info!(
            peer = %self.peer_addr,
            url = %self.media_info.short_url(),
            kind,
            reason,
            duration_secs = duration,
            "rtsp session disconnected"
        );

        self.play_reader = None;
        self.play_sender = None;
        if let Some(caster) = self.multicaster.take() {
            caster.unsubscribe(self.tag);
        }
        self.udp_stop.store(true, Ordering::Release);
        if !self.tunnel_cookie.is_empty() {
            self.ctx.tunnel.remove(&self.tunnel_cookie);
        }
        self.ctx.events.remove_media_listener(self.tag);

        let bytes = self.shared.bytes_total();
        if bytes >= self.ctx.config.flow_report_threshold_kb * 1024 {
            self.ctx.events.emit_flow_report(&FlowReport {
                media: self.media_info.clone(),
                bytes,
                duration_secs: duration,
                is_player,
                peer_addr: self.peer_addr.to_string(),
            });
        }

        // Publisher reconnect grace: release the token now, keep the
        // source registered for a while so a returning pusher finds it.
        self.push_ownership = None;
        if let Some(src) = self.push_src.take() {
            if self.continue_push_ms > 0 && !self.clean_close {
                let grace = Duration::from_millis(self.continue_push_ms);
                tracing::info!(url = %src.url(), grace_ms = self.continue_push_ms, "delaying source release for reconnect");
                std::thread::spawn(move || {
                    std::thread::sleep(grace);
                    drop(src);
                });
            }
        }
    }
}

/// Cheap snapshot used by observability enumeration over the registry.
pub fn reader_summaries(registry: &MediaRegistry) -> Vec<(String, Vec<ReaderInfo>)> {
    let mut out = Vec::new();
    registry.for_each(
        |src| out.push((src.url(), src.ring().reader_infos())),
        "",
        "",
        "",
        "",
    );
    out
}
