//! # rtsp-relay — RTSP session engine for live media relay
//!
//! A per-connection RTSP protocol state machine mediating between
//! clients (players and pushers) and an in-process media-source
//! registry: SDP negotiation, Basic/Digest authentication, three
//! RTP/RTCP transports, HTTP-tunneled RTSP, and connection lifecycle.
//!
//! ## Protocol references
//!
//! | RFC | Topic | How this crate uses it |
//! |-----|-------|----------------------|
//! | [RFC 2326](https://tools.ietf.org/html/rfc2326) | RTSP 1.0 | Request/response parsing, session lifecycle, transport negotiation |
//! | [RFC 3550](https://tools.ietf.org/html/rfc3550) | RTP/RTCP | Interleaved framing, SR/RR/SDES generation, jitter/loss accounting |
//! | [RFC 4566](https://tools.ietf.org/html/rfc4566) | SDP | Track scanning for DESCRIBE/ANNOUNCE |
//! | [RFC 2069](https://tools.ietf.org/html/rfc2069) | Digest auth | `WWW-Authenticate` challenge/response |
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │ Server      — accept loop, Context orchestration│
//! ├────────────────────────────────────────────────┤
//! │ RtspSession — per-connection state machine      │
//! │ Auth        — realm discovery, Basic/Digest     │
//! │ Tunnel      — x-sessioncookie GET/POST broker   │
//! ├────────────────────────────────────────────────┤
//! │ MediaRegistry — schema/vhost/app/stream index   │
//! │ MediaSource   — ring buffer, ownership token    │
//! ├────────────────────────────────────────────────┤
//! │ Transports  — TCP interleaved, UDP, multicast   │
//! │ Rtcp        — per-track SR/RR/SDES contexts     │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use rtsp_relay::Server;
//!
//! let mut server = Server::new("0.0.0.0:8554");
//! server.start().unwrap();
//! // A pusher ANNOUNCEs rtsp://host:8554/live/cam1 and RECORDs;
//! // players DESCRIBE/SETUP/PLAY the same URL over TCP, UDP or
//! // multicast, or through the HTTP tunnel.
//! ```
//!
//! ## Crate layout
//!
//! - [`server`] — [`Server`] orchestrator.
//! - [`context`] — [`Context`]: config, registry, hooks, tunnel broker.
//! - [`session`] — the RTSP state machine and transport negotiation.
//! - [`protocol`] — request/response parsing, splitter, SDP scanning.
//! - [`media`] — stream identity, registry, sources, frame ring.
//! - [`auth`] — Basic/Digest verification.
//! - [`rtcp`] — RTCP contexts and packet building.
//! - [`transport`] — accept loop, UDP pairs, multicast.
//! - [`tunnel`] — RTSP-over-HTTP broker.
//! - [`events`] — embedder hooks (auth, on-demand pull, traffic report).
//! - [`error`] — [`RelayError`] and the session error value.

pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod media;
pub mod protocol;
pub mod rtcp;
pub mod server;
pub mod session;
pub mod transport;
pub mod tunnel;

pub use config::ServerConfig;
pub use context::Context;
pub use error::{RelayError, Result};
pub use events::EventHooks;
pub use media::registry::MediaRegistry;
pub use media::source::MediaSource;
pub use server::Server;
pub use session::RtspSession;
