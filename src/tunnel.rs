//! HTTP tunnel broker (RTSP over HTTP).
//!
//! Firewalled players disguise RTSP as two HTTP/1.0 requests bound by a
//! shared `x-sessioncookie`: a GET whose response stream carries RTP,
//! RTCP and RTSP replies, and a POST whose body is an endless
//! base64-encoded stream of RTSP requests. The broker is the process-wide
//! table pairing them: GET registers a weak getter handle, POST looks it
//! up (consuming the entry) and forwards decoded bytes into the getter's
//! input.
//!
//! If the getter dies the poster shuts down; if the poster dies the
//! getter keeps serving RTP.

use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Input handle of a getter session. The getter owns the strong `Arc`
/// (and the receiving end); the broker only keeps a weak reference, so a
/// dead getter is detected by a failed upgrade or a closed channel.
pub struct GetterHandle {
    tx: Sender<Vec<u8>>,
}

impl GetterHandle {
    pub fn new(tx: Sender<Vec<u8>>) -> Arc<Self> {
        Arc::new(GetterHandle { tx })
    }

    /// Inject decoded RTSP bytes into the getter's signaling input.
    /// Fails when the getter session has gone away.
    pub fn inject(&self, data: Vec<u8>) -> std::result::Result<(), ()> {
        self.tx.send(data).map_err(|_| ())
    }
}

/// Process-wide `x-sessioncookie` → getter table.
#[derive(Default)]
pub struct TunnelBroker {
    map: Mutex<HashMap<String, Weak<GetterHandle>>>,
}

impl TunnelBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(TunnelBroker::default())
    }

    /// Register a getter under its cookie (GET request).
    pub fn register(&self, cookie: &str, handle: &Arc<GetterHandle>) {
        self.map
            .lock()
            .insert(cookie.to_string(), Arc::downgrade(handle));
    }

    /// Look up and consume the entry for a cookie (POST request).
    pub fn take(&self, cookie: &str) -> Option<Weak<GetterHandle>> {
        self.map.lock().remove(cookie)
    }

    /// Drop the entry a dying session registered, if still present.
    pub fn remove(&self, cookie: &str) {
        self.map.lock().remove(cookie);
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

/// Incremental base64 decoder for the POST payload stream.
///
/// The poster's bytes arrive split at arbitrary boundaries, so input is
/// buffered to 4-character quanta before decoding. Quanta are decoded
/// individually, which also accepts a concatenation of independently
/// padded base64 blobs (players encode each RTSP request on its own).
/// ASCII whitespace between quanta is ignored.
#[derive(Default)]
pub struct Base64StreamDecoder {
    pending: Vec<u8>,
}

impl Base64StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw poster bytes; returns the bytes decodable so far.
    pub fn push(&mut self, data: &[u8]) -> std::result::Result<Vec<u8>, String> {
        use base64::Engine as _;
        let engine = &base64::engine::general_purpose::STANDARD;

        self.pending
            .extend(data.iter().copied().filter(|b| !b.is_ascii_whitespace()));

        let complete = self.pending.len() / 4 * 4;
        let mut out = Vec::with_capacity(complete / 4 * 3);
        for quantum in self.pending[..complete].chunks(4) {
            let decoded = engine
                .decode(quantum)
                .map_err(|e| format!("bad base64 in tunnel stream: {}", e))?;
            out.extend_from_slice(&decoded);
        }
        self.pending.drain(..complete);
        Ok(out)
    }
}
