//! Hook points and the media-changed listener bus.
//!
//! The engine is a library: authorization, credential lookup, on-demand
//! pulling and traffic accounting are the embedder's business. Each
//! concern is an optional hook on [`EventHooks`]; an unset hook behaves
//! like "nobody is listening" (publish/play allowed, no realm, no
//! credential, no on-demand pull).
//!
//! Hooks receive an *invoker* they may call inline or later from any
//! thread; sessions re-enter their own thread via channels, so a hook
//! can do slow lookups without blocking the engine.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::media::{MediaInfo, MediaTuple};

/// Options granted by the publish-authorization hook.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Per-stream override of the configured publisher-reconnect grace.
    pub continue_push_ms: Option<u64>,
}

/// Secret handed back by the credential hook.
pub enum Credential {
    /// Cleartext password; the engine hashes it as needed.
    Plain(String),
    /// Pre-hashed `md5(user:realm:pass)`; only usable for Digest.
    Ha1(String),
}

/// Traffic summary fired at session end when bytes crossed the threshold.
#[derive(Debug, Clone)]
pub struct FlowReport {
    pub media: MediaInfo,
    pub bytes: u64,
    pub duration_secs: u64,
    pub is_player: bool,
    pub peer_addr: String,
}

pub type PublishInvoker = Box<dyn FnOnce(Result<PublishOptions, String>) + Send>;
pub type PlayInvoker = Box<dyn FnOnce(Result<(), String>) + Send>;
pub type RealmInvoker = Box<dyn FnOnce(String) + Send>;
pub type CredentialInvoker = Box<dyn FnOnce(Option<Credential>) + Send>;
/// Callback a not-found subscriber may use to cut the waiting player loose.
pub type ClosePlayer = Arc<dyn Fn() + Send + Sync>;

type PublishHook = dyn Fn(&MediaInfo, PublishInvoker) + Send + Sync;
type PlayHook = dyn Fn(&MediaInfo, PlayInvoker) + Send + Sync;
type RealmHook = dyn Fn(&MediaInfo, RealmInvoker) + Send + Sync;
type CredentialHook = dyn Fn(&str, &str, bool, CredentialInvoker) + Send + Sync;
type NotFoundHook = dyn Fn(&MediaInfo, ClosePlayer) + Send + Sync;
type FlowHook = dyn Fn(&FlowReport) + Send + Sync;
type Mp4Hook = dyn Fn(&str, &MediaTuple) -> bool + Send + Sync;

/// Embedder-settable hooks. Wire these up before `Server::start`.
#[derive(Default)]
pub struct EventHooks {
    /// ANNOUNCE authorization. Err(reason) → 401.
    pub on_publish: Option<Box<PublishHook>>,
    /// Generic play-URL authorization, used when no realm is configured.
    pub on_play: Option<Box<PlayHook>>,
    /// Realm discovery for DESCRIBE. Empty realm → no RTSP auth.
    pub on_realm: Option<Box<RealmHook>>,
    /// Credential lookup: (realm, user, cleartext_required) → secret.
    /// Basic auth sets `cleartext_required`; a [`Credential::Ha1`] answer
    /// cannot satisfy it.
    pub on_credential: Option<Box<CredentialHook>>,
    /// A player asked for a stream nobody publishes. The subscriber may
    /// start pulling on demand, or call `close_player` to fail fast.
    pub on_stream_not_found: Option<Box<NotFoundHook>>,
    /// Session ended having moved at least the configured threshold.
    pub on_flow_report: Option<Box<FlowHook>>,
    /// On-demand MP4 loader: registers a source for the tuple and returns
    /// whether it did. Gated by schema and config in the registry.
    pub on_mp4_load: Option<Box<Mp4Hook>>,
}

type MediaListener = Arc<dyn Fn(bool, &str, &MediaTuple) + Send + Sync>;

/// Hook table plus the tagged media-changed listener bus used by
/// `find_async` waits.
pub struct Events {
    pub hooks: EventHooks,
    media_listeners: Mutex<HashMap<u64, MediaListener>>,
}

impl Events {
    pub fn new(hooks: EventHooks) -> Arc<Self> {
        Arc::new(Events {
            hooks,
            media_listeners: Mutex::new(HashMap::new()),
        })
    }

    /// Register a media-changed listener under a caller-chosen tag.
    /// Re-using a tag replaces the previous listener.
    pub fn add_media_listener(&self, tag: u64, listener: MediaListener) {
        self.media_listeners.lock().insert(tag, listener);
    }

    pub fn remove_media_listener(&self, tag: u64) {
        self.media_listeners.lock().remove(&tag);
    }

    /// Broadcast a registration (`regist == true`) or unregistration
    /// event. Listeners run outside the bus lock.
    pub fn emit_media_changed(&self, regist: bool, schema: &str, tuple: &MediaTuple) {
        let snapshot: Vec<MediaListener> = self.media_listeners.lock().values().cloned().collect();
        for listener in snapshot {
            listener(regist, schema, tuple);
        }
    }

    pub fn emit_stream_not_found(&self, info: &MediaInfo, close_player: ClosePlayer) {
        if let Some(hook) = &self.hooks.on_stream_not_found {
            hook(info, close_player);
        }
    }

    pub fn emit_flow_report(&self, report: &FlowReport) {
        if let Some(hook) = &self.hooks.on_flow_report {
            hook(report);
        }
    }
}

impl Default for Events {
    fn default() -> Self {
        Events {
            hooks: EventHooks::default(),
            media_listeners: Mutex::new(HashMap::new()),
        }
    }
}
