//! Global index of live streams: schema → vhost → app → stream.
//!
//! The registry stores weak references; sources are kept alive by their
//! owning sessions. Mutations happen under one lock with short critical
//! sections, and every media-changed event is emitted after the lock is
//! released, so mutation happens-before event delivery and listeners can
//! re-enter the registry freely.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{ServerConfig, DEFAULT_VHOST};
use crate::error::{RelayError, Result};
use crate::events::{ClosePlayer, Events};

use super::source::MediaSource;
use super::{MediaInfo, MediaTuple, SCHEMA_FMP4, SCHEMA_HLS, SCHEMA_HLS_FMP4, SCHEMA_RTMP, SCHEMA_RTSP, SCHEMA_TS};

type StreamMap = HashMap<String, Weak<MediaSource>>;
type AppMap = HashMap<String, StreamMap>;
type VhostMap = HashMap<String, AppMap>;
type SchemaMap = HashMap<String, VhostMap>;

/// Lock-guarded index shared between the registry handle and source
/// destructors.
pub struct RegistryShared {
    map: Mutex<SchemaMap>,
    events: Arc<Events>,
}

impl RegistryShared {
    /// Remove the slot iff it still holds `ptr` (or a dead weak), then
    /// compact empty parent maps. Emits the unregistration event on hit.
    pub(super) fn unregist_ptr(&self, schema: &str, tuple: &MediaTuple, ptr: *const MediaSource) -> bool {
        let mut hit = false;
        {
            let mut map = self.map.lock();
            if let Some(vhosts) = map.get_mut(schema) {
                if let Some(apps) = vhosts.get_mut(&tuple.vhost) {
                    if let Some(streams) = apps.get_mut(&tuple.app) {
                        if let Some(slot) = streams.get(&tuple.stream) {
                            if slot.as_ptr() == ptr || slot.strong_count() == 0 {
                                streams.remove(&tuple.stream);
                                hit = true;
                            }
                        }
                        if streams.is_empty() {
                            apps.remove(&tuple.app);
                        }
                    }
                    if apps.is_empty() {
                        vhosts.remove(&tuple.vhost);
                    }
                }
                if vhosts.is_empty() {
                    map.remove(schema);
                }
            }
        }
        if hit {
            tracing::info!(url = %format!("{}://{}", schema, tuple.short_url()), "media unregistered");
            self.events.emit_media_changed(false, schema, tuple);
        }
        hit
    }
}

/// Registry handle. Cheap to clone; all clones share the same index.
#[derive(Clone)]
pub struct MediaRegistry {
    shared: Arc<RegistryShared>,
    events: Arc<Events>,
    enable_vhost: bool,
    enable_mp4: bool,
    record_app: String,
    max_wait_ms: u64,
}

impl MediaRegistry {
    pub fn new(cfg: &ServerConfig, events: Arc<Events>) -> Self {
        MediaRegistry {
            shared: Arc::new(RegistryShared {
                map: Mutex::new(HashMap::new()),
                events: events.clone(),
            }),
            events,
            enable_vhost: cfg.enable_vhost,
            enable_mp4: cfg.enable_mp4_fallback,
            record_app: cfg.record_app.clone(),
            max_wait_ms: cfg.max_stream_wait_ms,
        }
    }

    /// Insert a source. Re-registering the same object is a no-op; a
    /// different live object at the slot fails with `AlreadyExists`.
    pub fn regist(&self, source: &Arc<MediaSource>) -> Result<()> {
        let tuple = source.tuple().clone();
        let schema = source.schema().to_string();
        {
            let mut map = self.shared.map.lock();
            let slot = map
                .entry(schema.clone())
                .or_default()
                .entry(tuple.vhost.clone())
                .or_default()
                .entry(tuple.app.clone())
                .or_default()
                .entry(tuple.stream.clone())
                .or_insert_with(Weak::new);
            if let Some(existing) = slot.upgrade() {
                if Arc::ptr_eq(&existing, source) {
                    return Ok(());
                }
                return Err(RelayError::AlreadyExists(source.url()));
            }
            *slot = Arc::downgrade(source);
        }
        source.bind_registry(&self.shared);
        tracing::info!(url = %source.url(), "media registered");
        self.events.emit_media_changed(true, &schema, &tuple);
        Ok(())
    }

    /// Explicitly remove a source (sources also unregister on drop).
    pub fn unregist(&self, source: &Arc<MediaSource>) -> bool {
        self.shared
            .unregist_ptr(source.schema(), source.tuple(), Arc::as_ptr(source))
    }

    /// Point lookup. Empty app or stream returns `None` — enumeration
    /// goes through [`for_each`](Self::for_each).
    pub fn find(
        &self,
        schema: &str,
        vhost: &str,
        app: &str,
        stream: &str,
        allow_mp4: bool,
    ) -> Option<Arc<MediaSource>> {
        if app.is_empty() || stream.is_empty() {
            return None;
        }
        let vhost = self.effective_vhost(vhost);

        let hit = self.lookup(schema, &vhost, app, stream);
        if hit.is_some() {
            return hit;
        }

        // On-demand MP4: never for HLS, only for the record app.
        if allow_mp4 && self.enable_mp4 && schema != SCHEMA_HLS && app == self.record_app {
            if let Some(loader) = &self.events.hooks.on_mp4_load {
                let tuple = MediaTuple::new(&vhost, app, stream);
                if loader(schema, &tuple) {
                    return self.lookup(schema, &vhost, app, stream);
                }
            }
        }
        None
    }

    /// Try every schema in relay priority order, returning the first hit.
    pub fn find_any_schema(
        &self,
        vhost: &str,
        app: &str,
        stream: &str,
        allow_mp4: bool,
    ) -> Option<Arc<MediaSource>> {
        for schema in [SCHEMA_RTMP, SCHEMA_RTSP, SCHEMA_TS, SCHEMA_FMP4, SCHEMA_HLS, SCHEMA_HLS_FMP4] {
            if let Some(src) = self.find(schema, vhost, app, stream, allow_mp4) {
                return Some(src);
            }
        }
        None
    }

    /// Visit every live source matching the filters; an empty string is a
    /// wildcard at that level. Weak references are snapshotted under the
    /// lock and the callback runs outside it.
    pub fn for_each(
        &self,
        mut cb: impl FnMut(&Arc<MediaSource>),
        schema: &str,
        vhost: &str,
        app: &str,
        stream: &str,
    ) {
        let snapshot: Vec<Weak<MediaSource>> = {
            let map = self.shared.map.lock();
            let mut out = Vec::new();
            for (sk, vhosts) in map.iter() {
                if !schema.is_empty() && sk != schema {
                    continue;
                }
                for (vk, apps) in vhosts.iter() {
                    if !vhost.is_empty() && vk != vhost {
                        continue;
                    }
                    for (ak, streams) in apps.iter() {
                        if !app.is_empty() && ak != app {
                            continue;
                        }
                        for (stk, weak) in streams.iter() {
                            if !stream.is_empty() && stk != stream {
                                continue;
                            }
                            out.push(weak.clone());
                        }
                    }
                }
            }
            out
        };
        for weak in snapshot {
            if let Some(src) = weak.upgrade() {
                cb(&src);
            }
        }
    }

    /// Asynchronous lookup with registration wait.
    ///
    /// On a hit the callback runs synchronously on the caller's thread.
    /// Otherwise a media-changed listener scoped by `tag` and a timeout
    /// race to resolve the wait; a not-found broadcast lets a subscriber
    /// start pulling on demand or cut the player loose. Whichever of
    /// {registration, timeout, close_player} fires first wins — an atomic
    /// once-gate guarantees the callback runs exactly once, and the
    /// listener and the timeout are cancelled together.
    pub fn find_async(
        &self,
        info: &MediaInfo,
        tag: u64,
        cb: impl FnOnce(Option<Arc<MediaSource>>) + Send + 'static,
    ) {
        if let Some(src) = self.find(&info.schema, &info.vhost, &info.app, &info.stream, true) {
            cb(Some(src));
            return;
        }

        type Gate = Mutex<Option<Box<dyn FnOnce(Option<Arc<MediaSource>>) + Send>>>;
        let gate: Arc<Gate> = Arc::new(Mutex::new(Some(Box::new(cb))));
        let fire = {
            let gate = gate.clone();
            move |src: Option<Arc<MediaSource>>| {
                if let Some(cb) = gate.lock().take() {
                    cb(src);
                }
            }
        };

        let cancelled = Arc::new(AtomicBool::new(false));
        let registry = self.clone();
        let events = self.events.clone();
        let wanted = info.clone();

        // Registration listener: on a matching event, cancel the timeout,
        // drop the listener and re-run the lookup.
        {
            let fire = fire.clone();
            let cancelled = cancelled.clone();
            let registry = registry.clone();
            let events = events.clone();
            let wanted = wanted.clone();
            self.events.add_media_listener(
                tag,
                Arc::new(move |regist, schema, tuple| {
                    if !regist
                        || schema != wanted.schema
                        || tuple.vhost != wanted.vhost
                        || tuple.app != wanted.app
                        || tuple.stream != wanted.stream
                    {
                        return;
                    }
                    cancelled.store(true, Ordering::Release);
                    events.remove_media_listener(tag);
                    tracing::debug!(url = %wanted.short_url(), "awaited stream registered");
                    let src =
                        registry.find(&wanted.schema, &wanted.vhost, &wanted.app, &wanted.stream, false);
                    fire(src);
                }),
            );
        }

        // Timeout: give up after the configured wait.
        {
            let fire = fire.clone();
            let cancelled = cancelled.clone();
            let events = events.clone();
            let wait = Duration::from_millis(self.max_wait_ms);
            std::thread::spawn(move || {
                std::thread::sleep(wait);
                if cancelled.swap(true, Ordering::AcqRel) {
                    return;
                }
                events.remove_media_listener(tag);
                fire(None);
            });
        }

        // Not-found broadcast: the subscriber may pull on demand, or
        // refuse by closing the player immediately.
        let close_player: ClosePlayer = {
            let events = events.clone();
            Arc::new(move || {
                if cancelled.swap(true, Ordering::AcqRel) {
                    return;
                }
                events.remove_media_listener(tag);
                fire(None);
            })
        };
        self.events.emit_stream_not_found(info, close_player);
    }

    fn effective_vhost(&self, vhost: &str) -> String {
        if !self.enable_vhost || vhost.is_empty() {
            DEFAULT_VHOST.to_string()
        } else {
            vhost.to_string()
        }
    }

    fn lookup(&self, schema: &str, vhost: &str, app: &str, stream: &str) -> Option<Arc<MediaSource>> {
        self.shared
            .map
            .lock()
            .get(schema)?
            .get(vhost)?
            .get(app)?
            .get(stream)?
            .upgrade()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventHooks;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn registry() -> MediaRegistry {
        MediaRegistry::new(&ServerConfig::default(), Events::new(EventHooks::default()))
    }

    fn src(app: &str, stream: &str) -> Arc<MediaSource> {
        MediaSource::new(SCHEMA_RTSP, MediaTuple::new("", app, stream))
    }

    #[test]
    fn regist_find_unregist() {
        let reg = registry();
        let source = src("live", "cam1");
        reg.regist(&source).unwrap();

        assert!(reg.find(SCHEMA_RTSP, "", "live", "cam1", false).is_some());
        assert!(reg.find(SCHEMA_RTSP, "", "live", "other", false).is_none());

        assert!(reg.unregist(&source));
        assert!(reg.find(SCHEMA_RTSP, "", "live", "cam1", false).is_none());
    }

    #[test]
    fn empty_app_or_stream_is_not_enumeration() {
        let reg = registry();
        let source = src("live", "cam1");
        reg.regist(&source).unwrap();
        assert!(reg.find(SCHEMA_RTSP, "", "", "cam1", false).is_none());
        assert!(reg.find(SCHEMA_RTSP, "", "live", "", false).is_none());
    }

    #[test]
    fn duplicate_regist_same_object_is_noop() {
        let reg = registry();
        let source = src("live", "cam1");
        reg.regist(&source).unwrap();
        reg.regist(&source).unwrap();
    }

    #[test]
    fn duplicate_regist_different_object_fails() {
        let reg = registry();
        let a = src("live", "cam1");
        let b = src("live", "cam1");
        reg.regist(&a).unwrap();
        match reg.regist(&b) {
            Err(RelayError::AlreadyExists(_)) => {}
            other => panic!("expected AlreadyExists, got {:?}", other.err()),
        }
    }

    #[test]
    fn drop_unregisters() {
        let reg = registry();
        let source = src("live", "cam1");
        reg.regist(&source).unwrap();
        drop(source);
        assert!(reg.find(SCHEMA_RTSP, "", "live", "cam1", false).is_none());
    }

    #[test]
    fn find_any_schema_priority() {
        let reg = registry();
        let rtsp = src("live", "cam1");
        reg.regist(&rtsp).unwrap();
        let rtmp = MediaSource::new(SCHEMA_RTMP, MediaTuple::new("", "live", "cam1"));
        reg.regist(&rtmp).unwrap();

        let hit = reg.find_any_schema("", "live", "cam1", false).unwrap();
        assert_eq!(hit.schema(), SCHEMA_RTMP, "rtmp wins the priority order");
    }

    #[test]
    fn for_each_wildcards() {
        let reg = registry();
        let a = src("live", "cam1");
        let b = src("live", "cam2");
        let c = src("vod", "cam1");
        for s in [&a, &b, &c] {
            reg.regist(s).unwrap();
        }

        let mut seen = 0;
        reg.for_each(|_| seen += 1, SCHEMA_RTSP, "", "", "");
        assert_eq!(seen, 3);

        let mut seen = 0;
        reg.for_each(|_| seen += 1, SCHEMA_RTSP, "", "live", "");
        assert_eq!(seen, 2);

        let mut seen = 0;
        reg.for_each(|_| seen += 1, SCHEMA_RTSP, "", "", "cam1");
        assert_eq!(seen, 2);
    }

    #[test]
    fn mp4_fallback_gated_by_schema() {
        let loads = Arc::new(AtomicUsize::new(0));
        let l = loads.clone();
        let mut hooks = EventHooks::default();
        hooks.on_mp4_load = Some(Box::new(move |_, _| {
            l.fetch_add(1, Ordering::SeqCst);
            false
        }));
        let mut cfg = ServerConfig::default();
        cfg.record_app = "record".to_string();
        let reg = MediaRegistry::new(&cfg, Events::new(hooks));

        // HLS schema never consults the loader.
        assert!(reg.find(SCHEMA_HLS, "", "record", "movie", true).is_none());
        assert_eq!(loads.load(Ordering::SeqCst), 0);

        // Other schemas do, for the record app.
        assert!(reg.find(SCHEMA_RTSP, "", "record", "movie", true).is_none());
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        // Non-record apps skip the loader.
        assert!(reg.find(SCHEMA_RTSP, "", "live", "movie", true).is_none());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn find_async_immediate_hit_is_synchronous() {
        let reg = registry();
        let source = src("live", "cam1");
        reg.regist(&source).unwrap();

        let (tx, rx) = mpsc::channel();
        let info = MediaInfo::parse("rtsp://127.0.0.1/live/cam1", false);
        reg.find_async(&info, 1, move |src| {
            tx.send(src.is_some()).unwrap();
        });
        assert!(rx.try_recv().unwrap(), "hit must resolve synchronously");
    }

    #[test]
    fn find_async_resolves_on_registration() {
        let reg = registry();
        let (tx, rx) = mpsc::channel();
        let info = MediaInfo::parse("rtsp://127.0.0.1/live/cam1", false);
        reg.find_async(&info, 2, move |src| {
            tx.send(src.is_some()).unwrap();
        });

        let source = src("live", "cam1");
        reg.regist(&source).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
    }

    #[test]
    fn find_async_times_out_exactly_once() {
        let mut cfg = ServerConfig::default();
        cfg.max_stream_wait_ms = 50;
        let reg = MediaRegistry::new(&cfg, Events::new(EventHooks::default()));

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let (tx, rx) = mpsc::channel();
        let info = MediaInfo::parse("rtsp://127.0.0.1/live/cam1", false);
        reg.find_async(&info, 3, move |src| {
            c.fetch_add(1, Ordering::SeqCst);
            tx.send(src.is_none()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
        // A late registration must not re-invoke the callback.
        let source = src("live", "cam1");
        reg.regist(&source).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn find_async_close_player_wins() {
        let mut hooks = EventHooks::default();
        hooks.on_stream_not_found = Some(Box::new(|_, close| close()));
        let mut cfg = ServerConfig::default();
        cfg.max_stream_wait_ms = 10_000;
        let reg = MediaRegistry::new(&cfg, Events::new(hooks));

        let (tx, rx) = mpsc::channel();
        let info = MediaInfo::parse("rtsp://127.0.0.1/live/cam1", false);
        reg.find_async(&info, 4, move |src| {
            tx.send(src.is_none()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
    }
}
