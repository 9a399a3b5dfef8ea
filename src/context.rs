//! Process-wide engine state, threaded through session construction.
//!
//! All "global" collaborators (registry, tunnel broker, multicast table,
//! event hooks, config) live behind one cloneable [`Context`] value.
//! Production builds one; tests build as many isolated worlds as they
//! need.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::events::{EventHooks, Events};
use crate::media::registry::MediaRegistry;
use crate::transport::multicast::MulticastTable;
use crate::transport::udp::PortAllocator;
use crate::tunnel::TunnelBroker;

#[derive(Clone)]
pub struct Context {
    pub config: Arc<ServerConfig>,
    pub events: Arc<Events>,
    pub registry: MediaRegistry,
    pub tunnel: Arc<TunnelBroker>,
    pub multicast: Arc<MulticastTable>,
    pub udp_ports: Arc<PortAllocator>,
    session_tags: Arc<AtomicU64>,
}

impl Context {
    pub fn new(config: ServerConfig, hooks: EventHooks) -> Self {
        let events = Events::new(hooks);
        let registry = MediaRegistry::new(&config, events.clone());
        let udp_ports = Arc::new(PortAllocator::new(config.udp_port_min));
        Context {
            config: Arc::new(config),
            events,
            registry,
            tunnel: TunnelBroker::new(),
            multicast: MulticastTable::new(),
            udp_ports,
            session_tags: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Unique identity for a session, used as its listener tag.
    pub fn next_session_tag(&self) -> u64 {
        self.session_tags.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new(ServerConfig::default(), EventHooks::default())
    }
}
