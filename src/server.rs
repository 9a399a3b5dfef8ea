//! High-level server orchestrator.

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::config::ServerConfig;
use crate::context::Context;
use crate::error::{RelayError, Result};
use crate::events::EventHooks;
use crate::transport::tcp;

/// RTSP relay server: owns the engine [`Context`] and the signaling
/// listener.
///
/// # Usage
///
/// ```no_run
/// use rtsp_relay::Server;
///
/// let mut server = Server::new("0.0.0.0:8554");
/// server.start().unwrap();
/// // Pushers ANNOUNCE/RECORD to rtsp://host:8554/app/stream,
/// // players DESCRIBE/PLAY the same URL.
/// ```
///
/// Tests build isolated servers with [`with_context`](Self::with_context)
/// and custom [`ServerConfig`]/[`EventHooks`].
pub struct Server {
    ctx: Context,
    running: Arc<AtomicBool>,
    bind_addr: String,
}

impl Server {
    /// Create a server with default config and no hooks.
    ///
    /// `bind_addr` must be `host:port` with an explicit non-zero port
    /// (e.g. `0.0.0.0:8554`); validation happens in [`start`](Self::start).
    pub fn new(bind_addr: &str) -> Self {
        Self::with_context(bind_addr, Context::default())
    }

    /// Create a server with custom config and hooks.
    pub fn with_config(bind_addr: &str, config: ServerConfig, hooks: EventHooks) -> Self {
        Self::with_context(bind_addr, Context::new(config, hooks))
    }

    /// Create a server over an existing engine context.
    pub fn with_context(bind_addr: &str, ctx: Context) -> Self {
        Server {
            ctx,
            running: Arc::new(AtomicBool::new(false)),
            bind_addr: bind_addr.to_string(),
        }
    }

    /// The engine context (registry, hooks, tunnel broker). Embedders use
    /// this to enumerate sources or register their own.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RelayError::AlreadyRunning);
        }

        let addr: SocketAddr = self.bind_addr.parse().map_err(|_| {
            RelayError::InvalidBindAddress(format!(
                "expected host:port with explicit port, got {:?}",
                self.bind_addr
            ))
        })?;
        if addr.port() == 0 {
            return Err(RelayError::InvalidBindAddress(
                "port must be explicit (non-zero)".to_string(),
            ));
        }

        let listener = TcpListener::bind(&self.bind_addr)?;
        listener.set_nonblocking(true)?;

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let ctx = self.ctx.clone();

        tracing::info!(addr = %self.bind_addr, "rtsp server listening");
        thread::spawn(move || {
            tcp::accept_loop(listener, ctx, running);
        });

        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("server stopping");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
