//! TCP accept loop for RTSP signaling.

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::context::Context;
use crate::session::RtspSession;

/// Non-blocking accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`Server::stop`](crate::Server::stop) can terminate it
/// promptly. Each accepted connection gets its own session thread.
pub fn accept_loop(listener: TcpListener, ctx: Context, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let ctx = ctx.clone();
                thread::spawn(move || {
                    RtspSession::handle(stream, ctx);
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "tcp accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}
