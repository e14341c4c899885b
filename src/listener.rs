//! Per-port listener harness.
//!
//! Each configured port gets its own accept loop on a dedicated thread:
//! accept one client, hand it to a worker thread, join that worker before
//! accepting the next. One client at a time per port; further connections
//! queue in the kernel backlog. Socket setup failures are fatal to the
//! process.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;

use anyhow::{Context, Result};
use socket2::{Domain, Socket, Type};

use crate::connstate::ConnState;

const BACKLOG: i32 = 5;

/// Which post-close edge (if any) a listener raises on the bus after a
/// client disconnects.
#[derive(Clone, Copy)]
pub enum ClosedEdge {
    None,
    Video,
    Xwin,
    Executor,
}

fn bind_tcp(bind_addr: &str, port: u16) -> Result<TcpListener> {
    let addr: SocketAddr = format!("{bind_addr}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {bind_addr}:{port}"))?;

    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)
        .with_context(|| format!("socket() failed for port {port}"))?;
    socket
        .set_reuse_address(true)
        .with_context(|| format!("setsockopt(SO_REUSEADDR) failed for port {port}"))?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind() failed for {addr}"))?;
    socket
        .listen(BACKLOG)
        .with_context(|| format!("listen() failed for {addr}"))?;

    Ok(socket.into())
}

/// Run a single listener's accept loop forever on the calling thread.
///
/// `handler` runs on its own joined worker thread per connection and
/// returns when the session ends (cleanly or on error); its result is
/// only used for logging — a failure inside a worker terminates that
/// worker only, the listener keeps accepting.
pub fn run_listener<F>(
    name: &'static str,
    bind_addr: &str,
    port: u16,
    closed_edge: ClosedEdge,
    state: Arc<ConnState>,
    handler: F,
) -> Result<()>
where
    F: Fn(TcpStream, Arc<ConnState>) -> Result<()> + Send + Sync + 'static,
{
    let listener = bind_tcp(bind_addr, port)
        .with_context(|| format!("{name} listener setup failed"))?;
    let handler = Arc::new(handler);

    tracing::info!(port, name, "listening");

    loop {
        let (stream, peer) = listener
            .accept()
            .with_context(|| format!("{name} accept() failed"))?;
        tracing::info!(port, name, %peer, "client connected");

        state.client_connected();

        let worker_state = Arc::clone(&state);
        let worker_handler = Arc::clone(&handler);
        let join = std::thread::Builder::new()
            .name(format!("{name}-worker"))
            .spawn(move || worker_handler(stream, worker_state))
            .with_context(|| format!("failed to spawn {name} worker thread"))?;

        match join.join() {
            Ok(Ok(())) => tracing::debug!(port, name, "session ended cleanly"),
            Ok(Err(e)) => tracing::warn!(port, name, error = %e, "session ended with error"),
            Err(_) => tracing::warn!(port, name, "worker thread panicked"),
        }

        state.client_disconnected();
        match closed_edge {
            ClosedEdge::None => {}
            ClosedEdge::Video => state.raise_video_closed(),
            ClosedEdge::Xwin => state.raise_xwin_closed(),
            ClosedEdge::Executor => state.raise_executor_closed(),
        }
        tracing::info!(port, name, %peer, "client disconnected");
    }
}
