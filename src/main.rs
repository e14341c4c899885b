//! Device-side streaming and control daemon for the NX remote controller.
//!
//! Five TCP listeners (notify, video, xwin, executor) plus a UDP discovery
//! broadcaster, all sharing one process-wide connection-state bus. See
//! DESIGN.md for how each module maps onto the original daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::signal::{signal, SigHandler, Signal};

use nx_remote_controller_daemon::config::{self, DaemonConfig};
use nx_remote_controller_daemon::connstate::ConnState;
use nx_remote_controller_daemon::listener::{self, ClosedEdge};
use nx_remote_controller_daemon::{discovery, executor, notify, video, xwin};

/// Streaming and control daemon bridging the device's framebuffer, X
/// session, and input stack to the NX remote controller app.
#[derive(Parser, Debug)]
#[command(name = "nx-remote-controller-daemon", version, about)]
struct Cli {
    /// Path to the daemon configuration file (TOML).
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Override the address every listener binds to.
    #[arg(long)]
    bind_addr: Option<String>,

    /// Enable verbose (debug-level) logging.
    #[arg(long, short)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    if let Err(e) = run(cli) {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    // SIGPIPE would otherwise kill the process on the first write to a
    // client that already hung up; SIGCHLD is ignored so backgrounded
    // `@`-dispatched children self-reap. Must run before any worker
    // thread is spawned.
    unsafe {
        signal(Signal::SIGPIPE, SigHandler::SigIgn).context("failed to ignore SIGPIPE")?;
        signal(Signal::SIGCHLD, SigHandler::SigIgn).context("failed to ignore SIGCHLD")?;
    }

    let mut config = DaemonConfig::load(cli.config.as_deref())?;
    if let Some(bind_addr) = cli.bind_addr {
        config.bind_addr = bind_addr;
    }

    tracing::info!(
        bind = %config.bind_addr,
        "Starting nx-remote-controller-daemon"
    );

    let state = Arc::new(ConnState::new());
    state.set_video_fps(config.initial_fps);
    state.set_xwin_fps(config.initial_fps);

    spawn_listener("notify", config::PORT_NOTIFY, ClosedEdge::None, &state, &config, |client, state, config| {
        notify::handle(client, state, config)
    })?;
    spawn_listener("video", config::PORT_VIDEO, ClosedEdge::Video, &state, &config, |client, state, config| {
        video::handle(client, state, config)
    })?;
    spawn_listener("xwin", config::PORT_XWIN, ClosedEdge::Xwin, &state, &config, |client, state, config| {
        xwin::handle(client, state, config)
    })?;
    spawn_listener("executor", config::PORT_EXECUTOR, ClosedEdge::Executor, &state, &config, |client, state, config| {
        executor::handle(client, state, config)
    })?;

    // The discovery broadcaster runs on the main thread after every
    // listener is launched.
    discovery::run(state, &config)
}

/// Spawn one listener's accept loop on a dedicated detached thread. Setup
/// failures (bind/listen) are fatal and bubble up through the returned
/// join handle's first `accept` error, logged by the listener itself; a
/// failure to even spawn the thread is fatal to the whole process.
fn spawn_listener<F>(
    name: &'static str,
    port: u16,
    closed_edge: ClosedEdge,
    state: &Arc<ConnState>,
    config: &DaemonConfig,
    handler: F,
) -> Result<()>
where
    F: Fn(std::net::TcpStream, Arc<ConnState>, &DaemonConfig) -> Result<()> + Send + Sync + Copy + 'static,
{
    let state = Arc::clone(state);
    let config = config.clone();
    std::thread::Builder::new()
        .name(format!("{name}-listener"))
        .spawn(move || {
            let bind_addr = config.bind_addr.clone();
            let result = listener::run_listener(name, &bind_addr, port, closed_edge, state, move |client, state| {
                handler(client, state, &config)
            });
            if let Err(e) = result {
                tracing::error!(name, "{e:#}");
                std::process::exit(1);
            }
        })
        .with_context(|| format!("failed to spawn {name} listener thread"))?;
    Ok(())
}
