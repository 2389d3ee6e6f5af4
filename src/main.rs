//! ihaproxyd — IHA session relay daemon
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    Adapters (outer ring)                         │
//! │                                                                  │
//! │  SocketServer (Unix socket)            MeiDevice / Simulated     │
//! │        │                                    ▲                    │
//! │        ▼                                    │ frames             │
//! │  ServerPool ─▶ RpcEngine ─▶ SessionService ─▶ AppletLink         │
//! │  (workers)     (dispatch)   (IhaOperations)    │ events          │
//! │                                  │             ▼                 │
//! │                            SessionRegistry ◀─ NotificationRelay  │
//! │                                                                  │
//! │  Event pump: polls the link for unsolicited events between calls │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
#![deny(unused_must_use)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};

use ihaproxy::adapters::sim::SimulatedCoprocessor;
use ihaproxy::app::ports::{IhaOperations, NativeRuntime};
use ihaproxy::app::registry::SessionRegistry;
use ihaproxy::app::service::{SERVICE_VERSION, ServiceOptions, SessionService};
use ihaproxy::applet::AppletLink;
use ihaproxy::config::{ServiceConfig, TransportConfig};
use ihaproxy::relay::NotificationRelay;
use ihaproxy::rpc::engine::RpcEngine;
use ihaproxy::rpc::pool::ServerPool;
use ihaproxy::rpc::transport::Transport;

/// Set by SIGINT / SIGTERM.
static STOP: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Parser)]
#[command(name = "ihaproxyd", version, about = "IHA session relay daemon")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use the simulated co-processor regardless of the configured transport
    #[arg(long)]
    simulate: bool,

    /// Override the listening socket path
    #[arg(long)]
    socket: Option<PathBuf>,
}

// ── Logging ───────────────────────────────────────────────────

#[cfg(target_os = "android")]
fn init_logging(level: log::LevelFilter) {
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(level)
            .with_tag("ihaproxyd"),
    );
}

#[cfg(not(target_os = "android"))]
fn init_logging(level: log::LevelFilter) {
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

// ── Signals ───────────────────────────────────────────────────

extern "C" fn on_signal(_: libc::c_int) {
    STOP.store(true, Ordering::Release);
}

fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only touches an atomic.
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

// ── Main ──────────────────────────────────────────────────────

fn main() {
    if let Err(e) = try_main() {
        eprintln!("ihaproxyd: {:#}", e);
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => ServiceConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ServiceConfig::default(),
    };
    if args.simulate && !matches!(cfg.transport, TransportConfig::Simulated { .. }) {
        cfg.transport = TransportConfig::default();
    }
    if let Some(socket) = args.socket {
        cfg.socket_path = socket;
    }

    init_logging(cfg.level_filter());
    info!(
        "ihaproxyd v{} (interface version {:#010x})",
        env!("CARGO_PKG_VERSION"),
        SERVICE_VERSION
    );
    install_signal_handlers();

    match cfg.transport.clone() {
        TransportConfig::Simulated { preinstalled } => {
            let (sim, _handle) = SimulatedCoprocessor::with_apps(preinstalled);
            info!("SIM: simulated co-processor");
            serve(&cfg, sim)
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        TransportConfig::Device { path } => {
            info!("MEI: using {}", path.display());
            serve(&cfg, ihaproxy::adapters::mei::MeiDevice::new(path))
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        TransportConfig::Device { .. } => {
            anyhow::bail!("the device transport is only available on Linux and Android")
        }
    }
}

/// Wire the stack over `transport` and run until signalled.
fn serve<T>(cfg: &ServiceConfig, transport: T) -> Result<()>
where
    T: Transport + 'static,
{
    // ── 1. Registry + relay ───────────────────────────────────
    let registry = Arc::new(SessionRegistry::new());
    let relay = NotificationRelay::start(Arc::clone(&registry), Arc::new(NativeRuntime))
        .context("starting notification relay")?;

    // ── 2. Co-processor link + service ────────────────────────
    let link = AppletLink::new(transport, cfg.client_guid, relay.sink());
    let service = Arc::new(SessionService::new(
        Arc::clone(&registry),
        link,
        ServiceOptions::from(cfg),
    ));

    // ── 3. Dispatcher ─────────────────────────────────────────
    let engine = Arc::new(RpcEngine::new(
        Arc::clone(&service),
        cfg.interface_descriptor.clone(),
    ));
    let pool =
        ServerPool::start(Arc::clone(&engine), cfg.worker_threads).context("starting workers")?;

    // ── 4. IPC endpoint ───────────────────────────────────────
    let mut server = ihaproxy::adapters::socket::SocketServer::bind(&cfg.socket_path, Arc::clone(&pool))?
        .spawn()
        .context("starting accept loop")?;
    info!("{} ready on {}", cfg.service_name, server.path().display());

    // ── 5. Event pump ─────────────────────────────────────────
    let interval = Duration::from_millis(cfg.event_poll_interval_ms);
    while !STOP.load(Ordering::Acquire) {
        if service.is_initialized() {
            match service.poll_events() {
                Ok(0) => {}
                Ok(n) => debug!("IHA: pumped {} event(s)", n),
                Err(e) => warn!("IHA: event poll failed: {}", e),
            }
        }
        std::thread::sleep(interval);
    }

    // ── 6. Orderly shutdown ───────────────────────────────────
    info!("shutting down ({} request(s) served)", engine.served());
    server.shutdown();
    pool.shutdown();
    if let Err(e) = service.deinit() {
        warn!("IHA: deinit on shutdown failed: {}", e);
    }
    relay.shutdown();
    let c = relay.counters();
    info!(
        "RELAY: delivered {} unbound {} overflowed {} failed {}",
        c.delivered, c.unbound, c.overflowed, c.failed
    );
    Ok(())
}
