// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Strata — HTTP/1.x caching proxy
//
//  Architecture: monoio thread-per-core data plane, one reactor per
//  worker; JSON-RPC admin plane on a dedicated tokio thread.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use strata_admin::AdminState;
use strata_core::ProxyConfig;
use strata_io::StekStore;
use strata_proxy::worker::{self, SharedState};
use tracing::info;

/// Global shutdown flag — flipped by the signal handler.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = "strata", version, about = "Strata — HTTP/1.x caching proxy")]
struct Cli {
    /// Path to the records configuration file
    #[arg(short, long, default_value = "/etc/strata/records.yaml")]
    config: PathBuf,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Tracing ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Strata starting");

    // ── Config ──
    let config = if cli.config.exists() {
        info!(path = %cli.config.display(), "Loading config file");
        ProxyConfig::load(&cli.config)?
    } else {
        info!("No config file found, using defaults");
        ProxyConfig::default()
    };
    let num_workers = config.effective_workers();
    info!(workers = num_workers, node = %config.node_id, "Worker count");

    // ── Session-ticket keys ──
    let stek = match config.tls.stek_path.as_deref() {
        Some(path) if Path::new(path).exists() => {
            info!(path = path, "Loading session-ticket keys");
            StekStore::load(Path::new(path))?
        }
        _ => StekStore::new_random(),
    };

    // ── Shared state ──
    let admin_config = config.admin.clone();
    let shared = SharedState::new(config, stek);

    // ── Admin plane on its own tokio thread ──
    if admin_config.enabled {
        let state = Arc::new(AdminState {
            drain: Arc::clone(&shared.drain),
            shutdown: Arc::clone(&shared.shutdown),
            records: Arc::clone(&shared.records),
            config: Arc::clone(&shared.config),
            config_path: cli.config.clone(),
        });
        let dispatcher = strata_admin::build_dispatcher(Arc::clone(&state));
        strata_admin::server::spawn_admin_thread(
            state,
            dispatcher,
            PathBuf::from(&admin_config.socket_path),
        );
        info!(socket = %admin_config.socket_path, "Admin interface started");
    }

    // ── Data plane ──
    let worker_handles = worker::spawn_workers(Arc::clone(&shared), num_workers);
    info!(
        workers = num_workers,
        addr = %shared.config.load().proxy.http_addr,
        "Strata is ready — serving traffic"
    );

    // ── Shutdown: SIGTERM/SIGINT or admin_server_shutdown ──
    setup_signal_handler();
    while !SHUTDOWN.load(Ordering::Relaxed) && !shared.shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
    shared.shutdown.store(true, Ordering::Relaxed);
    info!("Shutdown signal received, stopping");

    // Workers notice the flag on their next accept/tick; remaining cleanup
    // belongs to the OS.
    drop(worker_handles);
    info!("Strata stopped");
    Ok(())
}

fn setup_signal_handler() {
    for sig in [libc::SIGTERM, libc::SIGINT] {
        unsafe {
            libc::signal(sig, signal_handler as libc::sighandler_t);
        }
    }
}

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}
