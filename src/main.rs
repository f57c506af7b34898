//! Process entrypoint: logging, signal handling, pre-spawn, dual-listener
//! bind, and the shutdown sequence.

use std::process::ExitCode;
use std::sync::Arc;

use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;

use loolwsd_rs::config::{Config, INTERNAL_PORT};
use loolwsd_rs::context::AppContext;
use loolwsd_rs::error::AppError;
use loolwsd_rs::supervisor::{self, SupervisorLink};
use loolwsd_rs::{endpoints, maintenance, test_driver};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> ExitCode {
    init_logging();
    install_panic_hook();

    let config = match Config::parse_and_validate() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(64);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::from(70);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            log::error!("fatal startup error: {e}");
            ExitCode::from(70)
        }
    }
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {panic_info}");
        default_hook(panic_info);
    }));
}

async fn run(config: Config) -> anyhow::Result<()> {
    write_pid_file()?;

    let (command_path, _event_path) = supervisor::ensure_pipes(&config.pipe_dir())?;

    let supervisor = if let Some(bin) = &config.supervisor_bin {
        Arc::new(SupervisorLink::launch(bin, &command_path, &[]).await?)
    } else {
        log::warn!("no --supervisor-bin given, running with no supervisor process");
        Arc::new(SupervisorLink::disconnected())
    };

    let cancel = CancellationToken::new();
    install_signal_handlers(cancel.clone())?;

    let ctx = Arc::new(AppContext::new(config.clone(), supervisor.clone(), cancel.clone()));
    ctx.pool.pre_spawn().await;

    let internal_listener = tokio::net::TcpListener::bind(("127.0.0.1", INTERNAL_PORT)).await?;
    let internal_task = tokio::spawn(endpoints::internal::run(ctx.clone(), internal_listener));

    let maintenance_task = tokio::spawn(maintenance::run(ctx.clone()));

    let public_task = if config.test {
        log::info!("--test mode: skipping the public listener, driving one session from stdin");
        Some(tokio::spawn(async move {
            if let Err(e) = test_driver::run(ctx.clone()).await {
                log::error!("stdin driver ended with an error: {e}");
            }
        }))
    } else {
        Some(tokio::spawn(run_public_listener(ctx.clone())))
    };

    cancel.cancelled().await;
    log::info!("shutting down");

    internal_task.abort();
    if let Some(public_task) = public_task {
        public_task.abort();
    }
    maintenance_task.abort();

    supervisor.shutdown().await;
    supervisor.terminate().await;

    cleanup_childroot(&config.childroot);

    Ok(())
}

/// Binds the public HTTPS listener and serves the router built by
/// [`endpoints::public::router`].
///
/// Certificate/key paths are a configuration-file concern out of scope
/// here (SPEC_FULL.md §10.5); this binds plain HTTP so the router itself —
/// discovery, the upgrade path, conversion — stays exercisable end to end.
/// A real deployment builds an `axum_server::tls_rustls::RustlsConfig` from
/// its certificate files and calls `axum_server::bind_rustls` instead.
async fn run_public_listener(ctx: Arc<AppContext>) {
    let router = endpoints::public::router(ctx.clone());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], ctx.config.port));

    if let Err(e) = axum_server::bind(addr).serve(router.into_make_service()).await {
        log::error!("public listener failed: {e}");
    }
}

/// Installs `SIGINT`/`SIGTERM`/`SIGHUP` handlers that each flip one shared
/// `AtomicBool`, then polls that flag from a background thread and cancels
/// `cancel` once it flips — the handlers themselves do nothing async-unsafe.
fn install_signal_handlers(cancel: CancellationToken) -> anyhow::Result<()> {
    let received = Arc::new(std::sync::atomic::AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, received.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, received.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGHUP, received.clone())?;

    std::thread::spawn(move || {
        while !received.load(std::sync::atomic::Ordering::Relaxed) {
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
        cancel.cancel();
    });
    Ok(())
}

fn write_pid_file() -> Result<(), AppError> {
    std::fs::write("/tmp/loolwsd.pid", std::process::id().to_string())
        .map_err(|e| AppError::Config(format!("cannot write PID file: {e}")))
}

/// Delete every direct child directory of `childroot`, including `pipe/` —
/// the worn-out jails of this run, and the FIFOs a fresh `ensure_pipes` call
/// recreates on the next startup.
fn cleanup_childroot(childroot: &std::path::Path) {
    let Ok(entries) = std::fs::read_dir(childroot) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Err(e) = std::fs::remove_dir_all(&path) {
                log::warn!("failed to remove jail directory {}: {e}", path.display());
            }
        }
    }
}
