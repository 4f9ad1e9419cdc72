//! Entry point: parses the CLI, loads configuration, wires the listener,
//! watcher and orchestrator together over channels, and drives graceful
//! shutdown.
//!
//! Grounded on the grounding example's `storescp` binary for the
//! `clap::Parser` CLI shape and `tracing_subscriber` setup, adapted to this
//! service's two log sinks (application log via `tracing`, transaction log
//! via `netrt_edge::txlog`) and its dependency-injected component wiring in
//! place of the teacher's `lazy_static!` globals (spec.md §9).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Duration;
use tracing::{error, info, warn};

use netrt_edge::config::Config;
use netrt_edge::listener::Listener;
use netrt_edge::orchestrator::Orchestrator;
use netrt_edge::spool::Spool;
use netrt_edge::txlog::{Event, TransactionLog};
use netrt_edge::watcher::Watcher;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "netrt-edge", about = "RT structure-set overlay edge service")]
struct Args {
    /// Path to the YAML configuration document.
    #[arg(long, default_value = "./config.yaml")]
    config: PathBuf,

    /// Enables debug visualisation output (a secondary-capture series with
    /// the mask burned into the pixel data). Unrelated to log verbosity.
    #[arg(long)]
    debug: bool,
}

fn main() {
    let args = Args::parse();

    let mut cfg = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };
    if args.debug {
        cfg.feature_flags.enable_debug_visualisation = true;
    }

    if let Err(e) = init_logging(&cfg) {
        eprintln!("fatal: could not initialise logging: {e}");
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            std::process::exit(1);
        }
    };

    let exit_code = runtime.block_on(run(cfg));
    std::process::exit(exit_code);
}

fn init_logging(cfg: &Config) -> std::io::Result<()> {
    std::fs::create_dir_all(&cfg.directories.logs)?;
    let app_log_path = cfg.directories.logs.join(&cfg.logging.application_log_file);
    let app_log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(app_log_path)?;

    let filter = tracing_subscriber::EnvFilter::try_new(&cfg.logging.level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(app_log_file))
        .json()
        .init();

    Ok(())
}

/// Builds every component, wires them together over channels, and runs
/// until shutdown. Returns the process exit code (spec.md §6: 0 clean
/// shutdown, 2 runtime abort).
async fn run(cfg: Config) -> i32 {
    let spool = Spool::new(cfg.directories.clone());
    if let Err(e) = spool.init() {
        error!(error = %e, "failed to initialise spool");
        return 1;
    }
    if let Err(e) = spool.sweep_deleted_markers() {
        warn!(error = %e, "failed to sweep leftover delete markers");
    }

    let txlog_path = cfg.directories.logs.join(&cfg.logging.transaction_log_file);
    let txlog = match TransactionLog::open(&txlog_path) {
        Ok(log) => Arc::new(log),
        Err(e) => {
            error!(error = %e, "failed to open transaction log");
            return 1;
        }
    };

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (events_tx, mut events_rx) = mpsc::channel(1024);
    let (ready_tx, ready_rx) = mpsc::channel(256);
    let (completed_tx, completed_rx) = mpsc::channel(256);
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<String>(8);

    let listener = Listener::new(
        cfg.dicom_listener.clone(),
        spool.clone(),
        events_tx,
        cfg.concurrency.max_concurrent_associations,
    );
    let watcher = Watcher::new(cfg.watcher.clone(), spool.clone());
    let orchestrator = Arc::new(Orchestrator::new(cfg.clone(), spool.clone(), Arc::clone(&txlog), fatal_tx));

    let events_txlog = Arc::clone(&txlog);
    let mut events_shutdown = shutdown_tx.subscribe();
    let events_task = tokio::spawn(async move {
        let mut seen: HashSet<String> = HashSet::new();
        loop {
            tokio::select! {
                _ = events_shutdown.recv() => return,
                maybe = events_rx.recv() => {
                    match maybe {
                        Some(stored) => {
                            if seen.insert(stored.study_instance_uid.clone()) {
                                events_txlog.record(&stored.study_instance_uid, None, Event::ReceivingStart, None);
                            }
                        }
                        None => return,
                    }
                }
            }
        }
    });

    let listener_shutdown = shutdown_tx.subscribe();
    let mut listener_task = tokio::spawn(async move {
        if let Err(e) = listener.serve(listener_shutdown).await {
            error!(error = %e, "listener exited with an error");
        }
    });

    let working_dir = cfg.directories.working.clone();
    let watcher_shutdown = shutdown_tx.subscribe();
    let mut watcher_task = tokio::spawn(async move {
        if let Err(e) = watcher.run(working_dir, ready_tx, completed_rx, watcher_shutdown).await {
            error!(error = %e, "watcher exited with an error");
        }
    });

    let orchestrator_shutdown = shutdown_tx.subscribe();
    let orchestrator_task = tokio::spawn(async move {
        orchestrator.run(ready_rx, completed_tx, orchestrator_shutdown).await;
    });

    let exit_code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            0
        }
        reason = fatal_rx.recv() => {
            error!(reason = ?reason, "fatal error reported, aborting service");
            2
        }
    };

    let _ = shutdown_tx.send(());

    let grace = tokio::time::sleep(SHUTDOWN_GRACE);
    tokio::pin!(grace);
    tokio::select! {
        _ = async {
            let _ = (&mut listener_task).await;
            let _ = (&mut watcher_task).await;
        } => {}
        _ = &mut grace => {
            warn!("shutdown grace period elapsed, aborting listener and watcher");
            listener_task.abort();
            watcher_task.abort();
        }
    }

    // In-flight pipeline work is never interrupted: wait for the
    // orchestrator to drain on its own, however long that takes.
    let _ = orchestrator_task.await;
    let _ = events_task.await;

    info!("shutdown complete");
    exit_code
}
