//! # Course Telemetry
//!
//! Vehicle-side daemon that tracks transport courses and delivers position
//! samples to the remote collector, queueing them while the network is down.

use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use course_telemetry::config::{Config, LoggingConfig};
use course_telemetry::console::{self, Command, HELP};
use course_telemetry::course::{CourseController, VehicleSession};
use course_telemetry::credential::Credential;
use course_telemetry::network::{NetworkOracle, ReachabilityProbe};
use course_telemetry::store::kv::FileKeyValueStore;
use course_telemetry::store::CoordinateStore;
use course_telemetry::sync::{SyncEngine, SyncOutcome};
use course_telemetry::tracker::source::ReplayPositionSource;
use course_telemetry::tracker::Tracker;
use course_telemetry::transmit::{ReqwestTransport, Transmitter};

/// Config file used when no path is given on the command line.
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// File name prefix for the daily rolling log.
const LOG_FILE_PREFIX: &str = "course-telemetry.log";

/// Set up stdout logging, plus a daily rolling file when `log_dir` is set.
///
/// The returned guard flushes the file writer on drop and must outlive `main`'s work.
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

/// Main entry point.
///
/// # Control Flow
///
/// 1. Load configuration (first argument, or `config/default.toml`) and set up logging
/// 2. Build the pipeline: store, network oracle, transmitter, sync engine, tracker, course controller
/// 3. Spawn the capture loop, the reachability probe and the sync trigger loop
/// 4. Read operator commands from stdin until `quit` or Ctrl+C
/// 5. Signal shutdown and wait for the background loops
///
/// # Errors
///
/// Returns error if the configuration is invalid, the credential variable is
/// unset, or the replay file cannot be read.
#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    let _log_guard = init_logging(&config.logging);
    info!("Course Telemetry v{} starting...", env!("CARGO_PKG_VERSION"));
    info!("Vehicle {} reporting to {}", config.vehicle.number, config.collector.url);

    let credential = Credential::from_env(&config.vehicle.credential_env)
        .context("Vehicle credential is not available")?;

    let backend = Arc::new(FileKeyValueStore::new(&config.storage.data_dir));
    let store = Arc::new(CoordinateStore::new(backend));
    let oracle = Arc::new(NetworkOracle::new(config.network.failure_threshold));
    let transport = Arc::new(ReqwestTransport::new(
        &config.collector.url,
        config.probe_url(),
        config.request_timeout(),
    )?);
    let transmitter = Arc::new(Transmitter::new(
        transport.clone(),
        oracle.clone(),
        config.request_timeout(),
    ));
    let sync = Arc::new(SyncEngine::new(
        store.clone(),
        transmitter.clone(),
        config.sync_settings(),
    ));

    let source = ReplayPositionSource::open(&config.tracking.replay_file)
        .await
        .with_context(|| format!("Failed to open position source {}", config.tracking.replay_file))?;
    info!("Replaying {} position samples", source.len());
    let tracker = Arc::new(Tracker::new(
        Arc::new(source),
        transmitter,
        store.clone(),
        config.capture_interval(),
    ));

    let controller = CourseController::new(
        tracker.clone(),
        tracker.clone(),
        VehicleSession {
            vehicle_number: config.vehicle.number.clone(),
            credential: credential.clone(),
        },
        config.finish_grace(),
    );
    controller.load_courses(config.courses.clone()).await;
    let restored = controller.restore_sessions().await;
    if restored > 0 {
        info!("Resumed {} course(s) from configuration", restored);
    }

    let pending = store.count().await;
    if pending > 0 {
        info!("{} coordinates pending from a previous run", pending);
    }

    let _status_watcher = oracle.on_change(|online| {
        if online {
            println!("network: online");
        } else {
            println!("network: offline, positions will be queued");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let probe: Arc<dyn ReachabilityProbe> = transport;
    let tasks = vec![
        tokio::spawn(tracker.clone().run(shutdown_rx.clone())),
        tokio::spawn(oracle.clone().run_probe(probe, config.probe_settings(), shutdown_rx.clone())),
        tokio::spawn(sync.clone().run(credential.clone(), shutdown_rx)),
    ];

    info!("Ready. Type 'help' for commands, Ctrl+C to exit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => {
                        match console::parse_command(&line) {
                            Ok(Some(Command::Quit)) => {
                                info!("Quit requested, shutting down...");
                                break;
                            }
                            Ok(Some(command)) => {
                                let work = handle_command(command, &controller, &sync, &oracle, &credential);
                                if unless_interrupted(work, interrupted()).await.is_none() {
                                    info!("Received Ctrl+C during a command, shutting down...");
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(message) => println!("{} ({})", message, HELP),
                        }
                    }
                    Ok(None) => {
                        info!("Console input closed; running until Ctrl+C");
                        stdin_open = false;
                    }
                    Err(e) => {
                        warn!("Failed to read console input: {}", e);
                        stdin_open = false;
                    }
                }
            }

            _ = interrupted() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            error!("Background task failed: {}", e);
        }
    }

    let stats = sync.stats().await;
    info!(
        "Stopped with {} coordinates pending ({} synced, {} dropped in total)",
        stats.total_offline, stats.total_synced, stats.sync_errors
    );

    Ok(())
}

/// Completes when Ctrl+C is received.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Runs `work` to completion unless `interrupt` completes first.
async fn unless_interrupted<T>(
    work: impl Future<Output = T>,
    interrupt: impl Future<Output = ()>,
) -> Option<T> {
    tokio::select! {
        output = work => Some(output),
        _ = interrupt => None,
    }
}

/// Execute one console command other than `quit`.
async fn handle_command(
    command: Command,
    controller: &CourseController,
    sync: &SyncEngine,
    oracle: &NetworkOracle,
    credential: &Credential,
) {
    match command {
        Command::SetStatus { course_id, status } => {
            match controller.set_status(&course_id, status).await {
                Ok(previous) => println!("{}: {} -> {}", course_id, previous, status),
                Err(e) => println!("{}: {}", course_id, e),
            }
        }
        Command::Sync => match sync.sync(credential).await {
            SyncOutcome::Completed(report) => println!(
                "sync: {} synced, {} failed, {} dropped of {}",
                report.synced, report.failed, report.evicted, report.total
            ),
            SyncOutcome::AlreadyRunning => println!("sync: already running"),
            SyncOutcome::Offline => println!("sync: offline, nothing sent"),
        },
        Command::Status => {
            let stats = sync.stats().await;
            println!("{}", console::render_status(&oracle.state(), &stats));
        }
        Command::Courses => {
            println!("{}", console::render_courses(&controller.courses().await));
        }
        Command::Logout => {
            controller.clear_all().await;
            println!("logged out: all courses stopped, queued positions kept");
        }
        Command::Help => println!("{}", HELP),
        Command::Quit => {}
    }
}
