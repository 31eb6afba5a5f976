//! scheduler-worker: one watchpost scheduler instance.
//!
//! Claims jobs from the shared PostgreSQL table, runs them on their
//! recurrence and releases them on SIGINT/SIGTERM. Exits with `1` when the
//! release failed and a recovery dump was written instead.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use watchpost_core::config::{load_dotenv, Config};
use watchpost_notify::{available_strategies, AlertDispatcher};
use watchpost_scheduler::{Callbacks, HttpExecutor, Scheduler};
use watchpost_storage::{PgStorage, SchedulerStorage};

// ── CLI ─────────────────────────────────────────────────────────────

/// Watchpost scheduler instance. Flags override the environment.
#[derive(Parser, Debug)]
#[command(name = "scheduler-worker", version, about)]
struct Cli {
    /// Instance name written to `claimed_by`.
    #[arg(long)]
    app_name: Option<String>,

    /// Maximum number of jobs this instance owns at once.
    #[arg(long)]
    max_jobs: Option<usize>,

    /// Seconds between claim attempts.
    #[arg(long)]
    poll_interval_seconds: Option<u64>,

    /// Where to write the recovery dump if jobs cannot be released.
    #[arg(long)]
    dump_path: Option<PathBuf>,

    /// Apply database migrations before starting.
    #[arg(long)]
    migrate: bool,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(name) = self.app_name {
            config.scheduler.app_name = name;
        }
        if let Some(max) = self.max_jobs {
            config.scheduler.max_jobs = max;
        }
        if let Some(secs) = self.poll_interval_seconds {
            config.scheduler.poll_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(path) = self.dump_path {
            config.scheduler.dump_path = path;
        }
    }
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "scheduler-worker failed to start");
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> anyhow::Result<i32> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let migrate = cli.migrate;
    let mut config = Config::from_env();
    cli.apply(&mut config);
    config.log_summary();

    let storage = PgStorage::connect(&config.postgres, config.scheduler.app_name.clone())
        .await
        .context("connecting to postgres")?;
    if migrate {
        storage.migrate().await.context("running migrations")?;
        info!("migrations applied");
    }
    let storage: Arc<dyn SchedulerStorage> = Arc::new(storage);

    let alerts = AlertDispatcher::new(
        available_strategies(config.scheduler.http_timeout),
        &config.alerts.channels,
    );
    info!(strategies = ?alerts.registered(), "alert dispatcher ready");

    let executor = HttpExecutor::new(config.scheduler.http_timeout)
        .context("building HTTP client")?;
    let callbacks = Callbacks::standard(Arc::new(executor), storage.clone(), Arc::new(alerts));

    info!(instance = %config.scheduler.app_name, "scheduler-worker starting");
    let code = Scheduler::new(config.scheduler, storage, callbacks)
        .start(os_signal())
        .await;
    info!(code, "scheduler-worker exited");
    Ok(code)
}

/// Wait for SIGINT or SIGTERM (Unix) or Ctrl+C (cross-platform fallback).
async fn os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => info!("SIGINT received"),
                    _ = sigterm.recv() => info!("SIGTERM received"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "registering signal handlers failed, falling back to ctrl-c");
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "listening for ctrl-c failed, the process can only be killed");
        std::future::pending::<()>().await;
    }
}
