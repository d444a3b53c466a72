use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use webhook_batcher::batch::{Batcher, BatcherOptions, Dispatcher, RetryPolicy};
use webhook_batcher::config::Config;
use webhook_batcher::metrics::Metrics;
use webhook_batcher::server::{self, AppState};

/// Collects webhook events and forwards them downstream in batches.
#[derive(Parser)]
#[command(name = "webhook-batcher", about)]
struct Cli {
    /// Dotenv file used to seed the environment (ignored when missing).
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!(
            "webhook-batcher {} ({}/{})",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
            std::env::consts::ARCH,
        );
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = Config::from_env(&cli.env_file).context("loading configuration")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to register SIGTERM handler");
                        return;
                    }
                };

            tokio::select! {
                _ = ctrl_c => {
                    tracing::info!("received SIGINT, shutting down");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                }
            }

            cancel.cancel();
        });
    }

    let metrics = Arc::new(Metrics::new().context("creating metrics")?);
    let dispatcher = Dispatcher::new(&cfg.endpoint, RetryPolicy::default(), Arc::clone(&metrics))
        .context("creating dispatcher")?;
    let (batcher, fatal_rx) =
        Batcher::new(BatcherOptions::from(&cfg), dispatcher, Arc::clone(&metrics));
    let batcher = Arc::new(batcher);

    let listener = server::bind(cfg.port).await?;

    let timer = {
        let batcher = Arc::clone(&batcher);
        let cancel = cancel.clone();
        tokio::spawn(async move { batcher.run_interval(cancel).await })
    };

    let state = Arc::new(AppState {
        batcher: Arc::clone(&batcher),
        metrics,
    });
    let app = server::router(state, cfg.development);

    tracing::info!(
        port = cfg.port,
        endpoint = %cfg.endpoint,
        batch_size = cfg.batch_size,
        batch_interval = ?cfg.batch_interval,
        max_in_flight = cfg.max_in_flight,
        development = cfg.development,
        "application started",
    );

    let result = server::run(listener, app, cancel.clone(), fatal_rx).await;

    cancel.cancel();
    if let Err(e) = timer.await {
        tracing::warn!(error = %e, "interval trigger task join failed");
    }

    if result.is_ok() {
        tracing::info!(
            dropped = batcher.buffered(),
            "webhook-batcher stopped"
        );
    }

    result
}
