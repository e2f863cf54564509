//! GrabX CLI
//!
//! Downloads a batch of media URLs with yt-dlp through the GrabX engine.
//!
//! Architecture:
//! - Configuration: engine settings from the environment, overridden by flags
//! - Fetcher: runs the downloader per attempt and reports its progress
//! - Output: live state changes and progress, then a summary
//!
//! Every URL is submitted up front; the engine runs them with bounded
//! parallelism and retries transient failures. Ctrl-C cancels whatever is
//! still unfinished.

mod config;
mod fetcher;
mod output;
mod progress;

use anyhow::{Context, Result};
use clap::Parser;
use grabx_engine::Orchestrator;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{EngineArgs, GrabOptions, collect_urls, load_engine_config};
use crate::fetcher::CommandFetcher;

#[derive(Parser)]
#[command(name = "grabx")]
#[command(about = "GrabX batch media downloader", long_about = None)]
struct Cli {
    /// URLs to download
    urls: Vec<String>,

    /// File with one URL per line
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Directory downloads are written to
    #[arg(short, long, env = "GRABX_OUTPUT_DIR", default_value = ".")]
    output_dir: PathBuf,

    /// Extract audio only
    #[arg(short, long)]
    audio: bool,

    /// Video height such as 720p, or audio format such as mp3
    #[arg(short, long)]
    quality: Option<String>,

    /// Downloader executable
    #[arg(long, env = "GRABX_PROGRAM", default_value = "yt-dlp")]
    program: PathBuf,

    #[command(flatten)]
    engine: EngineArgs,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "grabx=info,grabx_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let engine_config = load_engine_config(&cli.engine)?;
    info!(
        "Loaded configuration: pool_size={}, max_attempts={}, program={}",
        engine_config.pool_size,
        engine_config.max_attempts,
        cli.program.display()
    );

    let urls = collect_urls(&cli.urls, cli.input.as_deref())?;
    if urls.is_empty() {
        anyhow::bail!("No URLs given; pass them as arguments or with --input");
    }

    let grab = GrabOptions {
        output_dir: cli.output_dir,
        audio_only: cli.audio,
        quality: cli.quality,
    };

    let orchestrator = Orchestrator::with_fetcher(engine_config, CommandFetcher::new(cli.program))
        .context("Failed to start engine")?;

    // Subscribe before submitting so no transition is missed
    let (stop_tx, stop_rx) = oneshot::channel();
    let printer = tokio::spawn(output::watch(
        orchestrator.registry().clone(),
        orchestrator.subscribe(),
        orchestrator.subscribe_progress(),
        stop_rx,
    ));

    let mut rejected = 0;
    for url in &urls {
        if let Err(e) = orchestrator.submit(grab.target(url)).await {
            error!("Could not queue {}: {}", url, e);
            rejected += 1;
        }
    }
    info!("Queued {} of {} URL(s)", urls.len() - rejected, urls.len());

    let interrupted = run(&orchestrator).await?;

    let _ = stop_tx.send(());
    if let Err(e) = printer.await {
        warn!("Output task panicked: {}", e);
    }

    let jobs = orchestrator.snapshot_all();
    output::print_summary(&jobs);

    let counts = orchestrator.counts();
    Ok(if interrupted {
        ExitCode::from(130)
    } else if counts.failed > 0 || rejected > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Drains the engine, or cancels everything on Ctrl-C
///
/// # Returns
/// Whether the run was interrupted
async fn run(orchestrator: &Orchestrator) -> Result<bool> {
    tokio::select! {
        result = orchestrator.shutdown(true) => {
            result.context("Engine shutdown failed")?;
            Ok(false)
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Failed to listen for Ctrl-C, waiting for downloads: {}", e);
                orchestrator
                    .shutdown(true)
                    .await
                    .context("Engine shutdown failed")?;
                return Ok(false);
            }
            warn!("Interrupted, cancelling unfinished downloads");
            orchestrator
                .shutdown(false)
                .await
                .context("Engine shutdown failed")?;
            Ok(true)
        }
    }
}
