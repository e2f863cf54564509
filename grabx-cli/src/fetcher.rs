//! yt-dlp backed fetcher
//!
//! Each attempt runs the downloader as a child process, streams its output
//! into progress reports, and classifies a failed run from what it printed.
//! Cancelling the attempt kills the child.

use async_trait::async_trait;
use grabx_core::{GrabFailure, Payload, Target};
use grabx_engine::{FetchContext, Fetcher};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::progress::{OutputTracker, normalize_audio_format, video_format_selector};

/// Target option keys understood by [`CommandFetcher`]
pub mod options {
    pub const OUTPUT_DIR: &str = "output_dir";
    pub const AUDIO_ONLY: &str = "audio_only";
    pub const QUALITY: &str = "quality";
}

/// Fetcher that shells out to a yt-dlp compatible program
pub struct CommandFetcher {
    program: PathBuf,
}

impl CommandFetcher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Command-line arguments for one attempt at `target`
    pub fn build_args(&self, target: &Target) -> Vec<String> {
        let output_dir = Path::new(target.option_str(options::OUTPUT_DIR).unwrap_or("."));
        let audio_only = target.option_bool(options::AUDIO_ONLY).unwrap_or(false);
        let quality = target.option_str(options::QUALITY);

        let mut args: Vec<String> = [
            "--newline",
            "--no-warnings",
            "--progress",
            "--encoding",
            "utf-8",
            "--no-overwrites",
            "--autonumber-start",
            "1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let template = if audio_only {
            "%(title)s [audio] (%(autonumber)d).%(ext)s"
        } else {
            "%(title)s [%(height)sp] (%(autonumber)d).%(ext)s"
        };
        args.push("-o".to_string());
        args.push(output_dir.join(template).to_string_lossy().into_owned());

        if audio_only {
            args.push("-x".to_string());
            args.push("--audio-format".to_string());
            args.push(normalize_audio_format(quality).to_string());
            args.push("-f".to_string());
            args.push("bestaudio/best".to_string());
        } else {
            args.push("-f".to_string());
            args.push(video_format_selector(quality));
        }

        args.push(target.locator.trim().to_string());
        args
    }

    fn spawn(&self, args: &[String]) -> Result<Child, GrabFailure> {
        Command::new(&self.program)
            .args(args)
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                let message = format!("failed to start {}: {}", self.program.display(), e);
                match e.kind() {
                    ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                        GrabFailure::permanent(message)
                    }
                    _ => GrabFailure::transient(message),
                }
            })
    }
}

#[async_trait]
impl Fetcher for CommandFetcher {
    async fn fetch(&self, target: &Target, ctx: FetchContext) -> Result<Payload, GrabFailure> {
        if let Some(dir) = target.option_str(options::OUTPUT_DIR) {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                GrabFailure::permanent(format!("cannot create output directory {}: {}", dir, e))
            })?;
        }

        let args = self.build_args(target);
        debug!("Job {} running {} {:?}", ctx.job_id, self.program.display(), args);

        let mut child = self.spawn(&args)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GrabFailure::transient("downloader stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| GrabFailure::transient("downloader stderr unavailable"))?;

        let mut stdout = BufReader::new(stdout).lines();
        let mut stderr = BufReader::new(stderr).lines();
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut tracker = OutputTracker::new();

        while stdout_open || stderr_open {
            let (from_stdout, line) = tokio::select! {
                _ = ctx.cancelled() => return Err(kill(&mut child, &ctx).await),
                line = stdout.next_line(), if stdout_open => (true, line),
                line = stderr.next_line(), if stderr_open => (false, line),
            };

            match line {
                Ok(Some(line)) => {
                    if let Some(progress) = tracker.observe(&line) {
                        ctx.report_progress(progress);
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => debug!("Job {} stopped reading downloader output: {}", ctx.job_id, e),
            }

            if from_stdout {
                stdout_open = false;
            } else {
                stderr_open = false;
            }
        }

        let exited = tokio::select! {
            _ = ctx.cancelled() => None,
            status = child.wait() => Some(status),
        };
        let Some(status) = exited else {
            return Err(kill(&mut child, &ctx).await);
        };
        let status = status.map_err(|e| {
            GrabFailure::transient(format!("failed to wait for downloader: {}", e))
        })?;

        if !status.success() {
            let failure = tracker.failure(status.code());
            debug!("Job {} downloader failed: {}", ctx.job_id, failure);
            return Err(failure);
        }

        info!(
            "Job {} downloaded {} file(s) from {}",
            ctx.job_id,
            tracker.files().len(),
            target.locator
        );
        Ok(serde_json::json!({
            "target": target.locator,
            "files": tracker.files(),
        }))
    }
}

async fn kill(child: &mut Child, ctx: &FetchContext) -> GrabFailure {
    info!("Job {} cancelled, stopping downloader", ctx.job_id);
    if let Err(e) = child.kill().await {
        warn!("Failed to kill downloader for job {}: {}", ctx.job_id, e);
    }
    GrabFailure::transient("cancelled")
}
