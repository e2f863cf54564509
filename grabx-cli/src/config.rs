//! Configuration module
//!
//! Engine settings come from the environment first; command-line flags
//! override them. Also handles the list of URLs to grab.

use anyhow::{Context, Result};
use clap::Args;
use grabx_core::Target;
use grabx_engine::{EngineConfig, QueueFullPolicy};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fetcher::options;

/// Engine tuning flags
#[derive(Args, Debug, Default)]
pub struct EngineArgs {
    /// Number of downloads running at once
    #[arg(short = 'j', long, env = "GRABX_POOL_SIZE")]
    pub pool_size: Option<usize>,

    /// Attempts per download before giving up
    #[arg(long, env = "GRABX_MAX_ATTEMPTS")]
    pub max_attempts: Option<u32>,

    /// First retry delay in milliseconds
    #[arg(long, env = "GRABX_BACKOFF_BASE_MS")]
    pub backoff_base_ms: Option<u64>,

    /// Longest retry delay in milliseconds
    #[arg(long, env = "GRABX_BACKOFF_CAP_MS")]
    pub backoff_cap_ms: Option<u64>,

    /// Maximum number of queued downloads
    #[arg(long, env = "GRABX_QUEUE_BOUND")]
    pub queue_bound: Option<usize>,

    /// What to do when the queue is full: reject or block
    #[arg(long, env = "GRABX_QUEUE_FULL")]
    pub queue_full: Option<QueueFullPolicy>,

    /// Abort an attempt after this many seconds
    #[arg(long, env = "GRABX_FETCH_TIMEOUT_SECS")]
    pub fetch_timeout_secs: Option<u64>,
}

impl EngineArgs {
    /// Applies the flags that were given on top of `config`
    pub fn apply(&self, mut config: EngineConfig) -> EngineConfig {
        if let Some(pool_size) = self.pool_size {
            config.pool_size = pool_size;
        }
        if let Some(max_attempts) = self.max_attempts {
            config.max_attempts = max_attempts;
        }
        if let Some(ms) = self.backoff_base_ms {
            config.backoff_base = Duration::from_millis(ms);
        }
        if let Some(ms) = self.backoff_cap_ms {
            config.backoff_cap = Duration::from_millis(ms);
        }
        if let Some(bound) = self.queue_bound {
            config.queue_bound = Some(bound);
        }
        if let Some(policy) = self.queue_full {
            config.queue_full = policy;
        }
        if let Some(secs) = self.fetch_timeout_secs {
            config.fetch_timeout = Some(Duration::from_secs(secs));
        }
        config
    }
}

/// Loads engine settings from the environment, then applies flags
pub fn load_engine_config(args: &EngineArgs) -> Result<EngineConfig> {
    let base = EngineConfig::from_env().context("Invalid engine settings in environment")?;
    let config = args.apply(base);
    config.validate().context("Invalid engine settings")?;
    Ok(config)
}

/// How every URL of this run should be grabbed
#[derive(Debug, Clone)]
pub struct GrabOptions {
    pub output_dir: PathBuf,
    pub audio_only: bool,
    pub quality: Option<String>,
}

impl GrabOptions {
    pub fn target(&self, url: &str) -> Target {
        let mut target = Target::new(url)
            .with_option(
                options::OUTPUT_DIR,
                self.output_dir.to_string_lossy().into_owned(),
            )
            .with_option(options::AUDIO_ONLY, self.audio_only);
        if let Some(quality) = &self.quality {
            target = target.with_option(options::QUALITY, quality.clone());
        }
        target
    }
}

/// Collects URLs from the command line and an optional list file
pub fn collect_urls(urls: &[String], input: Option<&Path>) -> Result<Vec<String>> {
    let mut all: Vec<String> = urls
        .iter()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .collect();

    if let Some(path) = input {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read URL list {}", path.display()))?;
        all.extend(parse_url_list(&text));
    }

    Ok(all)
}

/// One URL per line; blank lines and `#` comments are skipped
pub fn parse_url_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}
