//! Engine configuration
//!
//! Defines the tunables of the grab engine: worker count, retry behaviour,
//! queue bounding and the per-attempt timeout.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{EngineError, Result};

/// What `submit` does when a bounded pending queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueFullPolicy {
    /// Fail the submission with `EngineError::QueueFull`
    #[default]
    Reject,
    /// Wait until a worker frees a queue slot
    Block,
}

impl FromStr for QueueFullPolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "block" => Ok(Self::Block),
            other => Err(EngineError::InvalidConfig(format!(
                "unknown queue-full policy '{}' (expected 'reject' or 'block')",
                other
            ))),
        }
    }
}

/// Engine configuration
///
/// All limits and delays are configurable so the engine can be tuned for
/// different workloads (a handful of large downloads vs many small pages).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of concurrent workers
    pub pool_size: usize,

    /// Attempts allowed per job, including the first
    pub max_attempts: u32,

    /// Delay before the first retry; doubles on every further retry
    pub backoff_base: Duration,

    /// Upper bound on the retry delay
    pub backoff_cap: Duration,

    /// Maximum number of jobs waiting in the pending queue (`None` = unbounded)
    pub queue_bound: Option<usize>,

    /// Behaviour of `submit` when `queue_bound` is reached
    pub queue_full: QueueFullPolicy,

    /// Maximum time one attempt may run before it is cancelled and counted as transient
    pub fetch_timeout: Option<Duration>,
}

impl EngineConfig {
    /// Creates configuration from environment variables
    ///
    /// Recognised environment variables (all optional):
    /// - GRABX_POOL_SIZE (default: 8)
    /// - GRABX_MAX_ATTEMPTS (default: 3)
    /// - GRABX_BACKOFF_BASE_MS (default: 500)
    /// - GRABX_BACKOFF_CAP_MS (default: 30000)
    /// - GRABX_QUEUE_BOUND (default: unbounded)
    /// - GRABX_QUEUE_FULL (`reject` or `block`, default: reject)
    /// - GRABX_FETCH_TIMEOUT_SECS (default: none)
    ///
    /// A variable that is set but cannot be parsed is an error rather than
    /// being silently replaced by the default.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = parse_var::<usize>(&lookup, "GRABX_POOL_SIZE")? {
            config.pool_size = v;
        }
        if let Some(v) = parse_var::<u32>(&lookup, "GRABX_MAX_ATTEMPTS")? {
            config.max_attempts = v;
        }
        if let Some(v) = parse_var::<u64>(&lookup, "GRABX_BACKOFF_BASE_MS")? {
            config.backoff_base = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<u64>(&lookup, "GRABX_BACKOFF_CAP_MS")? {
            config.backoff_cap = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<usize>(&lookup, "GRABX_QUEUE_BOUND")? {
            config.queue_bound = Some(v);
        }
        if let Some(v) = parse_var::<QueueFullPolicy>(&lookup, "GRABX_QUEUE_FULL")? {
            config.queue_full = v;
        }
        if let Some(v) = parse_var::<u64>(&lookup, "GRABX_FETCH_TIMEOUT_SECS")? {
            config.fetch_timeout = Some(Duration::from_secs(v));
        }

        Ok(config)
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    pub fn with_queue_bound(mut self, bound: usize, policy: QueueFullPolicy) -> Self {
        self.queue_bound = Some(bound);
        self.queue_full = policy;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(invalid("pool_size must be greater than 0"));
        }

        if self.max_attempts == 0 {
            return Err(invalid("max_attempts must be greater than 0"));
        }

        if self.backoff_base.is_zero() {
            return Err(invalid("backoff_base must be greater than 0"));
        }

        if self.backoff_cap < self.backoff_base {
            return Err(invalid("backoff_cap must not be smaller than backoff_base"));
        }

        if self.queue_bound == Some(0) {
            return Err(invalid("queue_bound must be greater than 0 when set"));
        }

        if self.fetch_timeout.is_some_and(|t| t.is_zero()) {
            return Err(invalid("fetch_timeout must be greater than 0 when set"));
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            queue_bound: None,
            queue_full: QueueFullPolicy::Reject,
            fetch_timeout: None,
        }
    }
}

fn invalid(message: &str) -> EngineError {
    EngineError::InvalidConfig(message.to_string())
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| EngineError::InvalidConfig(format!("{} has invalid value '{}'", key, raw))),
    }
}
