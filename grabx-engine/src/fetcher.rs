//! Fetcher capability
//!
//! The engine never retrieves anything itself. Callers inject a [`Fetcher`]
//! that performs one attempt for one target and returns either a payload or a
//! classified [`GrabFailure`]. Cancellation is cooperative: the fetcher gets a
//! token in its [`FetchContext`] and is expected to stop at its next
//! checkpoint once the token fires.

use async_trait::async_trait;
use grabx_core::{GrabFailure, JobId, Payload, Progress, Target};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::registry::JobRegistry;

/// Performs one grab attempt
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Retrieves `target`
    ///
    /// # Arguments
    /// * `target` - What to grab
    /// * `ctx` - Job identity, the cancellation signal and the progress sink
    ///
    /// # Returns
    /// The payload to store on the job, or a failure classified as transient
    /// (eligible for retry) or permanent
    async fn fetch(&self, target: &Target, ctx: FetchContext) -> Result<Payload, GrabFailure>;
}

/// Per-attempt context handed to a fetcher
#[derive(Clone)]
pub struct FetchContext {
    pub job_id: JobId,
    /// Attempt number, starting at 1
    pub attempt: u32,
    cancel: CancellationToken,
    progress: ProgressReporter,
}

impl FetchContext {
    pub(crate) fn new(
        job_id: JobId,
        attempt: u32,
        cancel: CancellationToken,
        progress: ProgressReporter,
    ) -> Self {
        Self {
            job_id,
            attempt,
            cancel,
            progress,
        }
    }

    /// Whether the attempt should stop
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the attempt should stop
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn report_progress(&self, progress: Progress) {
        self.progress.report(progress);
    }
}

/// Forwards progress of one attempt to the registry
#[derive(Clone)]
pub struct ProgressReporter {
    registry: Arc<JobRegistry>,
    job_id: JobId,
    attempt: u32,
}

impl ProgressReporter {
    pub(crate) fn new(registry: Arc<JobRegistry>, job_id: JobId, attempt: u32) -> Self {
        Self {
            registry,
            job_id,
            attempt,
        }
    }

    /// Records progress; reports for a finished or superseded attempt are dropped
    pub fn report(&self, progress: Progress) {
        match self.registry.record_progress(self.job_id, self.attempt, progress) {
            Ok(true) => {}
            Ok(false) => debug!(
                "Dropping stale progress for job {} attempt {}",
                self.job_id, self.attempt
            ),
            Err(e) => debug!("Dropping progress for job {}: {}", self.job_id, e),
        }
    }
}

/// Adapts an async closure into a [`Fetcher`]
pub struct FnFetcher<F> {
    f: F,
}

/// Builds a fetcher from `|target, ctx| async move { ... }`
pub fn fetcher_fn<F, Fut>(f: F) -> FnFetcher<F>
where
    F: Fn(Target, FetchContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload, GrabFailure>> + Send,
{
    FnFetcher { f }
}

#[async_trait]
impl<F, Fut> Fetcher for FnFetcher<F>
where
    F: Fn(Target, FetchContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload, GrabFailure>> + Send,
{
    async fn fetch(&self, target: &Target, ctx: FetchContext) -> Result<Payload, GrabFailure> {
        (self.f)(target.clone(), ctx).await
    }
}
