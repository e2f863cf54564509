//! Worker pool
//!
//! A fixed number of workers, each a tokio task that repeatedly takes the
//! next pending job, runs the fetcher against it and records the outcome.
//! Because each worker drives one job at a time, at most `pool_size` jobs are
//! ever `Running`.
//!
//! Retry delays are served by short-lived timer tasks, so a job waiting out
//! its backoff never occupies a worker.

use grabx_core::{GrabFailure, JobId, JobState, Payload, Target, Transition};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::fetcher::{FetchContext, Fetcher, ProgressReporter};
use crate::registry::JobRegistry;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::scheduler::queue::PendingQueue;

/// Cancellation tokens of the attempts currently in flight
#[derive(Default)]
struct Inflight {
    tokens: Mutex<HashMap<JobId, CancellationToken>>,
}

impl Inflight {
    fn insert(&self, id: JobId, token: CancellationToken) {
        self.lock().insert(id, token);
    }

    fn remove(&self, id: JobId) {
        self.lock().remove(&id);
    }

    fn cancel(&self, id: JobId) -> bool {
        match self.lock().get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// State shared by every worker of a pool
struct WorkerShared {
    registry: Arc<JobRegistry>,
    queue: Arc<PendingQueue>,
    fetcher: Arc<dyn Fetcher>,
    policy: RetryPolicy,
    fetch_timeout: Option<Duration>,
    inflight: Inflight,
    /// Parent of every attempt's token; cancelled on shutdown
    shutdown: CancellationToken,
}

/// Fixed-size set of workers consuming the pending queue
pub struct WorkerPool {
    shared: Arc<WorkerShared>,
    size: usize,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns `size` workers on the current tokio runtime
    pub fn start(
        size: usize,
        registry: Arc<JobRegistry>,
        queue: Arc<PendingQueue>,
        fetcher: Arc<dyn Fetcher>,
        policy: RetryPolicy,
        fetch_timeout: Option<Duration>,
        shutdown: CancellationToken,
    ) -> Self {
        let shared = Arc::new(WorkerShared {
            registry,
            queue,
            fetcher,
            policy,
            fetch_timeout,
            inflight: Inflight::default(),
            shutdown,
        });

        let handles = (0..size)
            .map(|worker| tokio::spawn(Arc::clone(&shared).run(worker)))
            .collect();

        info!("Started worker pool with {} worker(s)", size);

        Self {
            shared,
            size,
            handles: tokio::sync::Mutex::new(handles),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Signals the in-flight attempt of `id` to stop
    ///
    /// Returns `false` if no attempt of that job is in flight.
    pub fn cancel_running(&self, id: JobId) -> bool {
        self.shared.inflight.cancel(id)
    }

    /// Waits for every worker to exit
    ///
    /// Workers exit once the queue is closed and their current job is done.
    pub async fn join(&self) {
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                warn!("Worker task panicked: {}", e);
            }
        }
    }
}

impl WorkerShared {
    async fn run(self: Arc<Self>, worker: usize) {
        debug!("Worker {} started", worker);

        while let Some(id) = self.queue.pop().await {
            self.execute_job(worker, id).await;
        }

        debug!("Worker {} stopped", worker);
    }

    /// Runs one attempt of a job and records its outcome
    async fn execute_job(self: &Arc<Self>, worker: usize, id: JobId) {
        // Register the token before the job becomes Running so a concurrent
        // cancel always finds it
        let token = self.shutdown.child_token();
        self.inflight.insert(id, token.clone());

        let job = match self.registry.transition(id, Transition::Start) {
            Ok(job) => job,
            Err(e) => {
                self.inflight.remove(id);
                debug!("Worker {} skipping job {}: {}", worker, id, e);
                return;
            }
        };

        info!(
            "Worker {} starting job {} (attempt {}/{}): {}",
            worker,
            id,
            job.attempt,
            self.policy.max_attempts(),
            job.target
        );

        let ctx = FetchContext::new(
            id,
            job.attempt,
            token.clone(),
            ProgressReporter::new(Arc::clone(&self.registry), id, job.attempt),
        );
        let outcome = self.run_fetcher(job.target, ctx, &token).await;
        self.inflight.remove(id);

        let policy = &self.policy;
        let mut retry_delay = None;
        let recorded = self.registry.update(id, |current| {
            if current.cancel_requested {
                return Transition::Cancel;
            }
            match outcome {
                Ok(payload) => Transition::Succeed(payload),
                Err(failure) => match policy.decide_failure(current.attempt, &failure) {
                    RetryDecision::RetryAfter(delay) => {
                        retry_delay = Some(delay);
                        Transition::Retry(failure)
                    }
                    RetryDecision::GiveUp => Transition::Fail(failure),
                },
            }
        });

        let job = match recorded {
            Ok(job) => job,
            Err(e) => {
                error!("Failed to record outcome of job {}: {}", id, e);
                return;
            }
        };

        match job.state {
            JobState::Succeeded => info!("Job {} succeeded after {} attempt(s)", id, job.attempt),
            JobState::Cancelled => info!("Job {} cancelled during attempt {}", id, job.attempt),
            JobState::Failed => warn!(
                "Job {} failed after {} attempt(s): {}",
                id,
                job.attempt,
                job.last_error
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default()
            ),
            JobState::Pending => {
                if let Some(delay) = retry_delay {
                    warn!(
                        "Job {} attempt {} failed, retrying in {:?}: {}",
                        id,
                        job.attempt,
                        delay,
                        job.last_error
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_default()
                    );
                    self.schedule_retry(id, delay);
                }
            }
            JobState::Running => {}
        }
    }

    /// Runs the fetcher in its own task so a panic only fails this job
    async fn run_fetcher(
        &self,
        target: Target,
        ctx: FetchContext,
        token: &CancellationToken,
    ) -> Result<Payload, GrabFailure> {
        let id = ctx.job_id;
        let fetcher = Arc::clone(&self.fetcher);
        let mut handle = tokio::spawn(async move { fetcher.fetch(&target, ctx).await });

        let joined = match self.fetch_timeout {
            None => handle.await,
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(
                        "Job {} exceeded fetch timeout of {:?}, cancelling attempt",
                        id, limit
                    );
                    token.cancel();
                    // The attempt keeps its worker until the fetcher stops
                    if let Err(e) = handle.await {
                        debug!("Timed-out fetch task for job {} ended abnormally: {}", id, e);
                    }
                    return Err(GrabFailure::transient(format!("timed out after {:?}", limit)));
                }
            },
        };

        match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                error!("Fetcher panicked while processing job {}", id);
                Err(GrabFailure::permanent("fetcher panicked"))
            }
            Err(e) => Err(GrabFailure::permanent(format!("fetch task aborted: {}", e))),
        }
    }

    /// Re-enqueues a job once its backoff has elapsed
    fn schedule_retry(&self, id: JobId, delay: Duration) {
        let queue = Arc::clone(&self.queue);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = queue.push_retry(id) {
                        debug!("Could not re-enqueue job {}: {:?}", id, e);
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("Dropping scheduled retry of job {} on shutdown", id);
                }
            }
        });
    }
}
