//! Orchestrator
//!
//! The facade front ends talk to. It accepts submissions, owns the worker
//! pool, routes cancellation, exposes snapshots and event subscriptions, and
//! coordinates shutdown.

use grabx_core::{Job, JobId, JobState, ProgressUpdate, StateChange, Target};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, QueueFullPolicy};
use crate::error::{EngineError, RegistryError, Result};
use crate::events::EventStream;
use crate::fetcher::Fetcher;
use crate::registry::{CancelOutcome, JobRegistry, StateCounts};
use crate::retry::RetryPolicy;
use crate::scheduler::{PendingQueue, PushError, WorkerPool};

/// Grab job orchestrator
pub struct Orchestrator {
    config: EngineConfig,
    registry: Arc<JobRegistry>,
    queue: Arc<PendingQueue>,
    pool: WorkerPool,
    accepting: AtomicBool,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Creates an orchestrator over an existing registry and starts its workers
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: EngineConfig,
        registry: Arc<JobRegistry>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(PendingQueue::new(config.queue_bound));

        // Jobs already waiting in the registry go first, oldest id first
        let existing = registry.snapshot_by_state(JobState::Pending);
        for job in &existing {
            if let Err(e) = queue.push_retry(job.id) {
                warn!("Could not queue existing job {}: {:?}", job.id, e);
            }
        }
        if !existing.is_empty() {
            info!("Queued {} pending job(s) from the registry", existing.len());
        }

        let shutdown = CancellationToken::new();
        let pool = WorkerPool::start(
            config.pool_size,
            Arc::clone(&registry),
            Arc::clone(&queue),
            fetcher,
            RetryPolicy::from_config(&config),
            config.fetch_timeout,
            shutdown.clone(),
        );

        info!(
            "Orchestrator started: pool_size={}, max_attempts={}, backoff={:?}..{:?}, queue_bound={:?}",
            config.pool_size,
            config.max_attempts,
            config.backoff_base,
            config.backoff_cap,
            config.queue_bound
        );

        Ok(Self {
            config,
            registry,
            queue,
            pool,
            accepting: AtomicBool::new(true),
            shutdown,
        })
    }

    /// Creates an orchestrator with a fresh registry
    pub fn with_fetcher(config: EngineConfig, fetcher: impl Fetcher + 'static) -> Result<Self> {
        Self::new(config, Arc::new(JobRegistry::new()), Arc::new(fetcher))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    // =============================================================================
    // Submission
    // =============================================================================

    /// Submits a grab and returns its id
    ///
    /// With an unbounded queue this never waits. With a bounded queue a full
    /// queue either rejects the submission or waits for room, depending on
    /// the configured policy.
    pub async fn submit(&self, target: Target) -> Result<JobId> {
        if !self.is_accepting() {
            return Err(EngineError::ShuttingDown);
        }

        let id = self.registry.allocate_id();
        let job = Job::new(id, target, chrono::Utc::now());
        let locator = job.target.locator.clone();
        self.registry.insert(job)?;

        let pushed = match self.config.queue_full {
            QueueFullPolicy::Reject => self.queue.push(id),
            QueueFullPolicy::Block => self.queue.push_wait(id).await,
        };

        if let Err(e) = pushed {
            // Never handed to a worker, so it can go without trace
            if let Err(remove_err) = self.registry.remove(id) {
                warn!("Could not discard unqueued job {}: {}", id, remove_err);
            }
            return Err(match e {
                PushError::Full { bound } => EngineError::QueueFull { bound },
                PushError::Closed => EngineError::ShuttingDown,
            });
        }

        info!("Job {} submitted: {}", id, locator);
        Ok(id)
    }

    /// Submits several grabs in order, stopping at the first error
    pub async fn submit_all(&self, targets: impl IntoIterator<Item = Target>) -> Result<Vec<JobId>> {
        let mut ids = Vec::new();
        for target in targets {
            ids.push(self.submit(target).await?);
        }
        Ok(ids)
    }

    /// Submits a fresh job for the target of a failed or cancelled job
    pub async fn resubmit(&self, id: JobId) -> Result<JobId> {
        let job = self.registry.snapshot(id)?;
        if !matches!(job.state, JobState::Failed | JobState::Cancelled) {
            return Err(RegistryError::InvalidTransition {
                id,
                from: job.state,
                to: JobState::Pending,
            }
            .into());
        }

        let new_id = self.submit(job.target).await?;
        info!("Job {} resubmitted as {}", id, new_id);
        Ok(new_id)
    }

    // =============================================================================
    // Cancellation
    // =============================================================================

    /// Cancels a job
    ///
    /// A pending job is cancelled immediately. A running job is marked for
    /// cancellation and its fetcher is signalled; it becomes `Cancelled` once
    /// the fetcher returns, and is never retried. Cancelling a job twice is a
    /// no-op; cancelling a job that already succeeded or failed is an error.
    pub fn cancel(&self, id: JobId) -> Result<()> {
        match self.registry.request_cancel(id)? {
            CancelOutcome::Cancelled(_) => {
                self.queue.remove(id);
                info!("Job {} cancelled", id);
            }
            CancelOutcome::Requested => {
                let signalled = self.pool.cancel_running(id);
                info!(
                    "Cancellation requested for running job {} (signalled: {})",
                    id, signalled
                );
            }
            CancelOutcome::AlreadyRequested => {
                debug!("Job {} already cancelled", id);
            }
        }
        Ok(())
    }

    /// Cancels every job that has not finished; returns how many were affected
    pub fn cancel_all(&self) -> usize {
        let mut affected = 0;
        for job in self.registry.snapshot_all() {
            if job.is_terminal() || job.cancel_requested {
                continue;
            }
            match self.cancel(job.id) {
                Ok(()) => affected += 1,
                // Finished between the snapshot and the cancel
                Err(e) => debug!("Skipping job {} in cancel_all: {}", job.id, e),
            }
        }
        affected
    }

    // =============================================================================
    // Queries
    // =============================================================================

    pub fn snapshot(&self, id: JobId) -> Result<Job> {
        Ok(self.registry.snapshot(id)?)
    }

    pub fn snapshot_all(&self) -> Vec<Job> {
        self.registry.snapshot_all()
    }

    pub fn counts(&self) -> StateCounts {
        self.registry.counts()
    }

    /// Subscribes to state changes of all jobs, in the order they happen
    pub fn subscribe(&self) -> EventStream<StateChange> {
        self.registry.subscribe()
    }

    /// Current snapshot of all jobs plus a subscription that starts right after it
    pub fn subscribe_with_snapshot(&self) -> (Vec<Job>, EventStream<StateChange>) {
        self.registry.subscribe_with_snapshot()
    }

    pub fn subscribe_progress(&self) -> EventStream<ProgressUpdate> {
        self.registry.subscribe_progress()
    }

    // =============================================================================
    // Housekeeping
    // =============================================================================

    /// Removes a job that is not running
    pub fn remove(&self, id: JobId) -> Result<Job> {
        let job = self.registry.remove(id)?;
        self.queue.remove(id);
        Ok(job)
    }

    /// Removes every finished job
    pub fn clear_finished(&self) -> usize {
        let removed = self.registry.clear_finished();
        if removed > 0 {
            info!("Cleared {} finished job(s)", removed);
        }
        removed
    }

    // =============================================================================
    // Shutdown
    // =============================================================================

    /// Stops the engine
    ///
    /// Submissions are refused from the moment this is called. With
    /// `drain = true`, every job already submitted runs to a terminal state
    /// (including scheduled retries) before the workers stop. With
    /// `drain = false`, every unfinished job is cancelled and this returns
    /// once all workers have observed the cancellation.
    pub async fn shutdown(&self, drain: bool) -> Result<()> {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!("Shutting down (drain: {})", drain);
        }

        if drain {
            self.wait_idle().await;
        } else {
            let cancelled = self.cancel_all();
            info!("Cancelled {} unfinished job(s)", cancelled);
        }

        self.queue.close();
        self.shutdown.cancel();

        // A submission racing with shutdown may have slipped in after the
        // sweep above; nothing will run it now
        let stragglers = self.cancel_all();
        if stragglers > 0 {
            warn!("Cancelled {} job(s) submitted during shutdown", stragglers);
        }

        self.pool.join().await;
        info!("Shutdown complete");
        Ok(())
    }

    async fn wait_idle(&self) {
        let mut events = self.registry.subscribe();
        loop {
            let active = self.registry.counts().active();
            if active == 0 {
                return;
            }
            debug!("Waiting for {} unfinished job(s)", active);
            if events.recv().await.is_none() {
                return;
            }
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.queue.close();
        self.shutdown.cancel();
    }
}
