//! Job registry
//!
//! The single authoritative store of job state. Every mutation goes through
//! one lock, so operations are linearizable: two updates on the same job are
//! never interleaved, and the state-change events they produce are published
//! while the lock is held, which makes the event order identical to the order
//! in which transitions actually happened.
//!
//! Callers only ever receive cloned snapshots of jobs.

use chrono::Utc;
use grabx_core::{Job, JobId, JobState, Progress, ProgressUpdate, StateChange, Transition};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::RegistryError;
use crate::events::{EventBus, EventStream};

type Result<T> = std::result::Result<T, RegistryError>;

/// Outcome of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was pending and is now cancelled
    Cancelled(StateChange),
    /// The job is running; intent to cancel is recorded and the job will be
    /// cancelled when its current attempt returns
    Requested,
    /// Cancellation was already requested or completed earlier
    AlreadyRequested,
}

/// Number of jobs in each state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StateCounts {
    pub fn get(&self, state: JobState) -> usize {
        match state {
            JobState::Pending => self.pending,
            JobState::Running => self.running,
            JobState::Succeeded => self.succeeded,
            JobState::Failed => self.failed,
            JobState::Cancelled => self.cancelled,
        }
    }

    fn increment(&mut self, state: JobState) {
        let slot = match state {
            JobState::Pending => &mut self.pending,
            JobState::Running => &mut self.running,
            JobState::Succeeded => &mut self.succeeded,
            JobState::Failed => &mut self.failed,
            JobState::Cancelled => &mut self.cancelled,
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.succeeded + self.failed + self.cancelled
    }

    /// Jobs that have not reached a terminal state
    pub fn active(&self) -> usize {
        self.pending + self.running
    }
}

/// Concurrency-safe store of all jobs
pub struct JobRegistry {
    jobs: Mutex<BTreeMap<JobId, Job>>,
    next_id: AtomicU64,
    changes: EventBus<StateChange>,
    progress: EventBus<ProgressUpdate>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            changes: EventBus::new(),
            progress: EventBus::new(),
        }
    }

    /// Hands out a fresh id, never reused for the lifetime of this registry
    pub fn allocate_id(&self) -> JobId {
        JobId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Adds a new pending job
    pub fn insert(&self, job: Job) -> Result<()> {
        if job.state != JobState::Pending {
            return Err(RegistryError::InvalidTransition {
                id: job.id,
                from: job.state,
                to: JobState::Pending,
            });
        }

        let mut jobs = self.lock();
        if jobs.contains_key(&job.id) {
            return Err(RegistryError::DuplicateId(job.id));
        }

        // Keep allocated ids ahead of anything inserted with an explicit id
        self.next_id.fetch_max(job.id.0 + 1, Ordering::Relaxed);
        jobs.insert(job.id, job);
        Ok(())
    }

    /// Atomically applies the transition chosen by `mutation`
    ///
    /// `mutation` sees the current job under the registry lock, so decisions
    /// that depend on the job's state (retry budget, pending cancellation)
    /// cannot race with other updates. Returns a snapshot of the updated job.
    pub fn update<F>(&self, id: JobId, mutation: F) -> Result<Job>
    where
        F: FnOnce(&Job) -> Transition,
    {
        let mut jobs = self.lock();
        let job = jobs.get_mut(&id).ok_or(RegistryError::NotFound(id))?;

        let transition = mutation(job);
        let change = job.apply(transition, Utc::now())?;
        let snapshot = job.clone();

        self.changes.publish(&change);
        Ok(snapshot)
    }

    /// Applies a fixed transition
    pub fn transition(&self, id: JobId, transition: Transition) -> Result<Job> {
        self.update(id, move |_| transition)
    }

    /// Cancels a pending job, or records intent to cancel a running one
    ///
    /// Calling this again on a job that is already cancelled or already
    /// marked for cancellation is a no-op. Jobs that succeeded or failed
    /// cannot be cancelled.
    pub fn request_cancel(&self, id: JobId) -> Result<CancelOutcome> {
        let mut jobs = self.lock();
        let job = jobs.get_mut(&id).ok_or(RegistryError::NotFound(id))?;

        match job.state {
            JobState::Pending => {
                let change = job.apply(Transition::Cancel, Utc::now())?;
                self.changes.publish(&change);
                Ok(CancelOutcome::Cancelled(change))
            }
            JobState::Running if job.cancel_requested => Ok(CancelOutcome::AlreadyRequested),
            JobState::Running => {
                job.cancel_requested = true;
                job.updated_at = Utc::now();
                Ok(CancelOutcome::Requested)
            }
            JobState::Cancelled => Ok(CancelOutcome::AlreadyRequested),
            from @ (JobState::Succeeded | JobState::Failed) => Err(RegistryError::InvalidTransition {
                id,
                from,
                to: JobState::Cancelled,
            }),
        }
    }

    /// Stores progress for the running attempt and publishes it
    ///
    /// Returns `false` when the report is stale: the job is no longer running
    /// or has moved on to another attempt.
    pub fn record_progress(&self, id: JobId, attempt: u32, progress: Progress) -> Result<bool> {
        let mut jobs = self.lock();
        let job = jobs.get_mut(&id).ok_or(RegistryError::NotFound(id))?;

        if job.state != JobState::Running || job.attempt != attempt {
            return Ok(false);
        }

        job.progress = Some(progress.clone());
        job.updated_at = Utc::now();
        self.progress.publish(&ProgressUpdate {
            id,
            attempt,
            progress,
        });
        Ok(true)
    }

    pub fn snapshot(&self, id: JobId) -> Result<Job> {
        self.lock().get(&id).cloned().ok_or(RegistryError::NotFound(id))
    }

    /// Snapshot of every job, ordered by id
    pub fn snapshot_all(&self) -> Vec<Job> {
        self.lock().values().cloned().collect()
    }

    pub fn snapshot_by_state(&self, state: JobState) -> Vec<Job> {
        self.lock()
            .values()
            .filter(|job| job.state == state)
            .cloned()
            .collect()
    }

    pub fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for job in self.lock().values() {
            counts.increment(job.state);
        }
        counts
    }

    /// Removes a job that is not running
    pub fn remove(&self, id: JobId) -> Result<Job> {
        let mut jobs = self.lock();
        match jobs.get(&id) {
            None => Err(RegistryError::NotFound(id)),
            Some(job) if job.state == JobState::Running => Err(RegistryError::InUse(id)),
            Some(_) => jobs.remove(&id).ok_or(RegistryError::NotFound(id)),
        }
    }

    /// Removes every job in a terminal state, returning how many were removed
    pub fn clear_finished(&self) -> usize {
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, job| !job.is_terminal());
        before - jobs.len()
    }

    /// Subscribes to state changes from this point on
    pub fn subscribe(&self) -> EventStream<StateChange> {
        self.changes.subscribe()
    }

    /// Atomically snapshots every job and subscribes to subsequent changes
    ///
    /// No transition can slip between the snapshot and the first event.
    pub fn subscribe_with_snapshot(&self) -> (Vec<Job>, EventStream<StateChange>) {
        let jobs = self.lock();
        let stream = self.changes.subscribe();
        (jobs.values().cloned().collect(), stream)
    }

    pub fn subscribe_progress(&self) -> EventStream<ProgressUpdate> {
        self.progress.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<JobId, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grabx_core::{GrabFailure, Target};
    use std::sync::Arc;

    fn insert_job(registry: &JobRegistry) -> JobId {
        let id = registry.allocate_id();
        registry
            .insert(Job::new(id, Target::new(format!("https://example.com/{}", id.0)), Utc::now()))
            .unwrap();
        id
    }

    #[test]
    fn test_insert_rejects_duplicate_id() {
        let registry = JobRegistry::new();
        let id = insert_job(&registry);

        let err = registry
            .insert(Job::new(id, Target::new("https://example.com/dup"), Utc::now()))
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateId(id));
    }

    #[test]
    fn test_allocated_ids_skip_explicit_inserts() {
        let registry = JobRegistry::new();
        registry
            .insert(Job::new(JobId(10), Target::new("https://example.com"), Utc::now()))
            .unwrap();

        assert_eq!(registry.allocate_id(), JobId(11));
    }

    #[test]
    fn test_update_missing_job() {
        let registry = JobRegistry::new();
        let err = registry.transition(JobId(42), Transition::Start).unwrap_err();
        assert_eq!(err, RegistryError::NotFound(JobId(42)));
    }

    #[test]
    fn test_update_invalid_transition_is_an_error() {
        let registry = JobRegistry::new();
        let id = insert_job(&registry);

        let err = registry
            .transition(id, Transition::Succeed(serde_json::json!("done")))
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::InvalidTransition {
                id,
                from: JobState::Pending,
                to: JobState::Succeeded,
            }
        );
        assert_eq!(registry.snapshot(id).unwrap().state, JobState::Pending);
    }

    #[test]
    fn test_update_publishes_change() {
        let registry = JobRegistry::new();
        let id = insert_job(&registry);
        let mut events = registry.subscribe();

        let job = registry.transition(id, Transition::Start).unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.attempt, 1);

        let change = events.try_recv().unwrap();
        assert_eq!((change.id, change.from, change.to), (id, JobState::Pending, JobState::Running));
        assert!(events.try_recv().is_none());
    }

    #[test]
    fn test_snapshot_is_detached() {
        let registry = JobRegistry::new();
        let id = insert_job(&registry);

        let before = registry.snapshot(id).unwrap();
        registry.transition(id, Transition::Start).unwrap();

        assert_eq!(before.state, JobState::Pending);
        assert_eq!(registry.snapshot(id).unwrap().state, JobState::Running);
    }

    #[test]
    fn test_remove_running_job_is_in_use() {
        let registry = JobRegistry::new();
        let id = insert_job(&registry);
        registry.transition(id, Transition::Start).unwrap();

        assert_eq!(registry.remove(id).unwrap_err(), RegistryError::InUse(id));

        registry
            .transition(id, Transition::Fail(GrabFailure::permanent("gone")))
            .unwrap();
        assert!(registry.remove(id).is_ok());
        assert_eq!(registry.remove(id).unwrap_err(), RegistryError::NotFound(id));
    }

    #[test]
    fn test_request_cancel_pending_then_again() {
        let registry = JobRegistry::new();
        let id = insert_job(&registry);

        assert!(matches!(
            registry.request_cancel(id).unwrap(),
            CancelOutcome::Cancelled(_)
        ));
        assert_eq!(
            registry.request_cancel(id).unwrap(),
            CancelOutcome::AlreadyRequested
        );
        assert_eq!(registry.snapshot(id).unwrap().state, JobState::Cancelled);
    }

    #[test]
    fn test_request_cancel_running_marks_intent() {
        let registry = JobRegistry::new();
        let id = insert_job(&registry);
        registry.transition(id, Transition::Start).unwrap();
        let mut events = registry.subscribe();

        assert_eq!(registry.request_cancel(id).unwrap(), CancelOutcome::Requested);
        assert_eq!(
            registry.request_cancel(id).unwrap(),
            CancelOutcome::AlreadyRequested
        );

        let job = registry.snapshot(id).unwrap();
        assert_eq!(job.state, JobState::Running);
        assert!(job.cancel_requested);
        assert!(events.try_recv().is_none());
    }

    #[test]
    fn test_request_cancel_finished_job_fails() {
        let registry = JobRegistry::new();
        let id = insert_job(&registry);
        registry.transition(id, Transition::Start).unwrap();
        registry
            .transition(id, Transition::Succeed(serde_json::json!({"ok": true})))
            .unwrap();

        assert!(matches!(
            registry.request_cancel(id),
            Err(RegistryError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_record_progress_only_for_current_attempt() {
        let registry = JobRegistry::new();
        let id = insert_job(&registry);
        let mut updates = registry.subscribe_progress();

        assert!(!registry.record_progress(id, 0, Progress::fraction(0.1)).unwrap());

        registry.transition(id, Transition::Start).unwrap();
        assert!(registry.record_progress(id, 1, Progress::fraction(0.5)).unwrap());
        assert!(!registry.record_progress(id, 2, Progress::fraction(0.9)).unwrap());

        let update = updates.try_recv().unwrap();
        assert_eq!(update.progress.fraction, Some(0.5));
        assert!(updates.try_recv().is_none());
        assert_eq!(
            registry.snapshot(id).unwrap().progress,
            Some(Progress::fraction(0.5))
        );
    }

    #[test]
    fn test_counts_and_clear_finished() {
        let registry = JobRegistry::new();
        let done = insert_job(&registry);
        let running = insert_job(&registry);
        let cancelled = insert_job(&registry);
        insert_job(&registry);

        registry.transition(done, Transition::Start).unwrap();
        registry
            .transition(done, Transition::Succeed(serde_json::json!("x")))
            .unwrap();
        registry.transition(running, Transition::Start).unwrap();
        registry.request_cancel(cancelled).unwrap();

        let counts = registry.counts();
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.running, 1);
        assert_eq!(counts.cancelled, 1);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.active(), 2);
        assert_eq!(counts.total(), 4);
        assert_eq!(registry.snapshot_by_state(JobState::Running).len(), 1);

        assert_eq!(registry.clear_finished(), 2);
        assert_eq!(registry.snapshot_all().len(), 2);
    }

    #[test]
    fn test_subscribe_with_snapshot_sees_existing_jobs() {
        let registry = JobRegistry::new();
        let id = insert_job(&registry);

        let (jobs, mut events) = registry.subscribe_with_snapshot();
        assert_eq!(jobs.len(), 1);
        assert!(events.try_recv().is_none());

        registry.transition(id, Transition::Start).unwrap();
        assert_eq!(events.try_recv().unwrap().to, JobState::Running);
    }

    #[test]
    fn test_concurrent_updates_are_serialized() {
        let registry = Arc::new(JobRegistry::new());
        let id = insert_job(&registry);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.transition(id, Transition::Start).is_ok())
            })
            .collect();

        let started = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(started, 1);
        assert_eq!(registry.snapshot(id).unwrap().attempt, 1);
    }
}
