//! Job domain types
//!
//! A job is one grab request plus its lifecycle state. The state machine is:
//!
//! ```text
//! Pending -> Running -> Succeeded
//!               |-----> Pending   (transient failure, retry scheduled)
//!               |-----> Failed
//! Pending | Running -> Cancelled
//! ```
//!
//! `Succeeded`, `Failed` and `Cancelled` are terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use super::event::StateChange;
use super::failure::GrabFailure;
use super::progress::Progress;

/// Opaque payload produced by a successful grab
pub type Payload = serde_json::Value;

/// Unique job identifier
///
/// Ids are allocated in submission order, so comparing two ids also compares
/// their submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Succeeded)
                | (Running, Pending)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What to grab
///
/// `locator` is usually a URL. `options` are passed through to the fetcher
/// untouched; the engine never interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub locator: String,
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
}

impl Target {
    pub fn new(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }

    pub fn option_bool(&self, key: &str) -> Option<bool> {
        self.options.get(key).and_then(|v| v.as_bool())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.locator)
    }
}

/// A requested state transition
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// A worker picked the job up; starts a new attempt
    Start,
    /// The fetcher returned a payload
    Succeed(Payload),
    /// The fetcher failed transiently and another attempt will follow
    Retry(GrabFailure),
    /// The fetcher failed and no further attempt will follow
    Fail(GrabFailure),
    Cancel,
}

impl Transition {
    pub fn target_state(&self) -> JobState {
        match self {
            Transition::Start => JobState::Running,
            Transition::Succeed(_) => JobState::Succeeded,
            Transition::Retry(_) => JobState::Pending,
            Transition::Fail(_) => JobState::Failed,
            Transition::Cancel => JobState::Cancelled,
        }
    }
}

/// A transition the state machine does not permit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition for job {id}: {from} -> {to}")]
pub struct InvalidTransition {
    pub id: JobId,
    pub from: JobState,
    pub to: JobState,
}

/// Grab job record
///
/// Jobs are owned by the registry; everything outside it works with clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub target: Target,
    pub state: JobState,
    /// Number of attempts started so far
    pub attempt: u32,
    /// Failure of the most recent attempt, kept while failed or awaiting retry
    pub last_error: Option<GrabFailure>,
    /// Set only once the job has succeeded
    pub result: Option<Payload>,
    pub progress: Option<Progress>,
    /// Cancellation was requested while running; no further attempts are made
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: JobId, target: Target, now: DateTime<Utc>) -> Self {
        Self {
            id,
            target,
            state: JobState::Pending,
            attempt: 0,
            last_error: None,
            result: None,
            progress: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Applies a transition, returning the resulting state change
    ///
    /// The job is left untouched when the transition is not permitted.
    pub fn apply(
        &mut self,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<StateChange, InvalidTransition> {
        let from = self.state;
        let to = transition.target_state();
        if !from.can_transition_to(to) {
            return Err(InvalidTransition {
                id: self.id,
                from,
                to,
            });
        }

        match transition {
            Transition::Start => {
                self.attempt += 1;
                self.progress = None;
                self.started_at = Some(now);
            }
            Transition::Succeed(payload) => {
                self.result = Some(payload);
                self.last_error = None;
                self.completed_at = Some(now);
            }
            Transition::Retry(failure) => {
                self.last_error = Some(failure);
                self.progress = None;
            }
            Transition::Fail(failure) => {
                self.last_error = Some(failure);
                self.completed_at = Some(now);
            }
            Transition::Cancel => {
                self.last_error = None;
                self.completed_at = Some(now);
            }
        }

        self.state = to;
        self.updated_at = now;

        Ok(StateChange {
            id: self.id,
            from,
            to,
            attempt: self.attempt,
            at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(JobId(1), Target::new("https://example.com/a"), Utc::now())
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in JobState::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in JobState::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_start_increments_attempt() {
        let mut job = job();
        let change = job.apply(Transition::Start, Utc::now()).unwrap();

        assert_eq!(change.from, JobState::Pending);
        assert_eq!(change.to, JobState::Running);
        assert_eq!(job.attempt, 1);
        assert!(job.started_at.is_some());
    }

    #[test]
    fn test_success_sets_result_and_clears_error() {
        let mut job = job();
        job.apply(Transition::Start, Utc::now()).unwrap();
        job.apply(Transition::Retry(GrabFailure::transient("timeout")), Utc::now())
            .unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert!(job.last_error.is_some());

        job.apply(Transition::Start, Utc::now()).unwrap();
        job.apply(Transition::Succeed(serde_json::json!({"file": "a.mp4"})), Utc::now())
            .unwrap();

        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.attempt, 2);
        assert!(job.result.is_some());
        assert!(job.last_error.is_none());
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_failure_keeps_last_error() {
        let mut job = job();
        job.apply(Transition::Start, Utc::now()).unwrap();
        job.apply(Transition::Fail(GrabFailure::permanent("bad url")), Utc::now())
            .unwrap();

        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error, Some(GrabFailure::permanent("bad url")));
        assert!(job.result.is_none());
    }

    #[test]
    fn test_invalid_transition_leaves_job_untouched() {
        let mut job = job();
        let before = job.clone();

        let err = job
            .apply(Transition::Succeed(serde_json::json!(1)), Utc::now())
            .unwrap_err();

        assert_eq!(err.from, JobState::Pending);
        assert_eq!(err.to, JobState::Succeeded);
        assert_eq!(job, before);
    }

    #[test]
    fn test_cancel_from_pending_and_running() {
        let mut pending = job();
        assert!(pending.apply(Transition::Cancel, Utc::now()).is_ok());
        assert_eq!(pending.attempt, 0);

        let mut running = job();
        running.apply(Transition::Start, Utc::now()).unwrap();
        assert!(running.apply(Transition::Cancel, Utc::now()).is_ok());
        assert!(running.apply(Transition::Cancel, Utc::now()).is_err());
    }

    #[test]
    fn test_target_options() {
        let target = Target::new("https://example.com/v")
            .with_option("quality", "720p")
            .with_option("audio_only", false);

        assert_eq!(target.option_str("quality"), Some("720p"));
        assert_eq!(target.option_bool("audio_only"), Some(false));
        assert_eq!(target.option_str("missing"), None);
    }
}
