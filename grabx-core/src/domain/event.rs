//! Event types published by the engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{JobId, JobState};
use super::progress::Progress;

/// One successful state transition of one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub id: JobId,
    pub from: JobState,
    pub to: JobState,
    /// Attempt count after the transition
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

/// Progress reported by a fetcher for a running attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub id: JobId,
    pub attempt: u32,
    pub progress: Progress,
}
