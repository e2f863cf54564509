//! Pending queue
//!
//! Holds the ids of jobs waiting for a worker. Jobs are dequeued in
//! submission order: ids are allocated monotonically, so the smallest queued
//! id is always the earliest submission. A retried job re-enters at its
//! original position rather than behind newer submissions.

use grabx_core::JobId;
use std::collections::BTreeSet;
use std::pin::pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Why a push was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    Full { bound: usize },
    Closed,
}

struct QueueState {
    ids: BTreeSet<JobId>,
    closed: bool,
}

/// Shared FIFO of pending job ids with an optional bound
pub struct PendingQueue {
    state: Mutex<QueueState>,
    bound: Option<usize>,
    /// Signalled when an id is pushed or the queue closes
    available: Notify,
    /// Signalled when an id leaves the queue or the queue closes
    space: Notify,
}

impl PendingQueue {
    pub fn new(bound: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                ids: BTreeSet::new(),
                closed: false,
            }),
            bound,
            available: Notify::new(),
            space: Notify::new(),
        }
    }

    /// Enqueues a new submission, failing immediately if the queue is full
    pub fn push(&self, id: JobId) -> Result<(), PushError> {
        self.push_inner(id, true)
    }

    /// Enqueues a new submission, waiting for room if the queue is full
    pub async fn push_wait(&self, id: JobId) -> Result<(), PushError> {
        loop {
            let mut space = pin!(self.space.notified());
            space.as_mut().enable();

            match self.push_inner(id, true) {
                Err(PushError::Full { .. }) => space.await,
                other => return other,
            }
        }
    }

    /// Re-enqueues a job whose retry delay has elapsed
    ///
    /// Retries ignore the bound; the job was admitted when it was submitted.
    pub fn push_retry(&self, id: JobId) -> Result<(), PushError> {
        self.push_inner(id, false)
    }

    fn push_inner(&self, id: JobId, bounded: bool) -> Result<(), PushError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(PushError::Closed);
            }
            if let (true, Some(bound)) = (bounded, self.bound) {
                if state.ids.len() >= bound {
                    return Err(PushError::Full { bound });
                }
            }
            state.ids.insert(id);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Waits for the next job id
    ///
    /// Returns `None` once the queue is closed, even if ids remain queued.
    pub async fn pop(&self) -> Option<JobId> {
        loop {
            let mut available = pin!(self.available.notified());
            available.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(id) = state.ids.pop_first() {
                    drop(state);
                    self.space.notify_one();
                    return Some(id);
                }
            }

            available.await;
        }
    }

    /// Drops a queued id; returns whether it was queued
    pub fn remove(&self, id: JobId) -> bool {
        let removed = self.lock().ids.remove(&id);
        if removed {
            self.space.notify_one();
        }
        removed
    }

    /// Stops the queue; waiting workers and blocked submitters are released
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_waiters();
        self.space.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pops_in_submission_order() {
        let queue = PendingQueue::new(None);
        for id in [3, 1, 2] {
            queue.push(JobId(id)).unwrap();
        }

        assert_eq!(queue.pop().await, Some(JobId(1)));
        assert_eq!(queue.pop().await, Some(JobId(2)));
        assert_eq!(queue.pop().await, Some(JobId(3)));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_retry_reenters_at_original_position() {
        let queue = PendingQueue::new(None);
        queue.push(JobId(5)).unwrap();
        queue.push(JobId(6)).unwrap();
        queue.push_retry(JobId(2)).unwrap();

        assert_eq!(queue.pop().await, Some(JobId(2)));
    }

    #[test]
    fn test_bound_rejects_but_retries_bypass() {
        let queue = PendingQueue::new(Some(1));
        queue.push(JobId(1)).unwrap();

        assert_eq!(queue.push(JobId(2)), Err(PushError::Full { bound: 1 }));
        assert_eq!(queue.push_retry(JobId(3)), Ok(()));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_push_wait_resumes_when_space_frees() {
        let queue = Arc::new(PendingQueue::new(Some(1)));
        queue.push(JobId(1)).unwrap();

        let blocked = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.push_wait(JobId(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        assert_eq!(queue.pop().await, Some(JobId(1)));
        assert_eq!(blocked.await.unwrap(), Ok(()));
        assert_eq!(queue.pop().await, Some(JobId(2)));
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(PendingQueue::new(None));

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(JobId(9)).unwrap();

        assert_eq!(waiter.await.unwrap(), Some(JobId(9)));
    }

    #[tokio::test]
    async fn test_close_releases_waiters() {
        let queue = Arc::new(PendingQueue::new(Some(1)));
        queue.push(JobId(1)).unwrap();

        let submitter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.push_wait(JobId(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.close();

        assert_eq!(submitter.await.unwrap(), Err(PushError::Closed));
        assert_eq!(queue.pop().await, None);
        assert_eq!(queue.push_retry(JobId(3)), Err(PushError::Closed));
    }

    #[test]
    fn test_remove() {
        let queue = PendingQueue::new(None);
        queue.push(JobId(1)).unwrap();

        assert!(queue.remove(JobId(1)));
        assert!(!queue.remove(JobId(1)));
        assert!(queue.is_empty());
    }
}
